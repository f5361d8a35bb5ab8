mod inspect;
mod serve;
mod synth;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(version, about = "Replay recorded RTP streams in real time")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic recording into a block store directory
    Synth(synth::Synth),
    /// List the packets of one stored block
    Inspect(inspect::Inspect),
    /// Play a recording through a VOD session and report what was delivered
    Serve(serve::Serve),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay=info,replay_vod=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Synth(synth) => synth.run(),
        Commands::Inspect(inspect) => inspect.run(),
        Commands::Serve(serve) => serve.run().await,
    }
}
