use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, anyhow};
use clap::Args;
use replay_vod::{
    ExecutionRef, FileBlockStore, PacketKind, PendingSession, PlayerFanout, RtpPacket,
    SessionRegistry, VodConfig, VodRequest,
};
use tracing::{info, warn};
use uuid::Uuid;

const PLAYER_ID: &str = "cli";

#[derive(Args)]
pub struct Serve {
    /// Root directory of the block store
    root: PathBuf,
    #[arg(long)]
    task: String,
    #[arg(long, default_value_t = 1)]
    execution: i64,
    /// Playback start as a unix timestamp (start of the recording if omitted)
    #[arg(long, default_value_t = 0)]
    start_time: i64,
    /// Playback speed exponent: 1 doubles the speed, -1 halves it
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    scale: i32,
    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,
    /// Consider the recording finished after this many seconds without a packet
    #[arg(long, default_value_t = 3)]
    idle_timeout: u64,
    /// JSON file with session tunables
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Default)]
struct PlaybackStats {
    video: u64,
    audio: u64,
    other: u64,
    bytes: u64,
}

impl PlaybackStats {
    fn record(&mut self, packet: &RtpPacket) {
        match packet.kind {
            PacketKind::Video => self.video += 1,
            PacketKind::Audio => self.audio += 1,
            PacketKind::AudioControl | PacketKind::VideoControl => self.other += 1,
        }
        self.bytes += packet.data.len() as u64;
    }

    fn packets(&self) -> u64 {
        self.video + self.audio + self.other
    }
}

impl Serve {
    pub async fn run(self) -> anyhow::Result<()> {
        let config = match &self.config {
            Some(path) => VodConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => VodConfig::default(),
        };

        let store = Arc::new(FileBlockStore::open(&self.root)?);
        let registry = SessionRegistry::new();
        let execution = ExecutionRef::new(self.task, self.execution);

        let id = Uuid::new_v4().to_string();
        let path = format!(
            "/vod/{}/{}/{}/{id}",
            execution.task_id, execution.execute_id, self.start_time
        );

        let players = Arc::new(PlayerFanout::new(config.player_queue_length));
        let player = players.add_player(PLAYER_ID);

        let session = registry.get_or_create(&path, || {
            let request = VodRequest::new(id.clone(), path.clone(), execution.clone(), self.start_time);
            Ok(PendingSession::resolve(request, store.clone(), config.clone())?
                .with_players(players.clone()))
        })?;

        info!(
            id = %session.id(),
            source = %session.source(),
            video = %session.v_codec(),
            audio = ?session.a_codec(),
            "Serving"
        );

        if self.scale != 0 {
            session.set_scale(self.scale)?;
        }

        let started = Instant::now();
        let idle = Duration::from_secs(self.idle_timeout.max(1));
        let mut stats = PlaybackStats::default();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let deadline = tokio::time::sleep(Duration::from_secs(self.duration.unwrap_or_default()));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Interrupted");
                    break;
                }
                _ = &mut deadline, if self.duration.is_some() => {
                    info!("Playback duration reached");
                    break;
                }
                packet = tokio::time::timeout(idle, player.recv_async()) => match packet {
                    Ok(Ok(packet)) => stats.record(&packet),
                    Ok(Err(_)) => {
                        warn!("Player was detached");
                        break;
                    }
                    Err(_) => {
                        info!(?idle, "No packets received, assuming the recording ended");
                        break;
                    }
                },
            }
        }

        let dropped = players.dropped(PLAYER_ID).unwrap_or_default();
        players.remove_player(PLAYER_ID);

        session.stop();
        let stopped = {
            let session = session.clone();
            tokio::task::spawn_blocking(move || session.wait_stopped_timeout(Duration::from_secs(30)))
                .await?
        };
        if !stopped {
            return Err(anyhow!("Session {} did not stop in time", session.id()));
        }

        println!(
            "Played {} packets ({} video, {} audio, {} bytes, {} dropped) in {:.1?}",
            stats.packets(),
            stats.video,
            stats.audio,
            stats.bytes,
            dropped,
            started.elapsed()
        );
        println!(
            "Session {} started at {} with scale {}",
            session.id(),
            session.start_at().to_rfc3339(),
            session.scale()
        );

        Ok(())
    }
}
