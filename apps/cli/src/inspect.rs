use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use replay_rtp::{PacketKind, RecordReader, block_payload};
use replay_vod::{BlockStore, ExecutionRef, FileBlockStore, TrackSet};

#[derive(Args)]
pub struct Inspect {
    /// Root directory of the block store
    root: PathBuf,
    #[arg(long)]
    task: String,
    #[arg(long, default_value_t = 1)]
    execution: i64,
    /// Block to list
    #[arg(long, default_value_t = 0)]
    block: u64,
    /// Only print the summary
    #[arg(long)]
    quiet: bool,
}

impl Inspect {
    pub fn run(self) -> anyhow::Result<()> {
        let store = FileBlockStore::open(&self.root)?;
        let execution = ExecutionRef::new(self.task, self.execution);

        let description = store.execution(&execution)?;
        let tracks = TrackSet::from_sdp(&description.sdp_raw)
            .context("Recording has a malformed session description")?;

        println!("execution {execution}");
        if let Some(video) = &tracks.video {
            println!("  video   control={} codec={}", video.control, video.codec);
        }
        for audio in tracks.audio.iter().take(tracks.audio_count) {
            println!("  audio   control={} codec={}", audio.control, audio.codec);
        }

        let meta = store.fetch_block_meta(&execution, self.block)?;
        let data = store
            .read_block_payload(&meta)
            .with_context(|| format!("Failed to read block {}", meta.id))?;
        let payload = block_payload(&data)?;

        println!(
            "block {} starts at {} ({} bytes)",
            meta.id, meta.start_time, meta.length
        );

        let mut video = 0usize;
        let mut audio = 0usize;
        let mut other = 0usize;

        for packet in RecordReader::new(payload) {
            let packet = packet.with_context(|| format!("Block {} is corrupt", meta.id))?;

            match packet.kind {
                PacketKind::Video => video += 1,
                PacketKind::Audio => audio += 1,
                PacketKind::AudioControl | PacketKind::VideoControl => other += 1,
            }

            if !self.quiet {
                println!(
                    "  {:<13} pt={:<3} seq={:<5} ts={:<10} marker={} payload={}",
                    format!("{:?}", packet.kind),
                    packet.payload_type(),
                    packet.info.sequence_number,
                    packet.timestamp(),
                    u8::from(packet.info.marker),
                    packet.payload().len()
                );
            }
        }

        println!("{video} video, {audio} audio, {other} control packets");

        Ok(())
    }
}
