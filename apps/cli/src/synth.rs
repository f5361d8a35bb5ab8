use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use replay_rtp::{PacketKind, RtpPacketBuilder, encode_block, encode_record};
use replay_vod::{ExecutionRef, FileBlockStore};
use tracing::info;
use uuid::Uuid;

const VIDEO_CLOCK_RATE: u32 = 90_000;
const VIDEO_FPS: u32 = 25;
const AUDIO_CLOCK_RATE: u32 = 8_000;
const AUDIO_PACKETS_PER_SECOND: u32 = 50;

const SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=replay synthetic recording\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:trackID=0\r\n\
    m=audio 0 RTP/AVP 8\r\n\
    a=rtpmap:8 PCMA/8000\r\n\
    a=control:trackID=1\r\n";

#[derive(Args)]
pub struct Synth {
    /// Root directory of the block store
    root: PathBuf,
    /// Recording task the execution belongs to (random if omitted)
    #[arg(long)]
    task: Option<String>,
    #[arg(long, default_value_t = 1)]
    execution: i64,
    /// Length of the recording in seconds
    #[arg(long, default_value_t = 10)]
    seconds: u32,
    /// Media seconds stored per block
    #[arg(long, default_value_t = 2)]
    block_seconds: u32,
    /// Recording start as a unix timestamp (now if omitted)
    #[arg(long)]
    start_time: Option<i64>,
}

impl Synth {
    pub fn run(self) -> anyhow::Result<()> {
        let store = FileBlockStore::open(&self.root)
            .with_context(|| format!("Failed to open block store at {}", self.root.display()))?;

        let task = self.task.unwrap_or_else(|| Uuid::new_v4().to_string());
        let execution = ExecutionRef::new(task, self.execution);
        let start_time = self
            .start_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let block_seconds = self.block_seconds.max(1);

        let mut writer = store.create_execution(execution.clone(), SDP)?;

        let video = RtpPacketBuilder::new(96, 0x5652_4f44);
        let audio = RtpPacketBuilder::new(8, 0x4155_4449);
        let mut video_seq = 0u16;
        let mut audio_seq = 0u16;

        for block_start in (0..self.seconds).step_by(block_seconds as usize) {
            let block_end = (block_start + block_seconds).min(self.seconds);
            let mut records = Vec::new();

            for second in block_start..block_end {
                // two audio packets per video frame keeps both tracks interleaved in time
                for frame in 0..VIDEO_FPS {
                    let frame_index = second * VIDEO_FPS + frame;
                    let rtp = video
                        .sequence_number(video_seq)
                        .timestamp(rtp_timestamp(frame_index, VIDEO_CLOCK_RATE, VIDEO_FPS))
                        .marker(true)
                        .build(&synthetic_frame(frame_index));
                    encode_record(&mut records, PacketKind::Video, &rtp);
                    video_seq = video_seq.wrapping_add(1);

                    for half in 0..AUDIO_PACKETS_PER_SECOND / VIDEO_FPS {
                        let packet_index =
                            frame_index * (AUDIO_PACKETS_PER_SECOND / VIDEO_FPS) + half;
                        let rtp = audio
                            .sequence_number(audio_seq)
                            .timestamp(rtp_timestamp(
                                packet_index,
                                AUDIO_CLOCK_RATE,
                                AUDIO_PACKETS_PER_SECOND,
                            ))
                            .build(&[0xd5; 160]);
                        encode_record(&mut records, PacketKind::Audio, &rtp);
                        audio_seq = audio_seq.wrapping_add(1);
                    }
                }
            }

            let id = writer.append_block(start_time + i64::from(block_start), &encode_block(&records))?;
            info!(block_id = id, seconds = block_end - block_start, "Wrote block");
        }

        let blocks = writer.block_count();
        let execution = writer.finish()?;

        println!(
            "Wrote {blocks} blocks to '{}' (task {}, execution {})",
            store.execution_dir(&execution).display(),
            execution.task_id,
            execution.execute_id
        );

        Ok(())
    }
}

/// Timestamp of the `index`th packet sent `per_second` times a second. Wraps like the RTP clock.
fn rtp_timestamp(index: u32, clock_rate: u32, per_second: u32) -> u32 {
    index.wrapping_mul(clock_rate / per_second)
}

/// A fake access unit: NAL header of an IDR slice for every 25th frame, else a non-IDR slice.
fn synthetic_frame(index: u32) -> Vec<u8> {
    let nal = if index % VIDEO_FPS == 0 { 0x65 } else { 0x41 };
    let mut frame = vec![nal];
    frame.extend_from_slice(&index.to_be_bytes());
    frame.resize(64, 0);
    frame
}
