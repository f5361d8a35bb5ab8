//! Real-time pacing of recorded packets.
//!
//! Video packets are held back until the wall clock, scaled by the session's playback
//! speed, has caught up with their RTP timestamp. Other packets pass through as soon as
//! video pacing has started.

use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError};
use replay_rtp::{RecordReader, RtpInfo, RtpTimeDuration, block_payload};
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::{
    queue::{DeliveryQueue, Enqueue},
    session::SessionHandle,
    storage::Block,
};

/// Largest accepted playback-speed exponent, in either direction.
pub const MAX_SCALE: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingRules {
    /// Payload types at or above this value are video.
    pub video_payload_type_min: u8,
    pub video_clock_rate: u32,
}

impl Default for PacingRules {
    fn default() -> Self {
        Self {
            video_payload_type_min: 96,
            video_clock_rate: 90_000,
        }
    }
}

impl PacingRules {
    pub fn is_video(&self, payload_type: u8) -> bool {
        payload_type >= self.video_payload_type_min
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingState {
    /// Nothing has been paced yet; packets are consumed until the first video packet.
    SeekFirstVideo,
    /// Video is gated by its timestamp, mapped from the first video packet.
    SendByTimestamp(RtpTimeDuration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Discard,
    /// Ahead of schedule; retry the same packet after the next tick.
    Wait,
}

/// Decides what happens to one packet given the scaled wall-clock time since pacing
/// started. Comparison is made in whole seconds.
pub fn dispatch(
    state: PacingState,
    info: &RtpInfo,
    wall_elapsed: Duration,
    rules: &PacingRules,
) -> (Verdict, PacingState) {
    let is_video = rules.is_video(info.payload_type);

    match state {
        PacingState::SeekFirstVideo if !is_video => (Verdict::Discard, state),
        PacingState::SeekFirstVideo => {
            let mapper = RtpTimeDuration::new(rules.video_clock_rate, info.timestamp);
            dispatch(
                PacingState::SendByTimestamp(mapper),
                info,
                wall_elapsed,
                rules,
            )
        }
        PacingState::SendByTimestamp(_) if !is_video => (Verdict::Forward, state),
        PacingState::SendByTimestamp(mapper) => {
            if mapper.elapsed_secs(info.timestamp) > wall_elapsed.as_secs() {
                (Verdict::Wait, state)
            } else {
                (Verdict::Forward, state)
            }
        }
    }
}

/// Shifts `raw` left by `scale` bits when positive and right by `-scale` bits otherwise.
pub fn scale_elapsed(raw: Duration, scale: i32) -> Duration {
    let scale = scale.clamp(-MAX_SCALE, MAX_SCALE);
    let nanos = raw.as_nanos();
    let scaled = if scale >= 0 {
        nanos << scale
    } else {
        nanos >> -scale
    };

    Duration::from_nanos(u64::try_from(scaled).unwrap_or(u64::MAX))
}

/// Pacing position of one session.
#[derive(Debug, Clone)]
pub struct PacingCursor {
    base_start: Instant,
    base_elapsed: Duration,
    state: PacingState,
}

impl PacingCursor {
    pub fn new(start: Instant) -> Self {
        Self {
            base_start: start,
            base_elapsed: Duration::ZERO,
            state: PacingState::SeekFirstVideo,
        }
    }

    pub fn state(&self) -> PacingState {
        self.state
    }

    /// Scaled wall-clock time as of the last [`PacingCursor::update`].
    pub fn wall_elapsed(&self) -> Duration {
        self.base_elapsed
    }

    pub fn update(&mut self, now: Instant, scale: i32) {
        let raw = now.saturating_duration_since(self.base_start);
        self.base_elapsed = scale_elapsed(raw, scale);
    }

    pub fn handle(&mut self, info: &RtpInfo, rules: &PacingRules) -> Verdict {
        let (verdict, next) = dispatch(self.state, info, self.base_elapsed, rules);
        self.state = next;
        verdict
    }
}

/// Fixed-period timer. Ticks missed while the caller was busy are skipped.
#[derive(Debug)]
pub(crate) struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Waits for the next tick and returns the time it fired, or `None` once `stop` has
    /// been signalled or disconnected.
    pub fn tick(&mut self, stop: &Receiver<()>) -> Option<Instant> {
        if !matches!(stop.recv_deadline(self.next), Err(RecvTimeoutError::Timeout)) {
            return None;
        }

        let now = Instant::now();
        while self.next <= now {
            self.next += self.period;
        }
        Some(now)
    }
}

pub(crate) struct Pacer {
    pub id: String,
    pub blocks_rx: Receiver<Block>,
    pub queue: DeliveryQueue,
    pub scale_rx: watch::Receiver<i32>,
    pub stop_rx: Receiver<()>,
    pub rules: PacingRules,
    pub tick_period: Duration,
    pub session: SessionHandle,
}

impl Pacer {
    pub fn run(self) {
        let mut cursor = PacingCursor::new(Instant::now());
        let mut ticker = Ticker::new(self.tick_period);

        'blocks: for block in self.blocks_rx.iter() {
            let payload = match block_payload(&block.data) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(id = %self.id, block_id = block.meta.id, "Invalid block: {e}");
                    continue;
                }
            };

            debug!(block_id = block.meta.id, len = payload.len(), "Pacing block");
            let mut reader = RecordReader::new(payload);

            loop {
                let packet = match reader.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        error!(id = %self.id, block_id = block.meta.id, "Failed to decode record: {e}");
                        break;
                    }
                };

                loop {
                    match cursor.handle(&packet.info, &self.rules) {
                        Verdict::Forward => {
                            match self.queue.push(packet) {
                                Ok(Enqueue::Queued) | Ok(Enqueue::Dropped) => {}
                                Err(e) => {
                                    error!(id = %self.id, "{e}");
                                    self.session.stop();
                                    return;
                                }
                            }
                            break;
                        }
                        Verdict::Discard => {
                            trace!(pt = packet.payload_type(), "Discarding packet before first video");
                            break;
                        }
                        Verdict::Wait => {
                            let Some(now) = ticker.tick(&self.stop_rx) else {
                                debug!(
                                    id = %self.id,
                                    block_id = block.meta.id,
                                    seq = packet.info.sequence_number,
                                    "Stopped while waiting to send"
                                );
                                break 'blocks;
                            };
                            cursor.update(now, *self.scale_rx.borrow());
                        }
                    }
                }
            }
        }

        info!(id = %self.id, dropped = self.queue.dropped(), "VOD send control loop stop");
    }
}
