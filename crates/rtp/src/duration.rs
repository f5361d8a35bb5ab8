use std::time::Duration;

/// Maps RTP timestamps of one track onto playback time, relative to the first timestamp
/// observed on that track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpTimeDuration {
    clock_rate: u32,
    anchor: u32,
}

impl RtpTimeDuration {
    /// `clock_rate` is in ticks per second; zero is treated as one.
    pub fn new(clock_rate: u32, anchor: u32) -> Self {
        Self {
            clock_rate: clock_rate.max(1),
            anchor,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn anchor(&self) -> u32 {
        self.anchor
    }

    /// Ticks between the anchor and `timestamp`, modulo 2^32.
    pub fn ticks_since_anchor(&self, timestamp: u32) -> u32 {
        timestamp.wrapping_sub(self.anchor)
    }

    /// Whole seconds of playback between the anchor and `timestamp`.
    pub fn elapsed_secs(&self, timestamp: u32) -> u64 {
        u64::from(self.ticks_since_anchor(timestamp)) / u64::from(self.clock_rate)
    }

    pub fn elapsed(&self, timestamp: u32) -> Duration {
        let ticks = u64::from(self.ticks_since_anchor(timestamp));
        let rate = u64::from(self.clock_rate);
        Duration::from_secs(ticks / rate) + Duration::from_nanos(ticks % rate * 1_000_000_000 / rate)
    }
}
