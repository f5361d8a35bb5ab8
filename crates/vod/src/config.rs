use std::{fs::File, io::BufReader, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{VodError, pacing::PacingRules};

/// Tunables for VOD sessions.
///
/// Every field has a default, so a config file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VodConfig {
    /// Capacity of the queue between the pacer and the broadcaster.
    pub send_queue_length: usize,
    /// Capacity of the session command queue.
    pub command_queue_length: usize,
    /// Period of the pacing timer while a packet is ahead of schedule.
    pub tick_period_ms: u64,
    /// RTP clock rate of the video track, unless its session description announces one.
    pub video_clock_rate: u32,
    /// Payload types at or above this value are treated as video.
    pub video_payload_type_min: u8,
    /// Per-player queue capacity in the session fan-out.
    pub player_queue_length: usize,
}

impl Default for VodConfig {
    fn default() -> Self {
        Self {
            send_queue_length: 1024,
            command_queue_length: 4,
            tick_period_ms: 40,
            video_clock_rate: 90_000,
            video_payload_type_min: 96,
            player_queue_length: 256,
        }
    }
}

impl VodConfig {
    pub fn load(path: &Path) -> Result<Self, VodError> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VodError> {
        let invalid = |field: &'static str| {
            Err(VodError::Config(format!("{field} must be greater than zero").into()))
        };

        if self.send_queue_length == 0 {
            return invalid("sendQueueLength");
        }
        if self.command_queue_length == 0 {
            return invalid("commandQueueLength");
        }
        if self.tick_period_ms == 0 {
            return invalid("tickPeriodMs");
        }
        if self.video_clock_rate == 0 {
            return invalid("videoClockRate");
        }
        if self.player_queue_length == 0 {
            return invalid("playerQueueLength");
        }

        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn pacing_rules(&self) -> PacingRules {
        PacingRules {
            video_payload_type_min: self.video_payload_type_min,
            video_clock_rate: self.video_clock_rate,
        }
    }

    pub fn with_send_queue_length(mut self, length: usize) -> Self {
        self.send_queue_length = length;
        self
    }

    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_player_queue_length(mut self, length: usize) -> Self {
        self.player_queue_length = length;
        self
    }
}
