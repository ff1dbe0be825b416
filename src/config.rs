//! Configuration for beatsync

use crate::error::{Result, SongClockError};

/// Timing tunables and user calibration for a [`SongClock`](crate::SongClock).
#[derive(Debug, Clone)]
pub struct SongClockConfig {
    /// Seconds of count-in before the song reaches zero
    pub pre_roll: f64,
    /// Per-user latency calibration, subtracted from every exposed time read
    pub offset_ms: i32,
    /// Playback rate multiplier
    pub pitch: f32,
    /// A measured audio tick period must exceed this before scheduling
    pub min_tick_period: f64,
    /// Consecutive tick periods must differ by less than this to count as stable
    pub stability_epsilon: f64,
    /// Pre-roll at or below this is treated as no pre-roll at all
    pub no_pre_roll_threshold: f64,
    /// Maximum disagreement between the absolute and naive stall deltas
    pub resync_threshold: f64,
    /// Catch-up rate applied while the game loop is stalled
    pub initial_speedup: f64,
}

impl Default for SongClockConfig {
    fn default() -> Self {
        Self {
            pre_roll: 2.0,
            offset_ms: 0,
            pitch: 1.0,
            min_tick_period: 0.01,
            stability_epsilon: 0.01,
            no_pre_roll_threshold: 0.01,
            resync_threshold: 0.1,
            initial_speedup: 2.0,
        }
    }
}

impl SongClockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_roll(mut self, seconds: f64) -> Self {
        self.pre_roll = seconds;
        self
    }

    pub fn offset_ms(mut self, offset_ms: i32) -> Self {
        self.offset_ms = offset_ms;
        self
    }

    pub fn pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    pub fn min_tick_period(mut self, seconds: f64) -> Self {
        self.min_tick_period = seconds;
        self
    }

    pub fn stability_epsilon(mut self, seconds: f64) -> Self {
        self.stability_epsilon = seconds;
        self
    }

    pub fn resync_threshold(mut self, seconds: f64) -> Self {
        self.resync_threshold = seconds;
        self
    }

    pub fn initial_speedup(mut self, rate: f64) -> Self {
        self.initial_speedup = rate;
        self
    }

    pub fn offset_seconds(&self) -> f64 {
        self.offset_ms as f64 * 0.001
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.pitch > 0.0) {
            return Err(SongClockError::Configuration(format!(
                "Pitch must be positive, got {}",
                self.pitch
            )));
        }
        if self.pre_roll < 0.0 {
            return Err(SongClockError::Configuration(format!(
                "Pre-roll must not be negative, got {}",
                self.pre_roll
            )));
        }
        let tunables = [
            ("min_tick_period", self.min_tick_period),
            ("stability_epsilon", self.stability_epsilon),
            ("resync_threshold", self.resync_threshold),
        ];
        for (name, value) in tunables {
            if !(value > 0.0) {
                return Err(SongClockError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.initial_speedup > 1.0) {
            return Err(SongClockError::Configuration(format!(
                "initial_speedup must be greater than 1.0, got {}",
                self.initial_speedup
            )));
        }
        Ok(())
    }
}

/// Audio device settings for the [`SongClockEngine`](crate::SongClockEngine)
#[derive(Debug, Clone)]
pub struct EngineDesc {
    pub sample_rate: u32,
    /// Requested frames per device callback
    pub block_size: usize,
    pub channels: u16,
}

impl Default for EngineDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 512,
            channels: 2,
        }
    }
}

impl EngineDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Nominal seconds between device callbacks
    pub fn block_period(&self) -> f64 {
        self.block_size as f64 / self.sample_rate as f64
    }
}
