//! Game-loop stall detection and smooth catch-up
//!
//! The audio callback "pings" the game loop with a timestamp every time it
//! runs past the scheduled start. When the game loop picks that ping up later
//! than one audio tick period, it has fallen behind the audio thread. Instead
//! of snapping forward, the exposed clock then runs faster than real time
//! until the measured gap has been consumed exactly. Only the time gained on
//! top of the frame delta counts against the gap, so the last catch-up step
//! lands on the audio position.

use crate::config::SongClockConfig;

/// Everything the corrector needs to size a stall, sampled on the game loop.
#[derive(Debug, Clone, Copy)]
pub struct SyncSample {
    /// Game-loop time of the current step
    pub game_loop_now: f64,
    /// Game-loop-axis time at which the audio callback raised the ping
    pub acknowledgement_time: f64,
    /// Last measured audio tick period
    pub tick_period: f64,
    pub audio_start_time: f64,
    pub source_start_time: f64,
    /// Clock value before this step's advancement
    pub current_time: f64,
    /// Frame delta of the current step, before any speedup
    pub frame_delta: f64,
    /// Device-reported clip position converted to song seconds, if available
    pub playhead: Option<f64>,
}

impl SyncSample {
    /// Gap derived from the time elapsed since the audio ping
    pub fn naive_delta(&self) -> f64 {
        self.game_loop_now - self.acknowledgement_time
    }

    /// Gap derived from absolute positions since playback began
    pub fn accurate_delta(&self) -> f64 {
        self.game_loop_now - self.audio_start_time + self.source_start_time - self.current_time
    }
}

#[derive(Debug, Default)]
pub struct DriftCorrector {
    stalled: bool,
    sync_delta: f64,
    speedup_rate: f64,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Time the clock still has to gain on top of its normal frame deltas
    pub fn sync_delta(&self) -> f64 {
        self.sync_delta
    }

    pub fn speedup_rate(&self) -> f64 {
        self.speedup_rate
    }

    /// Evaluates an audio ping. Returns true when it starts a stall.
    ///
    /// Pings arriving while a stall is being recovered are ignored.
    pub fn observe(&mut self, sample: &SyncSample, config: &SongClockConfig) -> bool {
        if self.stalled {
            return false;
        }

        self.sync_delta = sample.naive_delta();
        if self.sync_delta <= sample.tick_period {
            return false;
        }

        let naive = self.sync_delta;
        let accurate = sample.accurate_delta();

        if (accurate - naive).abs() <= config.resync_threshold {
            self.sync_delta = accurate;
        } else if let Some(playhead) = sample.playhead {
            // Host was suspended long enough that wall-clock deltas are unreliable
            self.sync_delta = playhead - sample.current_time;
            log::debug!(
                "Stall delta mismatch (naive {:.4}s, absolute {:.4}s), resyncing to playhead",
                naive,
                accurate
            );
        }

        self.stalled = true;
        log::debug!(
            "Game loop stalled by {:.4}s (tick period {:.4}s)",
            self.sync_delta,
            sample.tick_period
        );
        // This step's own frame delta already covers part of the gap
        self.sync_delta -= sample.frame_delta;
        true
    }

    /// Scales a frame delta while stalled and consumes the remaining gap.
    ///
    /// Only the excess over `frame_delta` is booked against the gap, and it
    /// never exceeds what is left, so the final step lands exactly on the
    /// audio position. Returns the delta the clock should advance by.
    pub fn apply(&mut self, frame_delta: f64, config: &SongClockConfig) -> f64 {
        let mut delta = frame_delta;

        if self.stalled {
            if self.speedup_rate.abs() < 0.01 {
                self.speedup_rate = config.initial_speedup;
            }
            let excess = (frame_delta * (self.speedup_rate - 1.0))
                .max(0.0)
                .min(self.sync_delta.max(0.0));
            delta += excess;
            self.sync_delta -= excess;
        }

        if self.sync_delta <= 0.0 {
            if self.stalled {
                log::debug!("Caught up with audio thread");
            }
            self.speedup_rate = 0.0;
            self.stalled = false;
        }

        delta
    }

    pub fn reset(&mut self) {
        self.stalled = false;
        self.sync_delta = 0.0;
        self.speedup_rate = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: f64 = 0.02;

    fn sample(naive: f64, accurate: f64, playhead: Option<f64>) -> SyncSample {
        // audio_start = 0 and source_start = 0 make accurate = now - current
        SyncSample {
            game_loop_now: 10.0,
            acknowledgement_time: 10.0 - naive,
            tick_period: 0.02,
            audio_start_time: 0.0,
            source_start_time: 0.0,
            current_time: 10.0 - accurate,
            frame_delta: FRAME,
            playhead,
        }
    }

    #[test]
    fn test_no_stall_within_tick_period() {
        let config = SongClockConfig::default();
        let mut drift = DriftCorrector::new();
        assert!(!drift.observe(&sample(0.015, 0.015, None), &config));
        assert!(!drift.is_stalled());
        assert_eq!(drift.apply(0.016, &config), 0.016);
    }

    #[test]
    fn test_stall_prefers_accurate_delta() {
        let config = SongClockConfig::default();
        let mut drift = DriftCorrector::new();
        assert!(drift.observe(&sample(0.09, 0.07, Some(5.0)), &config));
        assert!((drift.sync_delta() - (0.07 - FRAME)).abs() < 1e-9);
    }

    #[test]
    fn test_stall_falls_back_to_playhead() {
        let config = SongClockConfig::default();
        let mut drift = DriftCorrector::new();
        // current_time = 9.5, playhead says 9.8
        assert!(drift.observe(&sample(0.09, 0.5, Some(9.8)), &config));
        assert!((drift.sync_delta() - (0.3 - FRAME)).abs() < 1e-9);
    }

    #[test]
    fn test_stall_without_playhead_keeps_naive_delta() {
        let config = SongClockConfig::default();
        let mut drift = DriftCorrector::new();
        assert!(drift.observe(&sample(0.09, 0.5, None), &config));
        assert!((drift.sync_delta() - (0.09 - FRAME)).abs() < 1e-9);
    }

    #[test]
    fn test_catch_up_consumes_only_the_excess() {
        let config = SongClockConfig::default();
        let mut drift = DriftCorrector::new();
        drift.observe(&sample(0.09, 0.09, None), &config);

        let mut deltas = Vec::new();
        while drift.is_stalled() {
            deltas.push(drift.apply(FRAME, &config));
            assert!(deltas.len() < 16, "catch-up never finished");
        }
        assert_eq!(drift.speedup_rate(), 0.0);

        // Capped at the doubled frame delta, never below real time
        assert!(deltas.iter().all(|d| *d <= 2.0 * FRAME + 1e-12 && *d >= FRAME));
        assert_eq!(deltas.len(), 4);

        // Counting the detection step's own frame, the clock gains the full gap
        let gained: f64 = deltas.iter().sum::<f64>() - (deltas.len() - 1) as f64 * FRAME;
        assert!((gained - 0.09).abs() < 1e-12, "{}", gained);
    }

    #[test]
    fn test_pings_ignored_while_stalled() {
        let config = SongClockConfig::default();
        let mut drift = DriftCorrector::new();
        drift.observe(&sample(0.09, 0.09, None), &config);
        assert!(!drift.observe(&sample(0.5, 0.5, None), &config));
        assert!((drift.sync_delta() - (0.09 - FRAME)).abs() < 1e-9);
    }

    #[test]
    fn test_negative_accurate_delta_clears_immediately() {
        let config = SongClockConfig::default();
        let mut drift = DriftCorrector::new();
        // Clock is already ahead of the audio position
        drift.observe(&sample(0.05, -0.01, None), &config);
        let delta = drift.apply(0.016, &config);
        assert_eq!(delta, 0.016);
        assert!(!drift.is_stalled());
    }
}
