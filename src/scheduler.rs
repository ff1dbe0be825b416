//! Playback scheduling aligned to audio callback boundaries

use crate::config::SongClockConfig;

/// Result of a successful scheduling decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    /// Device-time instant at which the first sample should play
    pub device_time: f64,
    /// Whole number of tick periods between the decision and `device_time`
    pub offset: f64,
    /// Clock value to expose until the audio latches
    pub start_time: f64,
}

/// Whether the audio callback period has settled enough to schedule against.
///
/// Both measurements come from consecutive audio callbacks. A period at or
/// below `min_tick_period` means the callback has not run twice yet.
pub fn is_tick_period_stable(current: f64, previous: f64, config: &SongClockConfig) -> bool {
    current.is_finite()
        && previous.is_finite()
        && current.abs() > config.min_tick_period
        && (previous - current).abs() < config.stability_epsilon
}

/// Device offset for a pre-roll, rounded down to a whole number of ticks.
pub fn aligned_offset(pre_roll: f64, tick_period: f64) -> f64 {
    if pre_roll <= 0.0 || tick_period <= 0.0 {
        return 0.0;
    }
    (pre_roll / tick_period).floor() * tick_period
}

/// Picks the device instant at which playback starts, `now_device_time` plus
/// the largest multiple of `tick_period` that fits in `pre_roll`.
pub fn schedule_playback(pre_roll: f64, tick_period: f64, now_device_time: f64) -> f64 {
    now_device_time + aligned_offset(pre_roll, tick_period)
}

/// Tracks whether playback is pending for the current session.
#[derive(Debug, Default)]
pub struct Scheduler {
    scheduled: Option<ScheduledPlayback>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.is_some()
    }

    pub fn scheduled(&self) -> Option<ScheduledPlayback> {
        self.scheduled
    }

    /// Schedules playback if nothing is pending and the tick period is stable.
    ///
    /// Returns `None` when already scheduled or when the period is still
    /// settling; the caller simply retries on a later frame.
    pub fn try_schedule(
        &mut self,
        pre_roll: f64,
        tick_period: f64,
        previous_tick_period: f64,
        now_device_time: f64,
        source_start_time: f64,
        config: &SongClockConfig,
    ) -> Option<ScheduledPlayback> {
        if self.scheduled.is_some() {
            return None;
        }
        if !is_tick_period_stable(tick_period, previous_tick_period, config) {
            return None;
        }

        let offset = aligned_offset(pre_roll, tick_period);
        let start_time = if pre_roll <= config.no_pre_roll_threshold {
            source_start_time
        } else {
            -offset
        };

        let playback = ScheduledPlayback {
            device_time: now_device_time + offset,
            offset,
            start_time,
        };

        log::debug!(
            "Scheduled playback at device time {:.6} ({:.6}s ahead, tick period {:.6})",
            playback.device_time,
            offset,
            tick_period
        );

        self.scheduled = Some(playback);
        Some(playback)
    }

    pub fn clear(&mut self) {
        self.scheduled = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_schedule_alignment() {
        let cases = [
            (2.0, 0.0213, 100.0),
            (1.0, 0.01067, 5.5),
            (0.5, 0.02, 0.0),
            (3.3, 0.0417, 12345.678),
        ];

        for (pre_roll, tick, now) in cases {
            let scheduled = schedule_playback(pre_roll, tick, now);
            let ahead = scheduled - now;
            let ticks = ahead / tick;
            assert!((ticks - ticks.round()).abs() < 1e-6, "not tick aligned: {}", ticks);
            assert!(ahead <= pre_roll + EPSILON);
            assert!(ahead > pre_roll - tick - EPSILON);
        }
    }

    #[test]
    fn test_example_pre_roll() {
        // floor(2.0 / 0.0213) = 93 ticks
        let offset = aligned_offset(2.0, 0.0213);
        assert!((offset - 93.0 * 0.0213).abs() < EPSILON);
    }

    #[test]
    fn test_pre_roll_shorter_than_tick() {
        assert_eq!(aligned_offset(0.005, 0.02), 0.0);
        assert_eq!(schedule_playback(0.0, 0.02, 4.0), 4.0);
    }

    #[test]
    fn test_unstable_period_defers() {
        let config = SongClockConfig::default();
        let mut scheduler = Scheduler::new();

        // Callback has only run once
        assert!(scheduler.try_schedule(2.0, 0.0, 0.0, 1.0, 0.0, &config).is_none());
        // Periods still jumping around
        assert!(scheduler.try_schedule(2.0, 0.04, 0.02, 1.0, 0.0, &config).is_none());
        assert!(!scheduler.is_scheduled());

        let scheduled = scheduler
            .try_schedule(2.0, 0.03125, 0.0313, 1.0, 0.0, &config)
            .unwrap();
        assert!((scheduled.device_time - 3.0).abs() < 1e-6);
        assert!((scheduled.start_time + scheduled.offset).abs() < EPSILON);
        assert!(scheduler.is_scheduled());
    }

    #[test]
    fn test_schedule_is_idempotent() {
        let config = SongClockConfig::default();
        let mut scheduler = Scheduler::new();
        let first = scheduler.try_schedule(1.0, 0.02, 0.02, 1.0, 0.0, &config);
        assert!(first.is_some());
        assert!(scheduler.try_schedule(1.0, 0.02, 0.02, 9.0, 0.0, &config).is_none());
        assert_eq!(scheduler.scheduled(), first);

        scheduler.clear();
        assert!(scheduler.try_schedule(1.0, 0.02, 0.02, 9.0, 0.0, &config).is_some());
    }

    #[test]
    fn test_no_pre_roll_starts_at_source_time() {
        let config = SongClockConfig::default();
        let mut scheduler = Scheduler::new();
        let scheduled = scheduler
            .try_schedule(0.0, 0.02, 0.02, 1.0, 12.5, &config)
            .unwrap();
        assert_eq!(scheduled.start_time, 12.5);
        assert_eq!(scheduled.device_time, 1.0);
    }
}
