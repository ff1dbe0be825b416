//! Time sources shared between the game loop, the audio thread and extensions

use atomic_float::AtomicF64;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Thread-safe monotonic timestamp source, readable from any thread.
///
/// The clock samples it once per frame on the game loop to measure the offset
/// between itself and the game loop's own time axis, and the audio callback
/// samples it to stamp latch and acknowledgement instants.
pub trait HostClock: Send + Sync {
    /// Seconds since an arbitrary fixed origin
    fn now(&self) -> f64;
}

/// [`HostClock`] backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Externally driven [`HostClock`], for simulations and tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicF64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(AtomicF64::new(start)),
        }
    }

    pub fn set(&self, seconds: f64) {
        self.now.store(seconds, Ordering::Release);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> f64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Read-only view of the song clock that gameplay extensions depend on.
pub trait TimeSource {
    /// Audio-relative song time in seconds, offset and pitch applied
    fn current_audio_time(&self) -> f64;

    /// True once the exposed time has reached zero
    fn has_started(&self) -> bool;

    fn current_bpm(&self) -> f32;

    /// Delay to the first beat of the current song, in seconds
    fn first_beat_offset(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(10.0);
        let other = clock.clone();
        clock.advance(0.5);
        assert_eq!(other.now(), 10.5);
        other.set(3.0);
        assert_eq!(clock.now(), 3.0);
    }
}
