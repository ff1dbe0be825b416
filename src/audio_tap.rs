//! Audio-callback side of the song clock
//!
//! [`SharedTiming`] is the only state both threads see. Every field has exactly
//! one writer:
//!
//! | written by the game loop | written by the audio callback |
//! |---|---|
//! | `generation`, `scheduled_device_time`, `host_offset`, `acks_consumed` | `device_time`, `tick_period`, `previous_tick_period`, `latch_*`, `ack_*`, `acks_issued` |
//!
//! Values are published with release stores and read with acquire loads, so a
//! reader never sees a half-written `f64`. Latches and acknowledgements are
//! tagged with the session generation they were raised for, which lets the game
//! loop discard observations that belong to a session it already paused.

use crate::time::HostClock;
use atomic_float::AtomicF64;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct SharedTiming {
    generation: AtomicU64,
    scheduled_device_time: AtomicF64,
    host_offset: AtomicF64,
    acks_consumed: AtomicU64,

    device_time: AtomicF64,
    tick_period: AtomicF64,
    previous_tick_period: AtomicF64,
    latch_time: AtomicF64,
    latch_generation: AtomicU64,
    ack_time: AtomicF64,
    ack_generation: AtomicU64,
    acks_issued: AtomicU64,
}

impl Default for SharedTiming {
    fn default() -> Self {
        Self {
            // Generation 0 is reserved for "never latched"
            generation: AtomicU64::new(1),
            scheduled_device_time: AtomicF64::new(0.0),
            host_offset: AtomicF64::new(0.0),
            acks_consumed: AtomicU64::new(0),
            device_time: AtomicF64::new(0.0),
            tick_period: AtomicF64::new(0.0),
            previous_tick_period: AtomicF64::new(0.0),
            latch_time: AtomicF64::new(0.0),
            latch_generation: AtomicU64::new(0),
            ack_time: AtomicF64::new(0.0),
            ack_generation: AtomicU64::new(0),
            acks_issued: AtomicU64::new(0),
        }
    }
}

impl SharedTiming {
    pub fn new() -> Self {
        Self::default()
    }

    // Game-loop side

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Measured once per frame: host clock minus game-loop time
    pub fn set_host_offset(&self, offset: f64) {
        self.host_offset.store(offset, Ordering::Release);
    }

    pub fn publish_schedule(&self, device_time: f64) {
        self.scheduled_device_time
            .store(device_time, Ordering::Release);
    }

    /// Invalidates every outstanding observation and clears the schedule.
    /// Returns the new generation.
    pub fn end_session(&self) -> u64 {
        self.scheduled_device_time.store(0.0, Ordering::Release);
        let next = self.generation.load(Ordering::Relaxed) + 1;
        self.generation.store(next, Ordering::Release);
        next
    }

    /// Game-loop-axis time at which scheduled audio began for `generation`
    pub fn latch(&self, generation: u64) -> Option<f64> {
        if self.latch_generation.load(Ordering::Acquire) == generation {
            Some(self.latch_time.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Consumes a pending acknowledgement, returning its timestamp when it
    /// belongs to `generation`. Stale acknowledgements are consumed silently.
    pub fn take_acknowledgement(&self, generation: u64) -> Option<f64> {
        let issued = self.acks_issued.load(Ordering::Acquire);
        if issued == self.acks_consumed.load(Ordering::Relaxed) {
            return None;
        }

        let time = self.ack_time.load(Ordering::Acquire);
        let ack_generation = self.ack_generation.load(Ordering::Acquire);
        self.acks_consumed.store(issued, Ordering::Release);

        (ack_generation == generation).then_some(time)
    }

    pub fn device_time(&self) -> f64 {
        self.device_time.load(Ordering::Acquire)
    }

    /// Last two measured callback periods, newest first
    pub fn tick_periods(&self) -> (f64, f64) {
        (
            self.tick_period.load(Ordering::Acquire),
            self.previous_tick_period.load(Ordering::Acquire),
        )
    }
}

/// Handle driven by the audio callback. Never blocks or allocates.
pub struct AudioTap {
    shared: Arc<SharedTiming>,
    host: Arc<dyn HostClock>,
    last_device_time: Option<f64>,
    tick_period: f64,
    latched_generation: u64,
}

impl AudioTap {
    pub fn new(shared: Arc<SharedTiming>, host: Arc<dyn HostClock>) -> Self {
        Self {
            shared,
            host,
            last_device_time: None,
            tick_period: 0.0,
            latched_generation: 0,
        }
    }

    pub fn shared(&self) -> &Arc<SharedTiming> {
        &self.shared
    }

    /// Call at every buffer boundary with the device's monotonic time.
    pub fn on_audio_tick(&mut self, device_now: f64) {
        if !device_now.is_finite() {
            return;
        }

        if let Some(last) = self.last_device_time {
            let period = device_now - last;
            // Backwards or absurd periods (counter wraparound) are dropped for this tick
            if period.is_finite() && period >= 0.0 {
                self.shared
                    .previous_tick_period
                    .store(self.tick_period, Ordering::Release);
                self.shared.tick_period.store(period, Ordering::Release);
                self.tick_period = period;
            }
        }
        self.last_device_time = Some(device_now);
        self.shared.device_time.store(device_now, Ordering::Release);

        let generation = self.shared.generation.load(Ordering::Acquire);
        let scheduled = self.shared.scheduled_device_time.load(Ordering::Acquire);
        let next_device_time = device_now + self.tick_period;

        if scheduled <= 0.0 || scheduled > next_device_time {
            return;
        }

        let now = self.host.now() - self.shared.host_offset.load(Ordering::Acquire);

        if self.latched_generation != generation {
            self.shared.latch_time.store(now, Ordering::Release);
            self.shared
                .latch_generation
                .store(generation, Ordering::Release);
            self.latched_generation = generation;
        }

        // Ping the game loop again only after it has consumed the last one
        let issued = self.shared.acks_issued.load(Ordering::Relaxed);
        if issued == self.shared.acks_consumed.load(Ordering::Acquire) {
            self.shared.ack_time.store(now, Ordering::Release);
            self.shared
                .ack_generation
                .store(generation, Ordering::Release);
            self.shared.acks_issued.store(issued + 1, Ordering::Release);
        }
    }

    /// Last measured callback period
    pub fn tick_period(&self) -> f64 {
        self.tick_period
    }
}
