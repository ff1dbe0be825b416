//! The song clock: drift-corrected, audio-relative time for gameplay

use crate::audio_data::AudioClip;
use crate::audio_tap::{AudioTap, SharedTiming};
use crate::config::SongClockConfig;
use crate::drift::{DriftCorrector, SyncSample};
use crate::error::{Result, SongClockError};
use crate::events::{EventDispatcher, SongClockEvent};
use crate::playback::{PlaybackBackend, ScheduleRequest};
use crate::scheduler::Scheduler;
use crate::song::Song;
use crate::time::{HostClock, MonotonicClock, TimeSource};
use crate::timeline::{BpmTimeline, LoopPoint};
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// Snapshot of the clock's own state. Only [`SongClock`] mutates it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockState {
    /// Audio-relative seconds, negative during pre-roll
    pub current_time: f64,
    /// Song position the clock resumes from when unpaused
    pub source_start_time: f64,
    /// Game-loop-axis instant at which scheduled audio began, 0 when unknown
    pub audio_start_time: f64,
    /// Device-time instant playback is scheduled for, 0 when none is pending
    pub scheduled_device_time: f64,
    pub is_playing: bool,
    pub is_scheduled: bool,
}

/// Drift-corrected song clock, driven once per frame from the game loop.
///
/// The audio side is a separate [`AudioTap`] handed to the audio callback via
/// [`audio_tap`](Self::audio_tap); the two only share lock-free single-writer
/// fields. There is exactly one tap per clock.
pub struct SongClock {
    config: SongClockConfig,
    host: Arc<dyn HostClock>,
    shared: Arc<SharedTiming>,
    tap: Option<AudioTap>,
    backend: Option<Box<dyn PlaybackBackend>>,
    song: Option<Song>,

    state: ClockState,
    scheduler: Scheduler,
    drift: DriftCorrector,
    bpm: BpmTimeline,
    loop_point: Option<LoopPoint>,
    dispatcher: EventDispatcher,
    own_events: Receiver<SongClockEvent>,

    time_initialized: bool,
    pre_roll: f64,
    generation: u64,
    latched: bool,
    warned_no_clip: bool,
    started: bool,
    loop_count: u32,

    delta_time: f64,
    audio_delta: f64,
    previous_timestamp: f64,
}

impl SongClock {
    pub fn new(config: SongClockConfig) -> Result<Self> {
        Self::with_host_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Uses `host` as the thread-safe timestamp source shared with the audio callback
    pub fn with_host_clock(config: SongClockConfig, host: Arc<dyn HostClock>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(SharedTiming::new());
        let generation = shared.generation();
        let mut dispatcher = EventDispatcher::new();
        let own_events = dispatcher.subscribe();
        let tap = AudioTap::new(shared.clone(), host.clone());

        Ok(Self {
            pre_roll: config.pre_roll,
            config,
            host,
            tap: Some(tap),
            shared,
            backend: None,
            song: None,
            state: ClockState::default(),
            scheduler: Scheduler::new(),
            drift: DriftCorrector::new(),
            bpm: BpmTimeline::new(0.0, Vec::new()),
            loop_point: None,
            dispatcher,
            own_events,
            time_initialized: false,
            generation,
            latched: false,
            warned_no_clip: false,
            started: false,
            loop_count: 0,
            delta_time: 0.0,
            audio_delta: 0.0,
            previous_timestamp: 0.0,
        })
    }

    /// Audio-callback handle. Call [`AudioTap::on_audio_tick`] at every buffer boundary.
    ///
    /// The tap is the only writer of the audio-side timing fields, so it is
    /// handed out once; later calls return `None`.
    pub fn audio_tap(&mut self) -> Option<AudioTap> {
        self.tap.take()
    }

    pub fn set_backend(&mut self, backend: Box<dyn PlaybackBackend>) {
        self.backend = Some(backend);
    }

    /// Sets the song to play. Takes effect at the next [`init_time`](Self::init_time).
    pub fn set_song(&mut self, song: Song) -> Result<()> {
        song.validate()?;
        self.song = Some(song);
        Ok(())
    }

    /// Replaces the clip of the current song
    pub fn set_clip(&mut self, clip: AudioClip) -> Result<()> {
        let song = self.song.as_mut().ok_or(SongClockError::NoSong)?;
        song.clip = Some(clip);
        self.warned_no_clip = false;
        Ok(())
    }

    pub fn song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    /// Establishes the time baseline for a new session, `start_seconds` into the song.
    pub fn init_time(&mut self, start_seconds: f64) -> Result<()> {
        let song = self.song.as_ref().ok_or(SongClockError::NoSong)?;

        self.bpm = BpmTimeline::from_song(song);
        self.loop_point = song.effective_loop_duration().map(LoopPoint::new).transpose()?;

        self.time_initialized = true;
        self.state.current_time = start_seconds - self.pre_roll;
        self.state.source_start_time = start_seconds;
        self.previous_timestamp = self.state.current_time;
        self.started = false;
        self.loop_count = 0;

        log::debug!(
            "Time initialized at {:.3}s (pre-roll {:.3}s, base BPM {})",
            start_seconds,
            self.pre_roll,
            self.bpm.base_bpm()
        );
        Ok(())
    }

    /// Advances the clock. Call once per rendered frame.
    pub fn step(&mut self, game_loop_now: f64, frame_delta: f64) {
        let frame_delta = if frame_delta.is_finite() {
            frame_delta.max(0.0)
        } else {
            0.0
        };

        self.shared.set_host_offset(self.host.now() - game_loop_now);

        if !self.time_initialized {
            self.delta_time = frame_delta;
            return;
        }

        self.check_loop(game_loop_now);
        self.process_audio_time(game_loop_now, frame_delta);
        self.try_schedule();

        let timestamp = self.current_audio_time();
        self.audio_delta = timestamp - self.previous_timestamp;
        self.previous_timestamp = timestamp;

        self.advance_bpm(timestamp);

        if self.state.is_playing && timestamp >= 0.0 && !self.started {
            self.started = true;
            self.dispatcher.fire_started();
        }
    }

    fn check_loop(&mut self, game_loop_now: f64) {
        if !self.state.is_playing {
            return;
        }
        let Some(loop_point) = self.loop_point else {
            return;
        };

        if loop_point.is_reached(self.state.current_time) {
            self.state.current_time = 0.0;
            self.state.source_start_time = 0.0;
            self.state.audio_start_time = game_loop_now;
            self.loop_count += 1;

            // Changes before the loop point must fire again on the next pass
            self.bpm.reset();

            log::debug!(
                "Looped at {:.3}s (loop {})",
                loop_point.duration(),
                self.loop_count
            );
            self.dispatcher.emit(SongClockEvent::Looped {
                loop_count: self.loop_count,
            });
        }
    }

    fn process_audio_time(&mut self, game_loop_now: f64, frame_delta: f64) {
        if self.state.is_scheduled && !self.latched {
            if let Some(start) = self.shared.latch(self.generation) {
                self.latched = true;
                self.state.audio_start_time = start;
                log::debug!("Audio latched at {:.6}", start);
            }
        }

        // Always drained so a ping raised during a stall cannot go stale
        if let Some(acknowledgement_time) = self.shared.take_acknowledgement(self.generation) {
            if self.latched && self.state.is_playing {
                let (tick_period, _) = self.shared.tick_periods();
                let playhead = self
                    .backend
                    .as_ref()
                    .and_then(|backend| backend.playhead())
                    .map(|position| position / self.config.pitch as f64);

                self.drift.observe(
                    &SyncSample {
                        game_loop_now,
                        acknowledgement_time,
                        tick_period,
                        audio_start_time: self.state.audio_start_time,
                        source_start_time: self.state.source_start_time,
                        current_time: self.state.current_time,
                        frame_delta,
                        playhead,
                    },
                    &self.config,
                );
            }
        }

        if !self.state.is_playing {
            self.delta_time = frame_delta;
            return;
        }

        let catching_up = self.drift.is_stalled();
        let delta = self.drift.apply(frame_delta, &self.config);
        self.delta_time = delta;

        if self.latched {
            if self.state.current_time >= 0.0 && !catching_up {
                self.state.current_time =
                    game_loop_now - self.state.audio_start_time + self.state.source_start_time;
            } else {
                self.state.current_time += delta;
            }

            if catching_up && !self.drift.is_stalled() {
                // Re-anchor so absolute timing continues from where catch-up ended
                self.state.audio_start_time =
                    game_loop_now - self.state.current_time + self.state.source_start_time;
            }
        } else if self.state.current_time < 0.0 {
            self.state.current_time += delta;
        }
    }

    fn try_schedule(&mut self) {
        if !self.state.is_playing || self.scheduler.is_scheduled() {
            return;
        }

        let Some(song) = self.song.as_ref() else {
            return;
        };
        let clip = match song.require_clip() {
            Ok(clip) => clip.clone(),
            Err(e) => {
                if !self.warned_no_clip {
                    log::warn!("{}, refusing to schedule playback", e);
                    self.warned_no_clip = true;
                }
                return;
            }
        };
        let looping = song.looping;
        let loop_end = self
            .loop_point
            .map(|loop_point| loop_point.duration() * self.config.pitch as f64);

        let (tick_period, previous_tick_period) = self.shared.tick_periods();
        let Some(playback) = self.scheduler.try_schedule(
            self.pre_roll,
            tick_period,
            previous_tick_period,
            self.shared.device_time(),
            self.state.source_start_time,
            &self.config,
        ) else {
            return;
        };

        self.state.current_time = playback.start_time;
        self.state.scheduled_device_time = playback.device_time;
        self.state.is_scheduled = true;
        self.shared.publish_schedule(playback.device_time);

        if let Some(backend) = self.backend.as_mut() {
            let request = ScheduleRequest {
                clip,
                device_time: playback.device_time,
                clip_start: self.state.source_start_time * self.config.pitch as f64,
                pitch: self.config.pitch,
                looping,
                loop_end,
            };
            if let Err(e) = backend.schedule(request) {
                log::error!("Failed to schedule playback: {}", e);
            }
        }
    }

    fn advance_bpm(&mut self, timestamp: f64) {
        let dispatcher = &mut self.dispatcher;
        self.bpm.advance(timestamp, |change| {
            dispatcher.emit(SongClockEvent::BpmChanged {
                bpm: change.bpm,
                time: change.time,
            });
        });
    }

    /// Starts (or resumes) playback. Audio is scheduled on a following step
    /// once the audio callback period is stable.
    pub fn play(&mut self) -> Result<()> {
        if !self.time_initialized {
            log::warn!("Time has not been initialized, call init_time() before play()");
            return Err(SongClockError::NotInitialized("play"));
        }
        if self.state.is_playing {
            return Ok(());
        }

        self.state.is_playing = true;
        self.dispatcher.emit(SongClockEvent::StartPlaying);
        Ok(())
    }

    pub fn unpause(&mut self) -> Result<()> {
        self.play()
    }

    /// Freezes the clock at its current position and cancels scheduled audio.
    pub fn pause(&mut self) {
        let was_playing = self.state.is_playing;

        let past_zero = match self.backend.as_ref().and_then(|backend| backend.playhead()) {
            Some(playhead) => playhead > 0.0,
            None => self.state.current_time > 0.0,
        };
        if past_zero {
            self.pre_roll = 0.0;
        }

        if was_playing {
            self.state.source_start_time = self.state.current_time;
        }

        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.stop() {
                log::error!("Failed to stop playback: {}", e);
            }
        }

        self.state.is_playing = false;
        self.state.audio_start_time = 0.0;
        self.state.current_time = self.state.source_start_time;
        self.state.scheduled_device_time = 0.0;
        self.state.is_scheduled = false;
        self.scheduler.clear();
        self.drift.reset();
        self.latched = false;
        self.generation = self.shared.end_session();

        if was_playing {
            self.dispatcher.emit(SongClockEvent::StopPlaying);
        }
    }

    /// Pauses and rewinds to the start of the song
    pub fn stop(&mut self) {
        self.pause();
        self.state.current_time = 0.0;
        self.state.source_start_time = 0.0;
    }

    /// Position playback resumes from
    pub fn set_start_time(&mut self, seconds: f64) -> Result<()> {
        if !self.time_initialized {
            log::warn!("Time has not been initialized, call init_time() before set_start_time()");
            return Err(SongClockError::NotInitialized("set_start_time"));
        }
        self.state.source_start_time = seconds;
        Ok(())
    }

    /// User calibration in milliseconds, subtracted from every exposed time read
    pub fn set_offset(&mut self, offset_ms: i32) {
        self.config.offset_ms = offset_ms;
    }

    pub fn set_pitch(&mut self, pitch: f32) -> Result<()> {
        if !(pitch > 0.0) {
            return Err(SongClockError::Configuration(format!(
                "Pitch must be positive, got {}",
                pitch
            )));
        }
        self.config.pitch = pitch;
        Ok(())
    }

    /// Count-in used the next time playback is scheduled
    pub fn set_pre_roll(&mut self, seconds: f64) {
        self.pre_roll = seconds.max(0.0);
    }

    pub fn subscribe(&mut self) -> Receiver<SongClockEvent> {
        self.dispatcher.subscribe()
    }

    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&SongClockEvent) + Send + 'static,
    {
        self.dispatcher.add_listener(listener);
    }

    /// One-shot callback for the first step at which the exposed time is >= 0.
    /// Fires on the next step if the song has already started.
    pub fn on_started<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.on_started(callback);
        self.started = false;
    }

    /// Events emitted since the last poll
    pub fn poll_events(&self) -> Vec<SongClockEvent> {
        self.own_events.try_iter().collect()
    }

    /// Audio-relative song time, pitch and user offset applied
    pub fn current_audio_time(&self) -> f64 {
        let time = if self.state.is_playing {
            self.state.current_time
        } else {
            self.state.source_start_time
        };
        time * self.config.pitch as f64 - self.config.offset_seconds()
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing
    }

    pub fn is_paused(&self) -> bool {
        !self.state.is_playing
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.is_scheduled
    }

    pub fn is_stalled(&self) -> bool {
        self.drift.is_stalled()
    }

    pub fn has_started(&self) -> bool {
        if self.state.is_playing {
            self.current_audio_time() >= 0.0
        } else {
            self.state.source_start_time >= 0.0
        }
    }

    pub fn current_bpm(&self) -> f32 {
        self.bpm.current_bpm()
    }

    pub fn source_start_time(&self) -> f64 {
        self.state.source_start_time
    }

    /// Frame delta of the last step, including stall catch-up scaling
    pub fn delta_time(&self) -> f64 {
        self.delta_time
    }

    /// Change in exposed time between the last two steps
    pub fn audio_delta(&self) -> f64 {
        self.audio_delta
    }

    pub fn pitch(&self) -> f32 {
        self.config.pitch
    }

    pub fn offset_seconds(&self) -> f64 {
        self.config.offset_seconds()
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn config(&self) -> &SongClockConfig {
        &self.config
    }
}

impl TimeSource for SongClock {
    fn current_audio_time(&self) -> f64 {
        SongClock::current_audio_time(self)
    }

    fn has_started(&self) -> bool {
        SongClock::has_started(self)
    }

    fn current_bpm(&self) -> f32 {
        SongClock::current_bpm(self)
    }

    fn first_beat_offset(&self) -> f64 {
        self.song
            .as_ref()
            .map_or(0.0, Song::first_beat_offset_secs)
    }
}

impl Drop for SongClock {
    fn drop(&mut self) {
        self.shared.end_session();
        if let Some(backend) = self.backend.as_mut() {
            let _ = backend.stop();
        }
    }
}

impl std::fmt::Debug for SongClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SongClock")
            .field("state", &self.state)
            .field("current_bpm", &self.bpm.current_bpm())
            .field("stalled", &self.drift.is_stalled())
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::time::Duration;

    fn clock_with_song(song: Song) -> (SongClock, ManualClock) {
        let host = ManualClock::new(0.0);
        let mut clock =
            SongClock::with_host_clock(SongClockConfig::default(), Arc::new(host.clone())).unwrap();
        clock.set_song(song).unwrap();
        (clock, host)
    }

    fn clip() -> AudioClip {
        AudioClip::silence(Duration::from_secs(10), 1000, 1).unwrap()
    }

    #[test]
    fn test_play_before_init_is_rejected() {
        let (mut clock, _) = clock_with_song(Song::new(120.0));
        assert!(matches!(
            clock.play(),
            Err(SongClockError::NotInitialized("play"))
        ));
        assert!(clock.set_start_time(3.0).is_err());
        assert!(!clock.is_playing());
        assert_eq!(clock.source_start_time(), 0.0);
    }

    #[test]
    fn test_init_without_song() {
        let mut clock = SongClock::new(SongClockConfig::default()).unwrap();
        assert!(matches!(clock.init_time(0.0), Err(SongClockError::NoSong)));
    }

    #[test]
    fn test_init_time_applies_pre_roll() {
        let (mut clock, _) = clock_with_song(Song::new(120.0));
        clock.init_time(0.0).unwrap();
        assert_eq!(clock.state().current_time, -2.0);
        assert_eq!(clock.current_bpm(), 120.0);
    }

    #[test]
    fn test_pre_roll_integrates_frame_delta() {
        let (mut clock, _) = clock_with_song(Song::new(120.0).with_clip(clip()));
        clock.init_time(0.0).unwrap();
        clock.play().unwrap();

        clock.step(1.0, 0.5);
        clock.step(1.5, 0.5);
        assert!((clock.state().current_time + 1.0).abs() < 1e-9);
        assert!(!clock.has_started());
    }

    #[test]
    fn test_paused_readout_is_static() {
        let (mut clock, _) = clock_with_song(Song::new(120.0));
        clock.init_time(4.0).unwrap();
        clock.set_offset(100);
        clock.step(1.0, 0.016);
        clock.step(2.0, 0.016);
        assert!((clock.current_audio_time() - 3.9).abs() < 1e-9);
        assert!(clock.has_started());
    }

    #[test]
    fn test_no_clip_refuses_to_schedule() {
        let (mut clock, _) = clock_with_song(Song::new(120.0));
        let mut tap = clock.audio_tap().unwrap();
        clock.init_time(0.0).unwrap();
        clock.play().unwrap();

        for i in 0..5 {
            tap.on_audio_tick(i as f64 * 0.02);
        }
        clock.step(1.0, 0.016);
        assert!(!clock.is_scheduled());

        clock.set_clip(clip()).unwrap();
        clock.step(1.016, 0.016);
        assert!(clock.is_scheduled());
    }

    #[test]
    fn test_audio_tap_is_handed_out_once() {
        let (mut clock, _) = clock_with_song(Song::new(120.0));
        assert!(clock.audio_tap().is_some());
        assert!(clock.audio_tap().is_none());
    }

    #[test]
    fn test_set_pitch_validation() {
        let (mut clock, _) = clock_with_song(Song::new(120.0));
        assert!(clock.set_pitch(0.0).is_err());
        assert!(clock.set_pitch(1.5).is_ok());
        assert_eq!(clock.pitch(), 1.5);
    }

    #[test]
    fn test_start_stop_events() {
        let (mut clock, _) = clock_with_song(Song::new(120.0));
        clock.init_time(0.0).unwrap();
        clock.play().unwrap();
        clock.play().unwrap();
        clock.pause();
        clock.pause();

        assert_eq!(
            clock.poll_events(),
            vec![SongClockEvent::StartPlaying, SongClockEvent::StopPlaying]
        );
    }
}
