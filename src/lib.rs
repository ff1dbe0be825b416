//! # beatsync
//!
//! A drift-corrected song clock for rhythm games.
//!
//! The game loop owns a [`SongClock`] and steps it once per frame; the audio
//! callback owns the matching [`AudioTap`] and reports device time at every
//! buffer boundary. Playback is scheduled on a future audio tick so it starts
//! sample-accurately, and the clock exposes audio-relative time that stays in
//! lock-step with what is actually heard, even across game-loop hitches.
//!
//! ## Quick Start
//!
//! ```no_run
//! use beatsync::*;
//! use std::time::{Duration, Instant};
//!
//! let clip = AudioClip::silence(Duration::from_secs(30), 48000, 2)?;
//! let song = Song::new(128.0).with_clip(clip).with_bpm_change(16.0, 140.0);
//!
//! let mut clock = SongClock::new(SongClockConfig::default().pre_roll(1.0))?;
//! clock.set_song(song)?;
//!
//! // The engine drives the audio side of the clock
//! let tap = clock.audio_tap().expect("a new clock still owns its tap");
//! let mut engine = SongClockEngine::new(EngineDesc::default(), tap)?;
//! clock.set_backend(Box::new(engine.backend()));
//! engine.start()?;
//!
//! clock.init_time(0.0)?;
//! clock.play()?;
//!
//! let origin = Instant::now();
//! let mut last = 0.0;
//! loop {
//!     let now = origin.elapsed().as_secs_f64();
//!     clock.step(now, now - last);
//!     last = now;
//!
//!     for event in clock.poll_events() {
//!         if let SongClockEvent::BpmChanged { bpm, .. } = event {
//!             println!("Tempo is now {}", bpm);
//!         }
//!     }
//!
//!     let song_time = clock.current_audio_time();
//!     # if song_time > 30.0 { break; }
//!     std::thread::sleep(Duration::from_millis(16));
//! }
//! # Ok::<(), SongClockError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`SongClock`]**: Game-loop side. Scheduling, drift correction, tempo and loop events
//! - **[`AudioTap`]**: Audio-callback side. Measures the tick period and latches the start instant
//! - **[`SongClockEngine`]**: cpal output stream that drives an `AudioTap` and renders the song
//! - **[`PlaybackBackend`]**: Trait for plugging in any output that can start a clip at a device time
//! - **[`BeatSequencer`]**: Step sequencer that reads the clock through [`TimeSource`]
//!
//! ## Threading
//!
//! The two sides share only single-writer atomics. Every value the audio
//! callback publishes is tagged with the session generation it belongs to, so
//! observations raised before a pause are never applied to the next session.

pub mod audio_data;
pub mod audio_tap;
pub mod clock;
pub mod config;
pub mod drift;
pub mod engine;
pub mod error;
pub mod events;
pub mod playback;
pub mod scheduler;
pub mod sequencer;
pub mod song;
pub mod time;
pub mod timeline;

pub use audio_data::AudioClip;
pub use audio_tap::{AudioTap, SharedTiming};
pub use clock::{ClockState, SongClock};
pub use config::{EngineDesc, SongClockConfig};
pub use drift::{DriftCorrector, SyncSample};
pub use engine::SongClockEngine;
pub use error::SongClockError;
pub use events::{EventDispatcher, SongClockEvent};
pub use playback::{PlaybackBackend, PlayerBackend, ScheduleRequest, ScheduledPlayer};
pub use scheduler::{ScheduledPlayback, Scheduler, schedule_playback};
pub use sequencer::{BeatSequence, BeatSequenceChange, BeatSequencer};
pub use song::{BpmChange, Song};
pub use time::{HostClock, ManualClock, MonotonicClock, TimeSource};
pub use timeline::{BpmTimeline, LoopPoint};
