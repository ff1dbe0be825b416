//! Scheduled clip playback
//!
//! The clock decides *when* audio starts; a [`PlaybackBackend`] makes it happen.
//! [`ScheduledPlayer`] is the audio-thread renderer used by the built-in engine,
//! controlled through a [`PlayerBackend`] handle over a command channel.

use crate::audio_data::AudioClip;
use crate::error::{Result, SongClockError};
use atomic_float::AtomicF64;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Commands the game loop may queue before the audio thread drains them
const COMMAND_CAPACITY: usize = 64;
/// Clips the audio thread may hand back before the game loop collects them
const RETIRED_CAPACITY: usize = 16;

/// Request to start a clip at a future device-time instant
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub clip: AudioClip,
    /// Device time of the first audible sample
    pub device_time: f64,
    /// Position inside the clip to start from, in clip seconds
    pub clip_start: f64,
    pub pitch: f32,
    pub looping: bool,
    /// Clip position at which a looping clip wraps, in clip seconds. The clip
    /// end when `None`.
    pub loop_end: Option<f64>,
}

/// Audio output the clock can schedule against.
pub trait PlaybackBackend: Send {
    fn schedule(&mut self, request: ScheduleRequest) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Current clip position in clip seconds, once playback has begun
    fn playhead(&self) -> Option<f64>;
}

/// Commands sent from the game loop to the audio thread
#[derive(Debug)]
pub enum PlaybackCommand {
    Schedule(ScheduleRequest),
    Stop,
}

/// Game-loop handle for a [`ScheduledPlayer`]
#[derive(Debug, Clone)]
pub struct PlayerBackend {
    command_sender: Sender<PlaybackCommand>,
    retired_receiver: Receiver<AudioClip>,
    playhead: Arc<AtomicF64>,
}

impl PlayerBackend {
    /// Releases clips the audio thread has finished with. Returns how many.
    pub fn collect_retired(&self) -> usize {
        self.retired_receiver.try_iter().count()
    }

    fn send(&self, command: PlaybackCommand) -> Result<()> {
        self.collect_retired();
        self.command_sender
            .try_send(command)
            .map_err(|e| SongClockError::Engine(format!("Failed to send playback command: {}", e)))
    }
}

impl PlaybackBackend for PlayerBackend {
    fn schedule(&mut self, request: ScheduleRequest) -> Result<()> {
        self.send(PlaybackCommand::Schedule(request))
    }

    fn stop(&mut self) -> Result<()> {
        self.playhead.store(-1.0, Ordering::Release);
        self.send(PlaybackCommand::Stop)
    }

    fn playhead(&self) -> Option<f64> {
        let position = self.playhead.load(Ordering::Acquire);
        (position >= 0.0).then_some(position)
    }
}

#[derive(Debug)]
struct ActivePlayback {
    clip: AudioClip,
    device_time: f64,
    /// Fractional frame position in the clip
    position: f64,
    /// Clip frames advanced per output frame
    step: f64,
    looping: bool,
    /// Frame at which a looping clip wraps
    loop_frames: usize,
    started: bool,
}

/// Renders a scheduled clip on the audio thread.
///
/// Both channels are bounded, so neither side allocates per command. Clips the
/// player is done with travel back to the [`PlayerBackend`] and are released
/// on the game loop.
#[derive(Debug)]
pub struct ScheduledPlayer {
    sample_rate: u32,
    command_receiver: Receiver<PlaybackCommand>,
    retired_sender: Sender<AudioClip>,
    active: Option<ActivePlayback>,
    playhead: Arc<AtomicF64>,
}

impl ScheduledPlayer {
    pub fn new(sample_rate: u32) -> (Self, PlayerBackend) {
        let (command_sender, command_receiver) = crossbeam_channel::bounded(COMMAND_CAPACITY);
        let (retired_sender, retired_receiver) = crossbeam_channel::bounded(RETIRED_CAPACITY);
        let playhead = Arc::new(AtomicF64::new(-1.0));
        (
            Self {
                sample_rate,
                command_receiver,
                retired_sender,
                active: None,
                playhead: playhead.clone(),
            },
            PlayerBackend {
                command_sender,
                retired_receiver,
                playhead,
            },
        )
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Hands the active clip back to the game loop instead of dropping it here
    fn retire(&mut self) {
        if let Some(active) = self.active.take() {
            // Only drops on this thread if the game loop stopped collecting
            let _ = self.retired_sender.try_send(active.clip);
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.command_receiver.try_recv() {
            self.retire();
            match command {
                PlaybackCommand::Schedule(request) => {
                    let clip_rate = request.clip.sample_rate() as f64;
                    let total_frames = request.clip.total_frames();
                    let loop_frames = request
                        .loop_end
                        .map(|end| ((end * clip_rate).round().max(1.0) as usize).min(total_frames))
                        .unwrap_or(total_frames);
                    self.active = Some(ActivePlayback {
                        position: (request.clip_start * clip_rate).max(0.0),
                        step: request.pitch as f64 * clip_rate / self.sample_rate as f64,
                        device_time: request.device_time,
                        looping: request.looping,
                        loop_frames,
                        started: false,
                        clip: request.clip,
                    });
                }
                PlaybackCommand::Stop => {
                    self.playhead.store(-1.0, Ordering::Release);
                }
            }
        }
    }

    /// Mixes the active clip into `buffer`, whose first frame plays at
    /// `device_time`. Returns the number of frames written.
    pub fn render(&mut self, buffer: &mut [f32], channels: u16, device_time: f64) -> usize {
        self.process_commands();

        let Some(active) = self.active.as_mut() else {
            return 0;
        };

        let channels = channels.max(1) as usize;
        let frame_count = buffer.len() / channels;
        let total_frames = active.clip.total_frames();
        if total_frames == 0 || active.loop_frames == 0 {
            self.retire();
            return 0;
        }
        let end_frames = if active.looping {
            active.loop_frames
        } else {
            total_frames
        };

        // Sample-accurate start inside this buffer
        let lead = (active.device_time - device_time) * self.sample_rate as f64;
        let first_frame = lead.ceil().max(0.0) as usize;
        if first_frame >= frame_count {
            return 0;
        }
        active.started = true;

        let mut frames_filled = 0;
        let mut finished = false;

        for frame_idx in first_frame..frame_count {
            if active.position >= end_frames as f64 {
                if active.looping {
                    active.position %= end_frames as f64;
                } else {
                    finished = true;
                    break;
                }
            }

            let index = active.position.floor() as usize;
            let fraction = (active.position - index as f64) as f32;
            let next = if index + 1 < end_frames {
                index + 1
            } else if active.looping {
                0
            } else {
                index
            };

            for channel in 0..channels {
                let a = active.clip.sample(index, channel);
                let b = active.clip.sample(next, channel);
                buffer[frame_idx * channels + channel] += a + (b - a) * fraction;
            }

            active.position += active.step;
            frames_filled += 1;
        }

        let clip_seconds = active.position / active.clip.sample_rate() as f64;
        self.playhead.store(clip_seconds, Ordering::Release);

        if finished || (!active.looping && active.position >= total_frames as f64) {
            self.retire();
        }

        frames_filled
    }
}
