//! cpal output engine driving the audio side of the song clock
//!
//! Each device callback advances a sample-counted device clock, feeds it to
//! the [`AudioTap`], then renders the scheduled clip into the buffer.

use crate::audio_tap::AudioTap;
use crate::config::EngineDesc;
use crate::error::{Result, SongClockError};
use crate::playback::{PlayerBackend, ScheduledPlayer};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Audio-thread state, owned by the stream callback
struct CallbackState {
    tap: AudioTap,
    player: ScheduledPlayer,
    /// Sized once at construction; device buffers of any length are rendered
    /// through it in chunks
    scratch: Vec<f32>,
    sample_rate: u32,
}

impl CallbackState {
    /// Runs one device callback. `device_time` is the time of the buffer's first frame.
    fn process<T>(&mut self, data: &mut [T], channels: u16, device_time: f64) -> usize
    where
        T: SizedSample + FromSample<f32>,
    {
        self.tap.on_audio_tick(device_time);

        let channels_usize = channels.max(1) as usize;
        let chunk_len = self.scratch.len() - self.scratch.len() % channels_usize;
        if chunk_len == 0 {
            data.fill(T::from_sample(0.0f32));
            return 0;
        }

        let mut rendered = 0;
        let mut chunk_time = device_time;
        for chunk in data.chunks_mut(chunk_len) {
            let scratch = &mut self.scratch[..chunk.len()];
            scratch.fill(0.0);
            rendered += self.player.render(scratch, channels, chunk_time);
            for (out, sample) in chunk.iter_mut().zip(scratch.iter()) {
                *out = T::from_sample(*sample);
            }
            chunk_time += (chunk.len() / channels_usize) as f64 / self.sample_rate as f64;
        }
        rendered
    }
}

/// Real-time audio output that keeps the song clock's device time
pub struct SongClockEngine {
    desc: EngineDesc,
    stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
    frames_processed: Arc<AtomicUsize>,
    state: Arc<Mutex<CallbackState>>,
    backend: PlayerBackend,
}

impl SongClockEngine {
    /// Create an engine that reports to `tap`, the one handed out by [`SongClock::audio_tap`](crate::SongClock::audio_tap)
    pub fn new(desc: EngineDesc, tap: AudioTap) -> Result<Self> {
        if desc.sample_rate == 0 || desc.channels == 0 || desc.block_size == 0 {
            return Err(SongClockError::Configuration(format!(
                "Invalid engine description: {:?}",
                desc
            )));
        }

        let (player, backend) = ScheduledPlayer::new(desc.sample_rate);
        let scratch = vec![0.0; desc.block_size * desc.channels as usize];
        let sample_rate = desc.sample_rate;

        Ok(Self {
            desc,
            stream: None,
            is_running: Arc::new(AtomicBool::new(false)),
            frames_processed: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(CallbackState {
                tap,
                player,
                scratch,
                sample_rate,
            })),
            backend,
        })
    }

    /// Playback handle to pass to [`SongClock::set_backend`](crate::SongClock::set_backend)
    pub fn backend(&self) -> PlayerBackend {
        self.backend.clone()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            SongClockError::AudioDevice("No default output device available".into())
        })?;

        let config = cpal::StreamConfig {
            channels: self.desc.channels,
            sample_rate: cpal::SampleRate(self.desc.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.desc.block_size as u32),
        };

        let default_config = device.default_output_config().map_err(|e| {
            SongClockError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_stream::<f32>(&device, &config)?,
            cpal::SampleFormat::I16 => self.create_stream::<i16>(&device, &config)?,
            cpal::SampleFormat::U16 => self.create_stream::<u16>(&device, &config)?,
            format => {
                return Err(SongClockError::AudioFormat(format!(
                    "Unsupported sample format: {:?}",
                    format
                )));
            }
        };

        stream
            .play()
            .map_err(|e| SongClockError::AudioDevice(format!("Failed to start stream: {}", e)))?;

        log::info!(
            "Audio engine started ({} Hz, {} channels, {} frame blocks)",
            self.desc.sample_rate,
            self.desc.channels,
            self.desc.block_size
        );

        self.stream = Some(stream);
        self.is_running.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            self.is_running.store(false, Ordering::Relaxed);
            drop(stream);
            log::info!("Audio engine stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Frames the device has consumed since the engine was created
    pub fn frames_processed(&self) -> usize {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// Device time derived from the frame counter
    pub fn device_time(&self) -> f64 {
        self.frames_processed() as f64 / self.desc.sample_rate as f64
    }

    pub fn config(&self) -> &EngineDesc {
        &self.desc
    }

    fn create_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let state = self.state.clone();
        let is_running = self.is_running.clone();
        let frames_processed = self.frames_processed.clone();
        let sample_rate = self.desc.sample_rate;
        let channels = self.desc.channels;
        let channels_usize = channels as usize;

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let silence = T::from_sample(0.0f32);
                    if !is_running.load(Ordering::Relaxed) {
                        data.fill(silence);
                        return;
                    }

                    let frame_count = data.len() / channels_usize;
                    let frames_before = frames_processed.fetch_add(frame_count, Ordering::Relaxed);
                    let device_time = frames_before as f64 / sample_rate as f64;

                    // Never block the audio thread
                    let Ok(mut state) = state.try_lock() else {
                        data.fill(silence);
                        return;
                    };

                    state.process(data, channels, device_time);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SongClockError::AudioDevice(format!("Failed to build stream: {}", e)))?;

        Ok(stream)
    }
}

impl Drop for SongClockEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
