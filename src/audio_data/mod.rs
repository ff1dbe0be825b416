//! In-memory audio clips

use crate::error::{Result, SongClockError};
use std::sync::Arc;
use std::time::Duration;

/// Immutable interleaved PCM clip, cheap to clone and share with the audio thread.
#[derive(Debug, Clone)]
pub struct AudioClip {
    inner: Arc<ClipInner>,
}

#[derive(Debug)]
struct ClipInner {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    total_frames: usize,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 {
            return Err(SongClockError::AudioFormat("Sample rate must be non-zero".into()));
        }
        if channels == 0 {
            return Err(SongClockError::AudioFormat("Channel count must be non-zero".into()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(SongClockError::AudioFormat(format!(
                "Sample count {} is not a multiple of {} channels",
                samples.len(),
                channels
            )));
        }

        let total_frames = samples.len() / channels as usize;
        Ok(Self {
            inner: Arc::new(ClipInner {
                samples,
                sample_rate,
                channels,
                total_frames,
            }),
        })
    }

    /// A silent clip of the given length, useful when only the clock matters
    pub fn silence(duration: Duration, sample_rate: u32, channels: u16) -> Result<Self> {
        let frames = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; frames * channels as usize], sample_rate, channels)
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.inner.samples
    }

    pub fn total_frames(&self) -> usize {
        self.inner.total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.inner.total_frames == 0
    }

    pub fn duration_secs(&self) -> f64 {
        self.inner.total_frames as f64 / self.inner.sample_rate as f64
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }

    /// Sample of `channel` at `frame`. Channels beyond the clip's own are
    /// folded back onto the available ones (mono clips feed every output channel).
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        let channels = self.inner.channels as usize;
        self.inner.samples[frame * channels + channel % channels]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_duration() {
        let clip = AudioClip::new(vec![0.0; 48000 * 2], 48000, 2).unwrap();
        assert_eq!(clip.total_frames(), 48000);
        assert!((clip.duration_secs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_interleaving() {
        assert!(AudioClip::new(vec![0.0; 3], 44100, 2).is_err());
        assert!(AudioClip::new(vec![0.0; 4], 0, 2).is_err());
        assert!(AudioClip::new(vec![0.0; 4], 44100, 0).is_err());
    }

    #[test]
    fn test_mono_clip_feeds_all_channels() {
        let clip = AudioClip::new(vec![0.25, 0.5], 44100, 1).unwrap();
        assert_eq!(clip.sample(1, 0), 0.5);
        assert_eq!(clip.sample(1, 1), 0.5);
    }

    #[test]
    fn test_silence() {
        let clip = AudioClip::silence(Duration::from_millis(500), 1000, 1).unwrap();
        assert_eq!(clip.total_frames(), 500);
        assert!(clip.samples().iter().all(|s| *s == 0.0));
    }
}
