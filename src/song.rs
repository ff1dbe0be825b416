//! Song metadata supplied to the clock at `init_time`

use crate::audio_data::AudioClip;
use crate::error::{Result, SongClockError};
use crate::sequencer::{BeatSequence, BeatSequenceChange};

/// A tempo change at an absolute song time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpmChange {
    /// Seconds into the song at which the tempo changes
    pub time: f64,
    pub bpm: f32,
}

impl BpmChange {
    pub fn new(time: f64, bpm: f32) -> Self {
        Self { time, bpm }
    }
}

/// Immutable description of the song being played.
#[derive(Debug, Clone)]
pub struct Song {
    pub base_bpm: f32,
    /// Tempo changes in strictly increasing time order
    pub bpm_changes: Vec<BpmChange>,
    /// Wrap back to zero when the loop point is reached
    pub looping: bool,
    /// Delay to the first beat, for visual alignment
    pub first_beat_offset_ms: f32,
    /// Explicit loop point; falls back to the clip length when `None`
    pub loop_duration: Option<f64>,
    pub clip: Option<AudioClip>,
    /// Step grids for a [`BeatSequencer`](crate::BeatSequencer); the first is active from the start
    pub sequences: Vec<BeatSequence>,
    pub sequence_changes: Vec<BeatSequenceChange>,
}

impl Default for Song {
    fn default() -> Self {
        Self {
            base_bpm: 128.0,
            bpm_changes: Vec::new(),
            looping: false,
            first_beat_offset_ms: 0.0,
            loop_duration: None,
            clip: None,
            sequences: Vec::new(),
            sequence_changes: Vec::new(),
        }
    }
}

impl Song {
    pub fn new(base_bpm: f32) -> Self {
        Self {
            base_bpm,
            ..Default::default()
        }
    }

    pub fn with_clip(mut self, clip: AudioClip) -> Self {
        self.clip = Some(clip);
        self
    }

    pub fn with_bpm_change(mut self, time: f64, bpm: f32) -> Self {
        self.bpm_changes.push(BpmChange::new(time, bpm));
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn loop_duration(mut self, seconds: f64) -> Self {
        self.loop_duration = Some(seconds);
        self
    }

    pub fn with_sequences(mut self, sequences: Vec<BeatSequence>) -> Self {
        self.sequences = sequences;
        self
    }

    pub fn with_sequence_change(mut self, time: f64, sequence_index: Option<usize>) -> Self {
        self.sequence_changes
            .push(BeatSequenceChange::new(time, sequence_index));
        self
    }

    pub fn first_beat_offset_ms(mut self, offset_ms: f32) -> Self {
        self.first_beat_offset_ms = offset_ms;
        self
    }

    pub fn first_beat_offset_secs(&self) -> f64 {
        self.first_beat_offset_ms as f64 / 1000.0
    }

    pub fn require_clip(&self) -> Result<&AudioClip> {
        self.clip.as_ref().ok_or(SongClockError::NoClip)
    }

    /// Loop point in seconds, or `None` when the song does not loop
    pub fn effective_loop_duration(&self) -> Option<f64> {
        if !self.looping {
            return None;
        }
        self.loop_duration
            .or_else(|| self.clip.as_ref().map(AudioClip::duration_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_bpm > 0.0) {
            return Err(SongClockError::InvalidSong(format!(
                "Base BPM must be positive, got {}",
                self.base_bpm
            )));
        }

        for change in &self.bpm_changes {
            if !(change.bpm > 0.0) {
                return Err(SongClockError::InvalidSong(format!(
                    "BPM change at {}s must be positive, got {}",
                    change.time, change.bpm
                )));
            }
        }

        if let Some(pair) = self
            .bpm_changes
            .windows(2)
            .find(|pair| pair[1].time <= pair[0].time)
        {
            return Err(SongClockError::InvalidSong(format!(
                "BPM change times must be strictly increasing ({}s then {}s)",
                pair[0].time, pair[1].time
            )));
        }

        if let Some(duration) = self.loop_duration {
            if !(duration > 0.0) {
                return Err(SongClockError::InvalidSong(format!(
                    "Loop duration must be positive, got {}",
                    duration
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_song_validation() {
        let song = Song::new(120.0)
            .with_bpm_change(1.0, 140.0)
            .with_bpm_change(2.0, 160.0);
        assert!(song.validate().is_ok());

        let unordered = Song::new(120.0)
            .with_bpm_change(2.0, 140.0)
            .with_bpm_change(2.0, 160.0);
        assert!(unordered.validate().is_err());

        assert!(Song::new(0.0).validate().is_err());
        assert!(Song::new(120.0).with_bpm_change(1.0, -5.0).validate().is_err());
        assert!(Song::new(120.0).loop_duration(0.0).validate().is_err());
    }

    #[test]
    fn test_require_clip() {
        let song = Song::new(120.0);
        assert!(matches!(song.require_clip(), Err(SongClockError::NoClip)));
        let song = song.with_clip(AudioClip::silence(Duration::from_secs(1), 1000, 1).unwrap());
        assert!(song.require_clip().is_ok());
    }

    #[test]
    fn test_effective_loop_duration() {
        let clip = AudioClip::silence(Duration::from_secs(4), 1000, 1).unwrap();
        let song = Song::new(120.0).with_clip(clip);
        assert_eq!(song.effective_loop_duration(), None);

        let song = song.looping(true);
        assert!((song.effective_loop_duration().unwrap() - 4.0).abs() < 1e-9);

        let song = song.loop_duration(2.5);
        assert_eq!(song.effective_loop_duration(), Some(2.5));
    }

    #[test]
    fn test_first_beat_offset() {
        let song = Song::new(120.0).first_beat_offset_ms(250.0);
        assert!((song.first_beat_offset_secs() - 0.25).abs() < 1e-9);
    }
}
