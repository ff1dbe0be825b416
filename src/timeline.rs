//! Time-ordered musical events dispatched against the corrected clock

use crate::error::{Result, SongClockError};
use crate::song::{BpmChange, Song};

/// Ordered tempo changes consumed through a single forward cursor.
///
/// Entries behind the cursor are never replayed until [`reset`](Self::reset)
/// rewinds it, which the clock does when the song loops.
#[derive(Debug, Clone)]
pub struct BpmTimeline {
    base_bpm: f32,
    current_bpm: f32,
    changes: Vec<BpmChange>,
    cursor: usize,
}

impl BpmTimeline {
    pub fn new(base_bpm: f32, changes: Vec<BpmChange>) -> Self {
        Self {
            base_bpm,
            current_bpm: base_bpm,
            changes,
            cursor: 0,
        }
    }

    pub fn from_song(song: &Song) -> Self {
        Self::new(song.base_bpm, song.bpm_changes.clone())
    }

    pub fn current_bpm(&self) -> f32 {
        self.current_bpm
    }

    pub fn base_bpm(&self) -> f32 {
        self.base_bpm
    }

    /// Next change that has not fired yet
    pub fn peek(&self) -> Option<&BpmChange> {
        self.changes.get(self.cursor)
    }

    pub fn remaining(&self) -> usize {
        self.changes.len() - self.cursor
    }

    /// Fires every change whose time has been reached, oldest first.
    ///
    /// A single large jump in `current_time` dispatches all crossed entries
    /// before returning. Returns how many fired.
    pub fn advance(&mut self, current_time: f64, mut on_change: impl FnMut(BpmChange)) -> usize {
        let mut fired = 0;
        while let Some(&change) = self.changes.get(self.cursor) {
            if current_time < change.time {
                break;
            }
            self.current_bpm = change.bpm;
            self.cursor += 1;
            fired += 1;
            on_change(change);
        }
        fired
    }

    /// Rewinds to the start of the song
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.current_bpm = self.base_bpm;
    }
}

/// Song position at which playback wraps back to zero
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopPoint {
    duration: f64,
}

impl LoopPoint {
    pub fn new(duration: f64) -> Result<Self> {
        if !(duration > 0.0) || !duration.is_finite() {
            return Err(SongClockError::InvalidSong(format!(
                "Loop duration must be positive and finite, got {}",
                duration
            )));
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_reached(&self, current_time: f64) -> bool {
        current_time >= self.duration
    }
}
