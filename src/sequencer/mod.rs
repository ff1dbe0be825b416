//! Step sequencer driven by the song clock
//!
//! A [`BeatSequence`] is a grid of steps by instruments. The [`BeatSequencer`]
//! walks the active grid at a tempo-derived step rate and reports which
//! instruments hit on each step. Sequence changes scheduled on the song
//! timeline swap the active grid, or silence it.

use crate::error::{Result, SongClockError};
use crate::events::SongClockEvent;
use crate::song::Song;
use crate::time::TimeSource;
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;

/// Upper bound on simulated steps when looking ahead for an instrument hit
const MAX_LOOKAHEAD_STEPS: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct BeatSequence {
    steps: Vec<bool>,
    step_count: usize,
    instrument_count: usize,
    /// Length of one pass through the grid, in bars
    sequence_length: f32,
}

impl BeatSequence {
    pub fn new(step_count: usize, instrument_count: usize, sequence_length: f32) -> Result<Self> {
        if step_count == 0 || instrument_count == 0 {
            return Err(SongClockError::Configuration(format!(
                "Beat sequence needs at least one step and one instrument, got {}x{}",
                step_count, instrument_count
            )));
        }
        if !(sequence_length > 0.0) || !sequence_length.is_finite() {
            return Err(SongClockError::Configuration(format!(
                "Sequence length must be positive, got {}",
                sequence_length
            )));
        }

        Ok(Self {
            steps: vec![false; step_count * instrument_count],
            step_count,
            instrument_count,
            sequence_length,
        })
    }

    /// Enables `instrument` on every listed step
    pub fn with_hits(mut self, instrument: usize, steps: &[usize]) -> Result<Self> {
        for &step in steps {
            self.set(step, instrument, true)?;
        }
        Ok(self)
    }

    /// Out-of-range cells read as silent
    pub fn get(&self, step: usize, instrument: usize) -> bool {
        if step >= self.step_count || instrument >= self.instrument_count {
            return false;
        }
        self.steps[step + instrument * self.step_count]
    }

    pub fn set(&mut self, step: usize, instrument: usize, enabled: bool) -> Result<()> {
        if step >= self.step_count || instrument >= self.instrument_count {
            return Err(SongClockError::Configuration(format!(
                "Step ({}, {}) outside {}x{} sequence",
                step, instrument, self.step_count, self.instrument_count
            )));
        }
        self.steps[step + instrument * self.step_count] = enabled;
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn instrument_count(&self) -> usize {
        self.instrument_count
    }

    pub fn sequence_length(&self) -> f32 {
        self.sequence_length
    }

    /// Seconds per step at `bpm`
    pub fn step_time(&self, bpm: f32) -> f64 {
        60.0 / bpm as f64 / (self.sequence_length as f64 * 4.0)
    }

    fn hits(&self, step: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.instrument_count).filter(move |&instrument| self.get(step, instrument))
    }
}

/// Switches the active sequence at a song time. `None` silences the sequencer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatSequenceChange {
    pub time: f64,
    pub sequence_index: Option<usize>,
}

impl BeatSequenceChange {
    pub fn new(time: f64, sequence_index: Option<usize>) -> Self {
        Self {
            time,
            sequence_index,
        }
    }
}

type StepCallback = Box<dyn FnOnce() + Send>;

pub struct BeatSequencer {
    sequences: Vec<BeatSequence>,
    changes: Vec<BeatSequenceChange>,
    pending: VecDeque<BeatSequenceChange>,
    current: Option<usize>,
    started: bool,
    step_time: f64,
    step_counter: usize,
    last_step_time: f64,
    subscribers: Vec<Sender<usize>>,
    step_callbacks: Vec<(usize, StepCallback)>,
}

impl BeatSequencer {
    /// The first sequence is active from the start of the song.
    pub fn new(sequences: Vec<BeatSequence>, changes: Vec<BeatSequenceChange>) -> Result<Self> {
        for change in &changes {
            if let Some(index) = change.sequence_index {
                if index >= sequences.len() {
                    return Err(SongClockError::Configuration(format!(
                        "Sequence change at {}s refers to missing sequence {}",
                        change.time, index
                    )));
                }
            }
        }
        if changes.windows(2).any(|pair| pair[1].time < pair[0].time) {
            return Err(SongClockError::Configuration(
                "Sequence changes must be in time order".into(),
            ));
        }

        Ok(Self {
            pending: changes.iter().copied().collect(),
            current: (!sequences.is_empty()).then_some(0),
            sequences,
            changes,
            started: false,
            step_time: 0.0,
            step_counter: 0,
            last_step_time: 0.0,
            subscribers: Vec::new(),
            step_callbacks: Vec::new(),
        })
    }

    /// Sequencer for the grids and changes carried by `song`
    pub fn from_song(song: &Song) -> Result<Self> {
        Self::new(song.sequences.clone(), song.sequence_changes.clone())
    }

    /// Rewinds to the first sequence and the full change list, anchored at the
    /// source's current time
    pub fn start(&mut self, source: &dyn TimeSource) {
        self.pending = self.changes.iter().copied().collect();
        self.current = (!self.sequences.is_empty()).then_some(0);
        self.step_counter = 0;
        self.update_step_time(source.current_bpm(), sequencer_time(source));
        self.started = true;
    }

    /// Channel receiving the index of every instrument hit
    pub fn subscribe(&mut self) -> Receiver<usize> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.push(sender);
        receiver
    }

    /// Advances the sequencer. Returns the instruments hit this frame.
    ///
    /// Does nothing until the song has started.
    pub fn update(&mut self, source: &dyn TimeSource) -> Vec<usize> {
        if !source.has_started() {
            return Vec::new();
        }
        if !self.started {
            self.start(source);
        }

        let time = sequencer_time(source);
        while let Some(change) = self.pending.front().copied() {
            if time < change.time {
                break;
            }
            self.pending.pop_front();
            self.current = change.sequence_index;
            if self.current.is_some() {
                self.update_step_time(source.current_bpm(), change.time);
            }
            log::debug!(
                "Beat sequence changed to {:?} at {:.3}s",
                change.sequence_index,
                change.time
            );
        }

        let Some(sequence) = self.current.and_then(|index| self.sequences.get(index)) else {
            return Vec::new();
        };

        if time - self.last_step_time < self.step_time {
            return Vec::new();
        }

        self.last_step_time += self.step_time;
        // Far behind, e.g. after a seek: resync to now rather than burst through steps
        if time - self.last_step_time >= self.step_time {
            self.last_step_time = time;
        }

        let hits: Vec<usize> = sequence.hits(self.step_counter).collect();
        self.step_counter = (self.step_counter + 1) % sequence.step_count();

        for &instrument in &hits {
            self.subscribers
                .retain(|subscriber| subscriber.send(instrument).is_ok());
        }
        self.fire_step_callbacks(&hits);

        hits
    }

    /// Reacts to clock events: tempo changes rescale the step time, loops restart.
    pub fn handle_event(&mut self, event: &SongClockEvent, source: &dyn TimeSource) {
        match event {
            SongClockEvent::BpmChanged { bpm, .. } => {
                if self.current.is_some() {
                    self.update_step_time(*bpm, sequencer_time(source));
                }
            }
            SongClockEvent::Looped { .. } => self.start(source),
            _ => {}
        }
    }

    /// Seconds until `instrument` next hits, looking ahead through pending
    /// sequence changes at the current tempo. `None` if it never hits.
    pub fn time_to_next_instrument_step(
        &self,
        instrument: usize,
        source: &dyn TimeSource,
    ) -> Option<f64> {
        let now = sequencer_time(source);
        let bpm = source.current_bpm();

        let mut current = self.current;
        let mut counter = self.step_counter;
        let mut last = self.last_step_time;
        let mut step_time = self.step_time;
        let mut pending = self.pending.iter();
        let mut next_change = pending.next();

        for _ in 0..MAX_LOOKAHEAD_STEPS {
            let next_step = last + step_time;

            if let Some(change) = next_change {
                if current.is_none() || change.time <= next_step {
                    current = change.sequence_index;
                    if let Some(sequence) = current.and_then(|index| self.sequences.get(index)) {
                        counter = 0;
                        last = change.time;
                        step_time = sequence.step_time(bpm);
                    }
                    next_change = pending.next();
                    continue;
                }
            }

            let sequence = current.and_then(|index| self.sequences.get(index))?;
            if sequence.get(counter, instrument) {
                return Some((next_step - now).max(0.0));
            }
            counter = (counter + 1) % sequence.step_count();
            last = next_step;
        }

        None
    }

    /// One-shot callback for the next step on which `instrument` hits
    pub fn call_on_next_instrument_step<F>(&mut self, instrument: usize, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.step_callbacks.push((instrument, Box::new(callback)));
    }

    pub fn current_sequence(&self) -> Option<usize> {
        self.current
    }

    pub fn step_time(&self) -> f64 {
        self.step_time
    }

    pub fn step_counter(&self) -> usize {
        self.step_counter
    }

    fn update_step_time(&mut self, bpm: f32, anchor: f64) {
        let Some(sequence) = self.current.and_then(|index| self.sequences.get(index)) else {
            return;
        };
        self.step_time = sequence.step_time(bpm);
        self.last_step_time = anchor;
        self.step_counter = 0;
    }

    fn fire_step_callbacks(&mut self, hits: &[usize]) {
        if self.step_callbacks.is_empty() || hits.is_empty() {
            return;
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.step_callbacks)
            .into_iter()
            .partition(|(instrument, _)| hits.contains(instrument));
        self.step_callbacks = waiting;
        for (_, callback) in ready {
            callback();
        }
    }
}

impl std::fmt::Debug for BeatSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatSequencer")
            .field("sequences", &self.sequences.len())
            .field("current", &self.current)
            .field("step_time", &self.step_time)
            .field("step_counter", &self.step_counter)
            .field("pending_changes", &self.pending.len())
            .finish()
    }
}

/// Song time measured from the first beat
fn sequencer_time(source: &dyn TimeSource) -> f64 {
    source.current_audio_time() - source.first_beat_offset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        time: f64,
        bpm: f32,
    }

    impl TimeSource for FakeSource {
        fn current_audio_time(&self) -> f64 {
            self.time
        }

        fn has_started(&self) -> bool {
            self.time >= 0.0
        }

        fn current_bpm(&self) -> f32 {
            self.bpm
        }
    }

    fn groove() -> BeatSequence {
        BeatSequence::new(4, 4, 1.0)
            .unwrap()
            .with_hits(0, &[0, 2])
            .unwrap()
            .with_hits(1, &[1])
            .unwrap()
    }

    fn fill() -> BeatSequence {
        BeatSequence::new(4, 4, 1.0)
            .unwrap()
            .with_hits(3, &[0])
            .unwrap()
    }

    #[test]
    fn test_sequence_grid() {
        let mut sequence = BeatSequence::new(16, 4, 1.0).unwrap();
        assert!(!sequence.get(3, 2));
        sequence.set(3, 2, true).unwrap();
        assert!(sequence.get(3, 2));
        assert!(!sequence.get(2, 3));
        assert!(sequence.set(16, 0, true).is_err());
        assert!(!sequence.get(100, 0));
        assert!(BeatSequence::new(0, 4, 1.0).is_err());
        assert!(BeatSequence::new(4, 4, 0.0).is_err());
    }

    #[test]
    fn test_step_time() {
        assert_eq!(groove().step_time(120.0), 0.125);
        let two_bars = BeatSequence::new(32, 1, 2.0).unwrap();
        assert_eq!(two_bars.step_time(120.0), 0.0625);
    }

    #[test]
    fn test_rejects_bad_changes() {
        assert!(BeatSequencer::new(vec![groove()], vec![BeatSequenceChange::new(1.0, Some(1))]).is_err());
        assert!(
            BeatSequencer::new(
                vec![groove()],
                vec![
                    BeatSequenceChange::new(2.0, None),
                    BeatSequenceChange::new(1.0, Some(0)),
                ]
            )
            .is_err()
        );
    }

    #[test]
    fn test_steps_through_pattern() {
        let mut sequencer = BeatSequencer::new(vec![groove()], Vec::new()).unwrap();
        let receiver = sequencer.subscribe();
        let mut source = FakeSource { time: -1.0, bpm: 120.0 };

        assert!(sequencer.update(&source).is_empty());

        source.time = 0.0;
        assert!(sequencer.update(&source).is_empty());
        assert_eq!(sequencer.step_time(), 0.125);

        source.time = 0.1;
        assert!(sequencer.update(&source).is_empty());
        source.time = 0.125;
        assert_eq!(sequencer.update(&source), vec![0]);
        source.time = 0.25;
        assert_eq!(sequencer.update(&source), vec![1]);
        source.time = 0.375;
        assert_eq!(sequencer.update(&source), vec![0]);
        source.time = 0.5;
        assert!(sequencer.update(&source).is_empty());
        source.time = 0.625;
        assert_eq!(sequencer.update(&source), vec![0]);

        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec![0, 1, 0, 0]);
    }

    #[test]
    fn test_from_song() {
        let song = Song::new(120.0)
            .with_sequences(vec![groove(), fill()])
            .with_sequence_change(1.0, Some(1));
        let mut sequencer = BeatSequencer::from_song(&song).unwrap();
        let mut source = FakeSource { time: 0.0, bpm: 120.0 };

        assert!(sequencer.update(&source).is_empty());
        source.time = 0.125;
        assert_eq!(sequencer.update(&source), vec![0]);
        source.time = 1.0;
        sequencer.update(&source);
        assert_eq!(sequencer.current_sequence(), Some(1));

        let broken = Song::new(120.0)
            .with_sequences(vec![groove()])
            .with_sequence_change(1.0, Some(4));
        assert!(BeatSequencer::from_song(&broken).is_err());
    }

    #[test]
    fn test_sequence_changes() {
        let mut sequencer = BeatSequencer::new(
            vec![groove(), fill()],
            vec![
                BeatSequenceChange::new(0.5, None),
                BeatSequenceChange::new(1.0, Some(1)),
            ],
        )
        .unwrap();
        let mut source = FakeSource { time: 0.0, bpm: 120.0 };
        sequencer.update(&source);

        source.time = 0.5;
        assert!(sequencer.update(&source).is_empty());
        assert_eq!(sequencer.current_sequence(), None);

        source.time = 0.75;
        assert!(sequencer.update(&source).is_empty());

        source.time = 1.0;
        assert!(sequencer.update(&source).is_empty());
        assert_eq!(sequencer.current_sequence(), Some(1));

        source.time = 1.125;
        assert_eq!(sequencer.update(&source), vec![3]);
    }

    #[test]
    fn test_time_to_next_instrument_step() {
        let mut sequencer = BeatSequencer::new(
            vec![groove(), fill()],
            vec![
                BeatSequenceChange::new(0.5, None),
                BeatSequenceChange::new(1.0, Some(1)),
            ],
        )
        .unwrap();
        let source = FakeSource { time: 0.0, bpm: 120.0 };
        sequencer.start(&source);

        assert_eq!(sequencer.time_to_next_instrument_step(0, &source), Some(0.125));
        assert_eq!(sequencer.time_to_next_instrument_step(1, &source), Some(0.25));
        // Only the fill sequence after the silent gap plays instrument 3
        assert_eq!(sequencer.time_to_next_instrument_step(3, &source), Some(1.125));
        assert_eq!(sequencer.time_to_next_instrument_step(2, &source), None);
    }

    #[test]
    fn test_bpm_change_rescales_steps() {
        let mut sequencer = BeatSequencer::new(vec![groove()], Vec::new()).unwrap();
        let mut source = FakeSource { time: 0.0, bpm: 120.0 };
        sequencer.update(&source);

        source.time = 0.5;
        source.bpm = 60.0;
        sequencer.handle_event(&SongClockEvent::BpmChanged { bpm: 60.0, time: 0.5 }, &source);
        assert_eq!(sequencer.step_time(), 0.25);
        assert_eq!(sequencer.step_counter(), 0);

        source.time = 0.625;
        assert!(sequencer.update(&source).is_empty());
        source.time = 0.75;
        assert_eq!(sequencer.update(&source), vec![0]);
    }

    #[test]
    fn test_loop_restarts_sequencer() {
        let mut sequencer = BeatSequencer::new(
            vec![groove(), fill()],
            vec![BeatSequenceChange::new(0.25, Some(1))],
        )
        .unwrap();
        let mut source = FakeSource { time: 0.0, bpm: 120.0 };
        sequencer.update(&source);
        source.time = 0.25;
        sequencer.update(&source);
        assert_eq!(sequencer.current_sequence(), Some(1));

        source.time = 0.0;
        sequencer.handle_event(&SongClockEvent::Looped { loop_count: 1 }, &source);
        assert_eq!(sequencer.current_sequence(), Some(0));

        source.time = 0.125;
        assert_eq!(sequencer.update(&source), vec![0]);
    }

    #[test]
    fn test_call_on_next_instrument_step() {
        let mut sequencer = BeatSequencer::new(vec![groove()], Vec::new()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        sequencer.call_on_next_instrument_step(1, move || {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        let mut source = FakeSource { time: 0.0, bpm: 120.0 };
        sequencer.update(&source);
        source.time = 0.125;
        sequencer.update(&source);
        assert_eq!(count.load(Ordering::Relaxed), 0);

        source.time = 0.25;
        sequencer.update(&source);
        source.time = 0.625;
        sequencer.update(&source);
        source.time = 0.75;
        sequencer.update(&source);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
