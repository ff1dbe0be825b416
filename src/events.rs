//! Event types and dispatch for beatsync

use crossbeam_channel::{Receiver, Sender};

/// Discrete clock events, emitted synchronously from the game-loop context.
#[derive(Debug, Clone, PartialEq)]
pub enum SongClockEvent {
    /// Playback was requested; audio starts at the next scheduled tick
    StartPlaying,
    /// Playback was paused or stopped
    StopPlaying,
    /// Tempo changed. `current_bpm` already reflects `bpm` when this fires.
    BpmChanged { bpm: f32, time: f64 },
    /// The song wrapped back to zero
    Looped { loop_count: u32 },
}

impl SongClockEvent {
    pub fn is_transport_event(&self) -> bool {
        matches!(self, Self::StartPlaying | Self::StopPlaying)
    }

    pub fn bpm(&self) -> Option<f32> {
        match self {
            Self::BpmChanged { bpm, .. } => Some(*bpm),
            _ => None,
        }
    }
}

type Listener = Box<dyn FnMut(&SongClockEvent) + Send>;
type StartedCallback = Box<dyn FnOnce() + Send>;

/// Observer list for [`SongClockEvent`]s.
///
/// Supports channel subscribers (drained by the consumer on its own schedule),
/// synchronous listeners, and one-shot callbacks for the first step at which
/// the song has started.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: Vec<Sender<SongClockEvent>>,
    listeners: Vec<Listener>,
    started_callbacks: Vec<StartedCallback>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// New channel that receives every event emitted from now on
    pub fn subscribe(&mut self) -> Receiver<SongClockEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.push(sender);
        receiver
    }

    /// Registers a listener called in emission order, from the game loop
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&SongClockEvent) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn on_started<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.started_callbacks.push(Box::new(callback));
    }

    pub fn has_started_callbacks(&self) -> bool {
        !self.started_callbacks.is_empty()
    }

    pub fn emit(&mut self, event: SongClockEvent) {
        log::debug!("Clock event: {:?}", event);

        for listener in self.listeners.iter_mut() {
            listener(&event);
        }

        // Drop subscribers whose receiver has gone away
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Runs and discards every pending one-shot started callback
    pub fn fire_started(&mut self) {
        for callback in self.started_callbacks.drain(..) {
            callback();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscribers.len())
            .field("listeners", &self.listeners.len())
            .field("started_callbacks", &self.started_callbacks.len())
            .finish()
    }
}
