use tokio::sync::broadcast;

pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Something listeners should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    Play,
    Pause,
    NewTrack(String),
    Listeners(usize),
}

impl StationEvent {
    /// Event name on the SSE wire.
    pub fn name(&self) -> &'static str {
        match self {
            StationEvent::Play => "play",
            StationEvent::Pause => "pause",
            StationEvent::NewTrack(_) => "new_track",
            StationEvent::Listeners(_) => "count_listeners",
        }
    }

    pub fn data(&self) -> String {
        match self {
            StationEvent::Play | StationEvent::Pause => String::new(),
            StationEvent::NewTrack(name) => name.clone(),
            StationEvent::Listeners(n) => n.to_string(),
        }
    }
}

/// Fan-out of station events.
///
/// Sending never waits on subscribers. A subscriber that falls more than the
/// buffer size behind loses the oldest events and sees `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<StationEvent>,
}

impl Notifier {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn notify(&self, event: StationEvent) {
        tracing::debug!("event: {}", event.name());
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
