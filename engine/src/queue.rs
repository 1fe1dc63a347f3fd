use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::track::Track;

/// The rotating order of tracks the station plays.
///
/// The engine only ever reads the head pair and rotates; edits happen
/// elsewhere and are followed by `Station::reload`.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Head and second track. A single-track queue returns that track twice;
    /// an empty queue returns `(None, None)`.
    async fn current_and_next(&self) -> anyhow::Result<(Option<Track>, Option<Track>)>;

    /// Moves the head to the tail. No-op with fewer than two tracks.
    async fn rotate(&self) -> anyhow::Result<()>;

    async fn current(&self) -> anyhow::Result<Option<Track>> {
        Ok(self.current_and_next().await?.0)
    }

    async fn next(&self) -> anyhow::Result<Option<Track>> {
        Ok(self.current_and_next().await?.1)
    }
}

/// Queue held entirely in memory.
#[derive(Default)]
pub struct MemoryQueue {
    tracks: Mutex<VecDeque<Track>>,
}

impl MemoryQueue {
    pub fn new(tracks: impl IntoIterator<Item = Track>) -> Self {
        Self {
            tracks: Mutex::new(tracks.into_iter().collect()),
        }
    }

    pub fn remove(&self, id: &str) {
        self.lock().retain(|t| t.id != id);
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().iter().map(|t| t.id.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Track>> {
        // A poisoned queue still holds a valid order.
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn current_and_next(&self) -> anyhow::Result<(Option<Track>, Option<Track>)> {
        let q = self.lock();
        let current = q.front().cloned();
        let next = q.get(1).or(q.front()).cloned();
        Ok((current, next))
    }

    async fn rotate(&self) -> anyhow::Result<()> {
        let mut q = self.lock();
        if q.len() > 1 {
            q.rotate_left(1);
        }
        Ok(())
    }
}
