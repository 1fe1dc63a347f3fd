use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

/// Receives one record per track that starts playing.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record_play(&self, track_name: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub track_name: String,
    /// Unix seconds.
    pub played_at: i64,
}

/// Keeps plays in memory, oldest first.
#[derive(Default)]
pub struct MemoryHistory {
    plays: Mutex<Vec<String>>,
}

impl MemoryHistory {
    pub fn plays(&self) -> Vec<String> {
        self.plays.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn record_play(&self, track_name: &str) -> anyhow::Result<()> {
        self.plays
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?
            .push(track_name.to_string());
        Ok(())
    }
}
