/// Errors surfaced by the playback engine to its callers.
///
/// `Tick` never returns these to anyone: the ticker logs them and keeps the
/// clock running. `Play` and `Reload` hand them back to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("playback queue is empty")]
    EmptyQueue,

    #[error("segment generation failed for track {track_id}: {source}")]
    SegmentGenerationFailed {
        track_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("queue is inconsistent: {0}")]
    QueueInconsistent(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
