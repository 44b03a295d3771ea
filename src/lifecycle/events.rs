//! Notifications emitted by a chunk lifecycle to its owner.

use crate::error::LoadError;
use crate::types::ChunkId;

/// Something the owner of a chunk may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEvent {
    /// Content is on screen.
    Loaded {
        chunk_id: ChunkId,
        /// Served from the cache without a resolution.
        from_cache: bool,
    },

    /// Content was cleared from the screen after the unload delay.
    Unloaded { chunk_id: ChunkId },

    /// A load attempt failed or timed out.
    Error {
        chunk_id: ChunkId,
        error: LoadError,
        /// An automatic retry is pending.
        retry_scheduled: bool,
    },

    /// The resolver completed with synthetic content.
    SyntheticLoadCompleted { chunk_id: ChunkId, message: String },
}

impl ChunkEvent {
    pub fn chunk_id(&self) -> &str {
        match self {
            ChunkEvent::Loaded { chunk_id, .. }
            | ChunkEvent::Unloaded { chunk_id }
            | ChunkEvent::Error { chunk_id, .. }
            | ChunkEvent::SyntheticLoadCompleted { chunk_id, .. } => chunk_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ChunkEvent::Error { .. })
    }
}

/// Receives [`ChunkEvent`]s. Called synchronously from the lifecycle, in
/// transition order; keep it quick.
pub trait ChunkEventListener: Send + Sync + 'static {
    fn on_event(&self, event: ChunkEvent);
}

impl<F> ChunkEventListener for F
where
    F: Fn(ChunkEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: ChunkEvent) {
        self(event)
    }
}

/// Discards every event.
pub struct NoopChunkListener;

impl ChunkEventListener for NoopChunkListener {
    fn on_event(&self, _event: ChunkEvent) {}
}

/// Logs every event.
pub struct LoggingChunkListener;

impl ChunkEventListener for LoggingChunkListener {
    fn on_event(&self, event: ChunkEvent) {
        match &event {
            ChunkEvent::Loaded {
                chunk_id,
                from_cache,
            } => {
                tracing::info!(chunk_id = %chunk_id, from_cache, "Chunk loaded");
            }
            ChunkEvent::Unloaded { chunk_id } => {
                tracing::info!(chunk_id = %chunk_id, "Chunk unloaded");
            }
            ChunkEvent::Error {
                chunk_id,
                error,
                retry_scheduled,
            } => {
                tracing::warn!(chunk_id = %chunk_id, error = %error, retry_scheduled, "Chunk load failed");
            }
            ChunkEvent::SyntheticLoadCompleted { chunk_id, message } => {
                tracing::info!(chunk_id = %chunk_id, message = %message, "Chunk loaded synthetic content");
            }
        }
    }
}
