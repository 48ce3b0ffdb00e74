//! Queue-level error model.

use thiserror::Error;

use tradeflow_core::DomainError;

use crate::stream::StreamError;

/// Error surfaced by the publish, consume setup and admin APIs.
///
/// Every variant that touches a stream names the queue involved. Handler
/// failures never appear here: consume loops turn them into retry/dead-letter
/// writes.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue: {0}")]
    InvalidQueue(#[from] DomainError),

    #[error("failed to encode message for {queue}: {source}")]
    Serialization {
        queue: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stream store error on {queue}: {source}")]
    Store {
        queue: String,
        #[source]
        source: StreamError,
    },

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl QueueError {
    pub fn store(queue: impl Into<String>, source: StreamError) -> Self {
        Self::Store {
            queue: queue.into(),
            source,
        }
    }

    pub fn serialization(queue: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            queue: queue.into(),
            source,
        }
    }

    /// The underlying store error, if this is a store failure.
    pub fn stream_error(&self) -> Option<&StreamError> {
        match self {
            Self::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}
