//! Error types for the keyindex engine.

use thiserror::Error;

/// Errors that can occur while driving an index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("I cannot process this event type: {0}")]
    InvalidEventKind(String),

    #[error("cannot {operation} on read-only index view (after calling limit, end_at, or start_at)")]
    UnsupportedOperation { operation: String },

    #[error("index has been disposed; create a new instance to perform further operations")]
    Disposed,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl IndexError {
    pub(crate) fn unsupported(operation: &str) -> Self {
        Self::UnsupportedOperation {
            operation: operation.to_string(),
        }
    }

    /// Returns `true` for programming-usage errors raised synchronously
    /// to the caller (the instance itself stays usable unless disposed).
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidEventKind(_) | Self::UnsupportedOperation { .. } | Self::Disposed
        )
    }

    /// Returns `true` if the error came from an external store.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
