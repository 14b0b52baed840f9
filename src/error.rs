//! Error types for nano-kvsched.

use thiserror::Error;

/// Result type alias for nano-kvsched operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-kvsched.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough free KV cache blocks to satisfy an allocation.
    ///
    /// Recoverable: the scheduler turns it into a stopped stream.
    #[error("insufficient kv cache blocks: requested {requested}, free {free}")]
    InsufficientMemory { requested: usize, free: usize },

    /// Malformed request rejected before entering the queue.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Block pool accounting no longer adds up.
    #[error("block pool invariant violated: {0}")]
    InvariantViolation(String),

    /// Invalid stream state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The compute executor failed while processing a batch.
    #[error("executor error: {0}")]
    Executor(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error reports memory pressure rather than a bug or bad input.
    pub fn is_insufficient_memory(&self) -> bool {
        matches!(self, Self::InsufficientMemory { .. })
    }
}
