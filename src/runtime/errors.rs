//! Error types for the runtime system

use thiserror::Error;

/// Error type for node work functions
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("Node-specific error: {0}")]
    NodeError(String),

    #[error("Shutdown signal received")]
    Shutdown,
}

/// Result type for work functions
pub type WorkResult<T = ()> = Result<T, WorkError>;

/// Errors from the sample hand-off between worker and consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// No free slot in the preallocated ring; the sample was dropped
    #[error("Hand-off queue full ({capacity} slots), sample dropped")]
    Full { capacity: usize },

    #[error("Hand-off consumer is gone")]
    Closed,
}
