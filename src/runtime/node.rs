//! Node trait for the acquisition pipeline
//!
//! Every pipeline context (data-ready listener, acquisition worker,
//! streaming consumer) is a ProcessNode driven by the scheduler, which
//! calls work() until the node stops or returns an error.

pub use super::errors::{WorkError, WorkResult};

pub trait ProcessNode: Send {
    /// Get a debug name for this node
    fn name(&self) -> &str;

    /// Check if this node should stop processing
    fn should_stop(&self) -> bool {
        false
    }

    /// Handle one unit of work: one edge, one frame or one sample.
    /// Returns Ok(n) where n is the number of items produced.
    /// Err(WorkError::Shutdown) ends the node normally.
    fn work(&mut self) -> WorkResult<usize>;
}
