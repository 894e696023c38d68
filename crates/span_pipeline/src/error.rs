//! Error types for pipeline operations.

use crate::config::ConfigError;
use crate::pipeline::PipelineState;
use thiserror::Error;

/// The span buffer is at capacity; the span was dropped and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("span buffer is full")]
pub struct BufferFull;

/// Why a span was not accepted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The buffer is at capacity.
    #[error("span buffer is full")]
    BufferFull,

    /// The pipeline is not accepting spans in its current state.
    #[error("pipeline is not accepting spans while {0}")]
    NotAccepting(PipelineState),
}

impl EnqueueError {
    /// Returns `true` if retrying later may succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BufferFull)
    }
}

impl From<BufferFull> for EnqueueError {
    fn from(_: BufferFull) -> Self {
        EnqueueError::BufferFull
    }
}

/// Errors from controller lifecycle operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The requested transition is not valid from the current state.
    #[error("cannot {operation} while pipeline is {state}")]
    InvalidState {
        operation: &'static str,
        state: PipelineState,
    },

    /// The batching loop exited unexpectedly.
    #[error("batching task failed: {0}")]
    Worker(String),
}
