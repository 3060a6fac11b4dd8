//! Error taxonomy for the decoding core.
//!
//! Recoverable engine-internal conditions (cell-removal failure, partial
//! batch fit) are handled in place and logged; anything that indicates a
//! logically impossible request is surfaced to the caller immediately.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Operating on a released sequence or a disposed engine instance.
    #[error("operation on a disposed {0}")]
    UseAfterDispose(&'static str),

    /// No free sequence slot; a sequence must be released first.
    #[error("no free sequence slot (capacity {0})")]
    CapacityExceeded(usize),

    /// No eviction policy can make the history fit the context window.
    /// Usually indicates an oversized system prompt.
    #[error("context too small: {reason}")]
    ContextTooSmall { reason: String },

    /// The model runtime rejected a decode batch. Isolated to the queue
    /// entries that were part of that batch.
    #[error("batch dispatch failed: {0}")]
    BatchDispatch(String),

    /// Engine-side cell removal failed and the full-rebuild fallback also
    /// failed. Removal failures alone are recovered transparently.
    #[error("cell eviction failed for sequence {0}")]
    Eviction(u32),

    /// Generated text does not parse against the active function grammar.
    #[error("grammar violation while parsing {what}: {detail}")]
    GrammarViolation { what: String, detail: String },

    /// Cooperative cancellation, raised when the caller did not opt into a
    /// graceful partial result.
    #[error("generation aborted")]
    Aborted,

    /// Opaque model-runtime failure.
    #[error("model runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
