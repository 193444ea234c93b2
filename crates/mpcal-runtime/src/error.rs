//! The runtime error taxonomy.

use mpcal_tla::{CodecError, TypeError};
use thiserror::Error;

/// Errors surfaced by resources and the archetype driver.
///
/// Only two variants are recoverable: [`RuntimeError::CriticalSectionAborted`]
/// (the driver aborts the touched resources and retries the section) and
/// [`RuntimeError::ContextClosed`] (the driver shuts down and
/// [`crate::context::ArchetypeContext::run`] returns `Ok`). Everything else
/// is fatal to the archetype that raised it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A resource cannot honor this critical section's accesses. The driver
    /// aborts every touched resource and retries from the section's label.
    #[error("critical section aborted")]
    CriticalSectionAborted,

    /// The context was closed while the archetype was running. Not a
    /// failure: `run` maps it to a clean exit.
    #[error("context closed")]
    ContextClosed,

    /// An operator was applied to incompatible values. Programmer (or
    /// compiler) bug; fatal.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// A network payload failed to decode. Peer bug or corruption; fatal.
    #[error("malformed wire payload: {0}")]
    Wire(#[from] CodecError),

    /// Permanent I/O failure in a resource; fatal.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// An operation that makes no sense for the resource it was applied to,
    /// e.g. indexing a leaf or writing to a failure detector. Programmer
    /// bug; fatal.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// The archetype accessed a resource name the context does not know.
    #[error("archetype accessed undeclared resource {0:?}")]
    UnknownResource(String),

    /// Generated code asked for a constant the deployment did not bind.
    #[error("constant {0:?} is not defined")]
    UnknownConstant(String),
}

impl RuntimeError {
    /// Leaf-mixin trap: a leaf resource was indexed.
    #[must_use]
    pub fn leaf_indexed() -> Self {
        Self::ProtocolMisuse("attempted to index a leaf resource".to_string())
    }

    /// Map-mixin trap: a map resource was read or written directly.
    #[must_use]
    pub fn map_read_write() -> Self {
        Self::ProtocolMisuse("attempted to read/write a map resource; index it first".to_string())
    }

    /// Arbitrary misuse diagnosis.
    #[must_use]
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::ProtocolMisuse(message.into())
    }

    /// Whether the driver recovers from this error by aborting and
    /// retrying the current critical section.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CriticalSectionAborted)
    }
}

/// Result alias used across the runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;
