//! Error types for the stow engine.

use crate::Key;
use std::sync::Arc;
use thiserror::Error;

/// All possible errors from the stow engine.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Protocol errors
    #[error("no store registered for `{type_name}`; {hint}")]
    StoreNotRegistered {
        type_name: &'static str,
        hint: String,
    },

    #[error("`{type_name}` is registered with the {registered} strategy, not {requested}")]
    StrategyMismatch {
        type_name: &'static str,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("relationship parent is already set")]
    ParentAlreadySet,

    #[error("key must be > 0 (got {0})")]
    UnassignedKey(Key),

    #[error("key {0} is unmanaged (< 0) and cannot be persisted")]
    UnmanagedKey(Key),

    #[error("key not found in backend: {0}")]
    KeyNotFound(Key),

    #[error("store is faulted after a persistence failure; call load() to resynchronize")]
    StoreFaulted,

    // Validation errors
    #[error("duplicate key in batch: {0}")]
    DuplicateKey(Key),

    // Backend errors
    #[error("backend error: {0}")]
    Backend(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("serialization failed: {0}")]
    Serialization(String),

    // Concurrency errors
    #[error("owning affinity context is closed")]
    AffinityClosed,

    #[error("failed to spawn affinity thread: {0}")]
    ThreadSpawn(String),

    #[error("offloaded task failed: {0}")]
    TaskFailed(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A precondition of the called operation was violated.
    Protocol,
    /// An input batch was rejected before reaching the backend.
    Validation,
    /// The backing store failed.
    Backend,
    /// The owning context or a worker went away.
    Concurrency,
}

impl Error {
    /// Wrap an error raised by a backing store.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Backend(Arc::new(err))
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StoreNotRegistered { .. }
            | Error::StrategyMismatch { .. }
            | Error::ParentAlreadySet
            | Error::UnassignedKey(_)
            | Error::UnmanagedKey(_)
            | Error::KeyNotFound(_)
            | Error::StoreFaulted => ErrorKind::Protocol,
            Error::DuplicateKey(_) => ErrorKind::Validation,
            Error::Backend(_) | Error::Serialization(_) => ErrorKind::Backend,
            Error::AffinityClosed | Error::ThreadSpawn(_) | Error::TaskFailed(_) => {
                ErrorKind::Concurrency
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
