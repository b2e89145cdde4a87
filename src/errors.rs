//! Error types for the storage adapter.
//!
//! Backend collaborators report failures as [`anyhow::Error`].  Once an
//! error has to reach more than one party (every adapter waiting on a shared
//! connection, an event subscriber and the file caller) it is wrapped in a
//! [`SharedError`] so all of them observe the identical error value.

use std::sync::Arc;

use thiserror::Error;

/// A backend error shared between every party that observes it.
pub type SharedError = Arc<anyhow::Error>;

/// Message returned when neither a URL nor a database handle is configured.
pub const MISSING_TARGET_MESSAGE: &str =
    "Error creating storage engine. At least one of url or db option must be provided.";

/// Errors surfaced by the cache, the adapter and the upload path.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The adapter was constructed with an unusable configuration.
    #[error("{0}")]
    Config(String),

    /// Opening the backend connection failed.
    #[error("{0}")]
    Connection(SharedError),

    /// A file arrived while the connection is closed or failed.
    #[error("The database connection must be open to store files")]
    NotConnected,

    /// The naming function produced a value of an unsupported type.
    #[error("Invalid type for file settings, got {0}")]
    InvalidSettings(&'static str),

    /// A settings generator completed before every file was named.
    #[error("Generator ended unexpectedly")]
    GeneratorEnded,

    /// The naming function itself failed.
    #[error("{0}")]
    Settings(SharedError),

    /// Writing a file to the backend failed.
    #[error("{0}")]
    Stream(SharedError),

    /// Any other backend operation failed.
    #[error("{0}")]
    Backend(SharedError),

    /// The addressed cache entry does not exist (or was dropped unresolved).
    #[error("No cache entry for {cache_name}/{url} slot {slot}")]
    CacheEntryMissing {
        cache_name: String,
        url: String,
        slot: u64,
    },
}

impl StorageError {
    /// Wrap a backend error for non-stream backend calls.
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        StorageError::Backend(Arc::new(err.into()))
    }

    /// Convert into a [`SharedError`], reusing the inner value when there is one.
    pub fn into_shared(self) -> SharedError {
        match self {
            StorageError::Connection(e)
            | StorageError::Settings(e)
            | StorageError::Stream(e)
            | StorageError::Backend(e) => e,
            other => Arc::new(anyhow::Error::new(other)),
        }
    }
}
