//! Gridstore: a connection-caching storage engine for multipart uploads.
//!
//! A [`StorageAdapter`] streams uploaded files into an object store through
//! a pluggable [`Connector`](storage::backend::Connector).  Adapters that
//! target the same store under the same cache name share one physical
//! connection through the [`ConnectionCache`].

pub mod adapter;
pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod object_id;
pub mod settle;
pub mod storage;
pub mod uri;

pub use adapter::file::{FileInfo, IncomingFile, RequestContext, StoredFile};
pub use adapter::settings::{generate_bytes, FileNaming, FileSettings};
pub use adapter::source::{ClientSource, ConnectionSource, StorageOptions};
pub use adapter::{AdapterEvent, AdapterEvents, StorageAdapter};
pub use cache::{CacheIndex, ConnectionCache};
pub use engine::{store_files, StorageEngine};
pub use errors::StorageError;
pub use object_id::{FileId, ObjectId};

/// Install logging and register metric descriptions as `config` asks.
///
/// Hosts call this once at startup, before building adapters.
pub fn init_observability(config: &config::Config) -> anyhow::Result<()> {
    crate::logging::init_logging(&config.logging)?;
    if config.observability.metrics {
        crate::metrics::describe_metrics();
    }
    Ok(())
}
