//! Pluggable storage engine contract used by the upload pipeline.
//!
//! The pipeline hands each file of a multipart request to
//! [`StorageEngine::handle_file`] in arrival order.  When any file fails,
//! the files already stored for that request are removed again through
//! [`StorageEngine::remove_file`], so a request either stores all of its
//! files or none of them.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::adapter::file::{IncomingFile, RequestContext, StoredFile};
use crate::adapter::StorageAdapter;
use crate::errors::StorageError;

/// Boxed future returned by engine operations.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// A destination for uploaded files.
pub trait StorageEngine: Send + Sync {
    /// Store one file and describe where it went.
    fn handle_file<'a>(
        &'a self,
        request: &'a RequestContext,
        file: IncomingFile,
    ) -> EngineFuture<'a, StoredFile>;

    /// Remove a file previously returned by `handle_file`.
    fn remove_file<'a>(
        &'a self,
        request: &'a RequestContext,
        file: &'a StoredFile,
    ) -> EngineFuture<'a, ()>;
}

impl StorageEngine for StorageAdapter {
    fn handle_file<'a>(
        &'a self,
        request: &'a RequestContext,
        file: IncomingFile,
    ) -> EngineFuture<'a, StoredFile> {
        Box::pin(StorageAdapter::handle_file(self, request, file))
    }

    fn remove_file<'a>(
        &'a self,
        request: &'a RequestContext,
        file: &'a StoredFile,
    ) -> EngineFuture<'a, ()> {
        Box::pin(StorageAdapter::remove_file(self, request, file))
    }
}

/// Store `files` in order.
///
/// On the first failure every file stored so far is removed, newest first,
/// and the original error is returned.  Removal failures are logged and do
/// not replace that error.
pub async fn store_files(
    engine: &dyn StorageEngine,
    request: &RequestContext,
    files: Vec<IncomingFile>,
) -> Result<Vec<StoredFile>, StorageError> {
    let mut stored = Vec::with_capacity(files.len());
    for file in files {
        match engine.handle_file(request, file).await {
            Ok(done) => stored.push(done),
            Err(err) => {
                rollback(engine, request, stored).await;
                return Err(err);
            }
        }
    }
    Ok(stored)
}

async fn rollback(engine: &dyn StorageEngine, request: &RequestContext, stored: Vec<StoredFile>) {
    if !stored.is_empty() {
        debug!(count = stored.len(), "Rolling back stored files");
    }
    for file in stored.iter().rev() {
        if let Err(err) = engine.remove_file(request, file).await {
            warn!(id = %file.id, error = %err, "Failed to remove file during rollback");
        }
    }
}
