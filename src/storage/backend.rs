//! Abstract object-store backend contract.
//!
//! The adapter never talks to a wire protocol itself.  A [`Connector`]
//! opens connections, yielding either a [`Client`] (which owns the network
//! session and hands out databases) or a [`Database`] handle directly.
//! Files are written through [`UploadStream`]s opened on a database.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;

use crate::adapter::settings::FileSettings;
use crate::cache::options::ConnectOptions;
use crate::object_id::FileId;
use crate::uri;

/// Boxed future returned by every backend operation.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Asynchronous health signals raised by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Error(String),
    ParseError(String),
    Timeout,
    Close,
}

impl fmt::Display for BackendEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendEvent::Error(msg) => write!(f, "database error: {msg}"),
            BackendEvent::ParseError(msg) => write!(f, "database parse error: {msg}"),
            BackendEvent::Timeout => f.write_str("database connection timed out"),
            BackendEvent::Close => f.write_str("database connection closed"),
        }
    }
}

/// Record of a file persisted by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GridFile {
    pub id: FileId,
    pub filename: String,
    pub length: u64,
    pub chunk_size: u32,
    pub upload_date: DateTime<Utc>,
    pub md5: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub aliases: Option<Vec<String>>,
}

/// Write side of a single file upload.
///
/// Bytes are written through [`AsyncWrite`]; nothing is visible in the
/// store until [`finish`](UploadStream::finish) succeeds.
pub trait UploadStream: AsyncWrite + Send + Unpin {
    /// Complete the upload and return the stored record.
    fn finish(self: Box<Self>) -> BackendFuture<'static, GridFile>;

    /// Discard everything written so far.
    fn abort(self: Box<Self>) -> BackendFuture<'static, ()>;
}

/// A logical database handle.
pub trait Database: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Open a write stream for a new file described by `settings`.
    fn open_upload_stream(&self, settings: &FileSettings)
        -> BackendFuture<'_, Box<dyn UploadStream>>;

    /// Delete file `id` (metadata and content) from `bucket_name`.
    fn delete_file(&self, bucket_name: &str, id: &FileId) -> BackendFuture<'_, ()>;

    /// Whether the underlying topology is connected, if the handle knows.
    fn is_connected(&self) -> Option<bool> {
        None
    }

    /// Health events, when this handle is the event source.
    fn events(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        None
    }
}

/// The session object owning the network connection.
pub trait Client: Send + Sync + 'static {
    /// Handle to database `name` on this connection.
    fn database(&self, name: &str) -> Arc<dyn Database>;

    /// Liveness probe, if the client offers one.
    fn is_connected(&self) -> Option<bool> {
        None
    }

    /// Health events, when the client is the event source.
    fn events(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        None
    }
}

/// ORM-style wrapper around a database handle.
pub trait Session: Send + Sync + 'static {
    fn database(&self) -> Arc<dyn Database>;
}

/// Raw result of a connect call.
#[derive(Clone)]
pub enum Connection {
    Client(Arc<dyn Client>),
    Database(Arc<dyn Database>),
}

/// Opens backend connections.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str, options: Option<&ConnectOptions>) -> BackendFuture<'_, Connection>;
}

/// A resolved connection: the database handle plus, when the backend
/// exposes one, the client that owns it.
#[derive(Clone)]
pub struct ConnectionResult {
    pub handle: Arc<dyn Database>,
    pub client: Option<Arc<dyn Client>>,
}

impl fmt::Debug for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionResult")
            .field("handle", &self.handle.name())
            .field("client", &self.client.is_some())
            .finish()
    }
}

impl ConnectionResult {
    /// Liveness of this connection: the client's probe when present, else
    /// the handle's, else assumed connected.
    pub fn probe_connected(&self) -> bool {
        self.client
            .as_ref()
            .and_then(|c| c.is_connected())
            .or_else(|| self.handle.is_connected())
            .unwrap_or(true)
    }

    /// Subscribe to health events from whichever object emits them.
    pub fn events(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        self.client
            .as_ref()
            .and_then(|c| c.events())
            .or_else(|| self.handle.events())
    }
}

/// Connect to `url` and normalize the result.  A client result is narrowed
/// to the database named in the URL.
pub async fn open_connection(
    connector: &dyn Connector,
    url: &str,
    options: Option<&ConnectOptions>,
) -> anyhow::Result<ConnectionResult> {
    match connector.connect(url, options).await? {
        Connection::Client(client) => {
            let name = uri::database_name(url)?;
            let handle = client.database(&name);
            Ok(ConnectionResult {
                handle,
                client: Some(client),
            })
        }
        Connection::Database(handle) => Ok(ConnectionResult {
            handle,
            client: None,
        }),
    }
}
