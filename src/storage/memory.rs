//! In-memory object store.
//!
//! Files live in a [`MemoryServer`] shared by every connection opened
//! through a [`MemoryConnector`], so a file written through one handle is
//! visible through any other.  Each connect call still produces fresh
//! client and database objects with their own liveness flag and event
//! channel, mirroring distinct physical connections.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use md5::{Digest, Md5};
use tokio::io::AsyncWrite;
use tokio::sync::{broadcast, RwLock};

use super::backend::{
    BackendEvent, BackendFuture, Client, Connection, Connector, Database, GridFile, UploadStream,
};
use crate::adapter::settings::FileSettings;
use crate::cache::options::ConnectOptions;
use crate::object_id::FileId;

/// (database, bucket) pair addressing one files collection.
type BucketKey = (String, String);

struct StoredBlob {
    record: GridFile,
    data: Bytes,
}

/// Shared file storage behind every in-memory connection.
#[derive(Default)]
pub struct MemoryServer {
    buckets: RwLock<HashMap<BucketKey, HashMap<FileId, StoredBlob>>>,
    /// When set, upload streams fail on their first write.
    fail_writes: AtomicBool,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent uploads fail mid-stream.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Compute the hex MD5 digest for a byte slice.
    pub fn compute_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Read back the content of file `id`.
    pub async fn read_file(&self, database: &str, bucket: &str, id: &FileId) -> anyhow::Result<Bytes> {
        let buckets = self.buckets.read().await;
        buckets
            .get(&(database.to_string(), bucket.to_string()))
            .and_then(|files| files.get(id))
            .map(|blob| blob.data.clone())
            .ok_or_else(|| anyhow::anyhow!("FileNotFound: file {id} was not found"))
    }

    /// Stored record of file `id`.
    pub async fn find(&self, database: &str, bucket: &str, id: &FileId) -> Option<GridFile> {
        let buckets = self.buckets.read().await;
        buckets
            .get(&(database.to_string(), bucket.to_string()))
            .and_then(|files| files.get(id))
            .map(|blob| blob.record.clone())
    }

    /// Number of files in one bucket.
    pub async fn file_count(&self, database: &str, bucket: &str) -> usize {
        let buckets = self.buckets.read().await;
        buckets
            .get(&(database.to_string(), bucket.to_string()))
            .map_or(0, HashMap::len)
    }

    async fn insert_into(&self, database: &str, bucket: &str, record: GridFile, data: Bytes) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry((database.to_string(), bucket.to_string()))
            .or_default()
            .insert(record.id.clone(), StoredBlob { record, data });
    }

    async fn remove(&self, database: &str, bucket: &str, id: &FileId) -> anyhow::Result<()> {
        let mut buckets = self.buckets.write().await;
        let removed = buckets
            .get_mut(&(database.to_string(), bucket.to_string()))
            .and_then(|files| files.remove(id));
        match removed {
            Some(_) => Ok(()),
            None => anyhow::bail!("FileNotFound: no file found for id {id}"),
        }
    }
}

/// Liveness flag and event channel of one physical connection.
struct Link {
    connected: AtomicBool,
    events: broadcast::Sender<BackendEvent>,
}

impl Link {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            connected: AtomicBool::new(true),
            events,
        })
    }

    fn emit(&self, event: BackendEvent) {
        if event == BackendEvent::Close {
            self.connected.store(false, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
    }
}

/// Client object of one in-memory connection.  It is the event source.
pub struct MemoryClient {
    server: Arc<MemoryServer>,
    link: Arc<Link>,
}

impl MemoryClient {
    /// Raise a health event on this connection.
    pub fn emit(&self, event: BackendEvent) {
        self.link.emit(event);
    }

    /// Close the connection; raises [`BackendEvent::Close`].
    pub fn close(&self) {
        self.link.emit(BackendEvent::Close);
    }
}

impl Client for MemoryClient {
    fn database(&self, name: &str) -> Arc<dyn Database> {
        Arc::new(MemoryDatabase {
            name: name.to_string(),
            server: Arc::clone(&self.server),
            link: Arc::clone(&self.link),
            emits_events: false,
        })
    }

    fn is_connected(&self) -> Option<bool> {
        Some(self.link.connected.load(Ordering::SeqCst))
    }

    fn events(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        Some(self.link.events.subscribe())
    }
}

/// Database handle of one in-memory connection.
///
/// Handles obtained from a [`MemoryClient`] leave event emission to the
/// client; handles returned directly by a handle-mode connector emit
/// events themselves.
pub struct MemoryDatabase {
    name: String,
    server: Arc<MemoryServer>,
    link: Arc<Link>,
    emits_events: bool,
}

impl MemoryDatabase {
    /// A standalone handle on `server`, not obtained from any connector.
    pub fn standalone(server: Arc<MemoryServer>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            server,
            link: Link::new(),
            emits_events: true,
        })
    }

    pub fn emit(&self, event: BackendEvent) {
        self.link.emit(event);
    }

    pub fn close(&self) {
        self.link.emit(BackendEvent::Close);
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_upload_stream(
        &self,
        settings: &FileSettings,
    ) -> BackendFuture<'_, Box<dyn UploadStream>> {
        let settings = settings.clone();
        Box::pin(async move {
            if !self.link.connected.load(Ordering::SeqCst) {
                anyhow::bail!("Topology is closed");
            }
            let stream: Box<dyn UploadStream> = Box::new(MemoryUploadStream {
                database: self.name.clone(),
                server: Arc::clone(&self.server),
                settings,
                buffer: Vec::new(),
                fail: self.server.fail_writes.load(Ordering::SeqCst),
            });
            Ok(stream)
        })
    }

    fn delete_file(&self, bucket_name: &str, id: &FileId) -> BackendFuture<'_, ()> {
        let bucket_name = bucket_name.to_string();
        let id = id.clone();
        Box::pin(async move { self.server.remove(&self.name, &bucket_name, &id).await })
    }

    fn is_connected(&self) -> Option<bool> {
        Some(self.link.connected.load(Ordering::SeqCst))
    }

    fn events(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        self.emits_events.then(|| self.link.events.subscribe())
    }
}

/// Buffers an upload until it is finished.
struct MemoryUploadStream {
    database: String,
    server: Arc<MemoryServer>,
    settings: FileSettings,
    buffer: Vec<u8>,
    fail: bool,
}

impl AsyncWrite for MemoryUploadStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to chunks collection failed",
            )));
        }
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl UploadStream for MemoryUploadStream {
    fn finish(self: Box<Self>) -> BackendFuture<'static, GridFile> {
        Box::pin(async move {
            let MemoryUploadStream {
                database,
                server,
                settings,
                buffer,
                ..
            } = *self;
            let data = Bytes::from(buffer);
            let record = GridFile {
                id: settings.id.clone(),
                filename: settings.filename.clone(),
                length: data.len() as u64,
                chunk_size: settings.chunk_size,
                upload_date: Utc::now(),
                md5: Some(MemoryServer::compute_md5(&data)),
                content_type: settings.content_type.clone(),
                metadata: settings.metadata.clone(),
                aliases: settings.aliases.clone(),
            };
            server
                .insert_into(&database, &settings.bucket_name, record.clone(), data)
                .await;
            Ok(record)
        })
    }

    fn abort(self: Box<Self>) -> BackendFuture<'static, ()> {
        // Nothing reaches the server before `finish`.
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

/// Connector producing in-memory connections on a shared [`MemoryServer`].
pub struct MemoryConnector {
    server: Arc<MemoryServer>,
    attempts: AtomicUsize,
    failure: Mutex<Option<String>>,
    delay: Option<Duration>,
    handle_only: bool,
    last_client: Mutex<Option<Arc<MemoryClient>>>,
    last_database: Mutex<Option<Arc<MemoryDatabase>>>,
}

impl MemoryConnector {
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self {
            server,
            attempts: AtomicUsize::new(0),
            failure: Mutex::new(None),
            delay: None,
            handle_only: false,
            last_client: Mutex::new(None),
            last_database: Mutex::new(None),
        }
    }

    /// Sleep this long inside every connect call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Return database handles directly instead of clients.
    pub fn handle_only(mut self) -> Self {
        self.handle_only = true;
        self
    }

    /// Make subsequent connect calls fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Let subsequent connect calls succeed again.
    pub fn succeed(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of connect calls made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    /// Client of the most recent successful client-mode connect.
    pub fn last_client(&self) -> Option<Arc<MemoryClient>> {
        self.last_client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handle of the most recent successful handle-mode connect.
    pub fn last_database(&self) -> Option<Arc<MemoryDatabase>> {
        self.last_database
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str, _options: Option<&ConnectOptions>) -> BackendFuture<'_, Connection> {
        let url = url.to_string();
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(url = %url, attempt, "Opening in-memory connection");
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let failure = self
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(message) = failure {
                anyhow::bail!(message);
            }

            let name = crate::uri::database_name(&url)?;
            if self.handle_only {
                let database = MemoryDatabase::standalone(Arc::clone(&self.server), &name);
                *self
                    .last_database
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&database));
                return Ok(Connection::Database(database));
            }

            let client = Arc::new(MemoryClient {
                server: Arc::clone(&self.server),
                link: Link::new(),
            });
            *self.last_client.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Arc::clone(&client));
            Ok(Connection::Client(client))
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
