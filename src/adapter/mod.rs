//! The upload storage adapter.
//!
//! A [`StorageAdapter`] owns one connection lifecycle: it starts out
//! connecting, then settles exactly once to connected or failed.  Files
//! arriving while it connects wait on [`StorageAdapter::ready`]; files
//! arriving after a failure are refused.
//!
//! Connections come from one of three places:
//!
//! - a caller-supplied handle (direct, wrapped or still pending),
//! - the [`ConnectionCache`], when a cache name is configured, so that
//!   adapters with equivalent targets share one connect call,
//! - a private connect call through the configured [`Connector`].

pub mod file;
pub mod settings;
pub mod source;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cache::options::ConnectOptions;
use crate::cache::store::{CacheIndex, ConnectionCache};
use crate::errors::{SharedError, StorageError, MISSING_TARGET_MESSAGE};
use crate::metrics::{
    BYTES_STORED_TOTAL, CACHE_HITS_TOTAL, CONNECTIONS_OPENED_TOTAL, FILES_REMOVED_TOTAL,
    FILES_STORED_TOTAL, STREAM_ERRORS_TOTAL,
};
use crate::settle::Settle;
use crate::storage::backend::{
    open_connection, BackendEvent, Client, ConnectionResult, Connector, Database,
};

use file::{FileInfo, FileStream, IncomingFile, RequestContext, StoredFile};
use settings::{parse_settings, FileNaming, FileSettings, GeneratorStep, SettingsGenerator};
use source::{ClientSource, ConnectionSource, StorageOptions};

/// Capacity of the adapter event channel.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle and upload events emitted by an adapter.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The connection resolved.
    Connection(ConnectionResult),
    /// The connection failed; the adapter is permanently unusable.
    ConnectionFailed(SharedError),
    /// A file was stored.
    File(StoredFile),
    /// Writing a file failed.
    StreamError {
        error: SharedError,
        settings: FileSettings,
    },
    /// The live connection reported a health problem.
    DbError(SharedError),
}

/// A subscription to adapter events.
///
/// A subscription taken after the connection settled starts with the
/// terminal `Connection` or `ConnectionFailed` event, so late listeners
/// still learn the outcome exactly once.
pub struct AdapterEvents {
    replay: Option<AdapterEvent>,
    receiver: broadcast::Receiver<AdapterEvent>,
}

impl AdapterEvents {
    pub async fn recv(&mut self) -> Result<AdapterEvent, broadcast::error::RecvError> {
        if let Some(event) = self.replay.take() {
            return Ok(event);
        }
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<AdapterEvent, broadcast::error::TryRecvError> {
        if let Some(event) = self.replay.take() {
            return Ok(event);
        }
        self.receiver.try_recv()
    }
}

#[derive(Default)]
struct ConnectionState {
    connected: bool,
    connecting: bool,
    error: Option<SharedError>,
    handle: Option<Arc<dyn Database>>,
    client: Option<Arc<dyn Client>>,
}

impl ConnectionState {
    fn result(&self) -> Option<ConnectionResult> {
        self.handle.as_ref().map(|handle| ConnectionResult {
            handle: Arc::clone(handle),
            client: self.client.clone(),
        })
    }

    /// The lifecycle event describing a settled connection.
    fn terminal_event(&self) -> Option<AdapterEvent> {
        if self.connecting {
            return None;
        }
        match &self.error {
            Some(err) => Some(AdapterEvent::ConnectionFailed(Arc::clone(err))),
            None => self.result().map(AdapterEvent::Connection),
        }
    }

    fn recompute_connected(&mut self) {
        self.connected = match self.result() {
            Some(result) => result.probe_connected(),
            None => false,
        };
    }
}

/// A shared cache slot plus the cell its outcome settles on.
struct CacheSlot {
    cache: Arc<ConnectionCache>,
    index: CacheIndex,
    /// Captured at construction so a rejection stays observable after the
    /// rejecting adapter removes the entry.
    outcome: Option<Settle<ConnectionResult, SharedError>>,
}

struct Inner {
    url: Option<String>,
    options: Option<ConnectOptions>,
    connector: Option<Arc<dyn Connector>>,
    cache: Option<CacheSlot>,
    naming: Option<FileNaming>,
    generator: Mutex<Option<Box<dyn SettingsGenerator>>>,
    state: Mutex<ConnectionState>,
    ready: Settle<ConnectionResult, SharedError>,
    /// Lifecycle events are sent while `state` is locked; see `subscribe`.
    events: broadcast::Sender<AdapterEvent>,
}

/// Storage engine writing uploads into an object store.
///
/// Cloning is cheap; clones share the same connection and state.
#[derive(Clone)]
pub struct StorageAdapter {
    inner: Arc<Inner>,
}

impl StorageAdapter {
    /// Build an adapter and start resolving its connection.
    ///
    /// Returns a configuration error when neither `url` nor `db` is set,
    /// or when `url` is set without a connector.  Unless a ready handle is
    /// supplied, the connection is resolved on a spawned task, so this must
    /// be called inside a Tokio runtime.
    pub fn new(options: StorageOptions) -> Result<Self, StorageError> {
        let StorageOptions {
            url,
            options,
            cache,
            db,
            client,
            file,
            connector,
            cache_store,
        } = options;

        if db.is_none() && url.is_none() {
            return Err(StorageError::Config(MISSING_TARGET_MESSAGE.to_string()));
        }
        if db.is_none() && connector.is_none() {
            return Err(StorageError::Config(
                "A connector is required to open a url".to_string(),
            ));
        }
        if db.is_some() && url.is_some() {
            warn!("Both url and db were supplied; using the db handle");
        }

        // Caching only applies to connections the adapter opens itself.
        let cache_slot = match (&db, &url, cache.name()) {
            (None, Some(url), Some(name)) => {
                let cache = cache_store.unwrap_or_else(ConnectionCache::global);
                let index = cache.initialize(name, url, options.clone());
                let outcome = cache.get(&index).map(|entry| entry.outcome());
                Some(CacheSlot {
                    cache,
                    index,
                    outcome,
                })
            }
            _ => None,
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let adapter = Self {
            inner: Arc::new(Inner {
                url,
                options,
                connector,
                cache: cache_slot,
                naming: file,
                generator: Mutex::new(None),
                state: Mutex::new(ConnectionState {
                    connecting: true,
                    ..ConnectionState::default()
                }),
                ready: Settle::new(),
                events,
            }),
        };
        adapter.connect(db, client);
        Ok(adapter)
    }

    /// Adopt a ready handle synchronously, otherwise resolve on a task.
    fn connect(&self, db: Option<ConnectionSource>, client: Option<ClientSource>) {
        let direct_client = match &client {
            None => Some(None),
            Some(ClientSource::Direct(c)) => Some(Some(Arc::clone(c))),
            Some(ClientSource::Awaitable(_)) => None,
        };
        let direct_handle = db.as_ref().and_then(ConnectionSource::immediate);
        if let (Some(handle), Some(client)) = (direct_handle, direct_client) {
            self.inner.set_connection(handle, client);
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.resolve_connection(db, client).await {
                Ok(result) => inner.set_connection(result.handle, result.client),
                Err(err) => inner.fail(err),
            }
        });
    }

    /// Wait until the connection settles.
    ///
    /// Returns immediately once connected, and fails with the stored error
    /// once failed.
    pub async fn ready(&self) -> Result<ConnectionResult, StorageError> {
        {
            let state = self.inner.state();
            if let Some(err) = &state.error {
                return Err(StorageError::Connection(Arc::clone(err)));
            }
            if !state.connecting {
                if let Some(result) = state.result() {
                    return Ok(result);
                }
            }
        }
        self.inner
            .ready
            .wait()
            .await
            .map_err(StorageError::Connection)
    }

    /// Receive adapter events from now on, preceded by the connection
    /// outcome when it has already settled.
    pub fn subscribe(&self) -> AdapterEvents {
        // Lifecycle events are emitted under the state lock, so the receiver
        // either sees the live event or the replay, never both.
        let state = self.inner.state();
        let receiver = self.inner.events.subscribe();
        let replay = state.terminal_event();
        drop(state);
        AdapterEvents { replay, receiver }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state().connecting
    }

    /// The error the connection failed with, if it failed.
    pub fn error(&self) -> Option<SharedError> {
        self.inner.state().error.clone()
    }

    pub fn handle(&self) -> Option<Arc<dyn Database>> {
        self.inner.state().handle.clone()
    }

    pub fn client(&self) -> Option<Arc<dyn Client>> {
        self.inner.state().client.clone()
    }

    /// The cache slot this adapter shares, when caching is enabled.
    pub fn cache_index(&self) -> Option<&CacheIndex> {
        self.inner.cache.as_ref().map(|slot| &slot.index)
    }

    /// Store one uploaded file.
    ///
    /// Waits for the connection while it is being established.  Settings
    /// errors only affect this file.
    pub async fn handle_file(
        &self,
        request: &RequestContext,
        file: IncomingFile,
    ) -> Result<StoredFile, StorageError> {
        let connection = if self.is_connecting() {
            self.ready().await?
        } else {
            let live = {
                let mut state = self.inner.state();
                state.recompute_connected();
                let connected = state.connected;
                let result = state.result();
                result.filter(|_| connected)
            };
            live.ok_or(StorageError::NotConnected)?
        };

        let IncomingFile { info, stream } = file;
        let settings = self.inner.file_settings(request, &info).await?;
        self.inner.store(&connection.handle, settings, stream).await
    }

    /// Delete a previously stored file.
    pub async fn remove_file(
        &self,
        _request: &RequestContext,
        file: &StoredFile,
    ) -> Result<(), StorageError> {
        let handle = self.handle().ok_or(StorageError::NotConnected)?;
        handle
            .delete_file(&file.bucket_name, &file.id)
            .await
            .map_err(StorageError::backend)?;
        counter!(FILES_REMOVED_TOTAL).increment(1);
        debug!(id = %file.id, bucket = %file.bucket_name, "Removed stored file");
        Ok(())
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: AdapterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn resolve_connection(
        &self,
        db: Option<ConnectionSource>,
        client: Option<ClientSource>,
    ) -> Result<ConnectionResult, SharedError> {
        if let Some(db) = db {
            let handle = db.resolve().await.map_err(Arc::new)?;
            let client = match client {
                Some(client) => Some(client.resolve().await.map_err(Arc::new)?),
                None => None,
            };
            return Ok(ConnectionResult { handle, client });
        }

        let Some(slot) = &self.cache else {
            return self.create_connection().await;
        };

        if slot.cache.try_claim(&slot.index) {
            return self.create_connection().await;
        }

        counter!(CACHE_HITS_TOTAL).increment(1);
        debug!(index = %slot.index, "Waiting on shared connection");
        match &slot.outcome {
            Some(outcome) => outcome.wait().await,
            None => slot
                .cache
                .wait_for(&slot.index)
                .await
                .map_err(StorageError::into_shared),
        }
    }

    async fn create_connection(&self) -> Result<ConnectionResult, SharedError> {
        let (Some(url), Some(connector)) = (self.url.as_deref(), self.connector.as_ref()) else {
            return Err(Arc::new(anyhow::anyhow!(MISSING_TARGET_MESSAGE)));
        };

        match open_connection(connector.as_ref(), url, self.options.as_ref()).await {
            Ok(result) => {
                counter!(CONNECTIONS_OPENED_TOTAL, "outcome" => "success").increment(1);
                if let Some(slot) = &self.cache {
                    slot.cache.resolve(
                        &slot.index,
                        Arc::clone(&result.handle),
                        result.client.clone(),
                    );
                }
                Ok(result)
            }
            Err(err) => {
                counter!(CONNECTIONS_OPENED_TOTAL, "outcome" => "failure").increment(1);
                let err = Arc::new(err);
                if let Some(slot) = &self.cache {
                    slot.cache.reject(&slot.index, Arc::clone(&err));
                }
                Err(err)
            }
        }
    }

    fn set_connection(self: &Arc<Self>, handle: Arc<dyn Database>, client: Option<Arc<dyn Client>>) {
        let result = ConnectionResult { handle, client };
        {
            let mut state = self.state();
            state.connecting = false;
            state.error = None;
            state.handle = Some(Arc::clone(&result.handle));
            state.client = result.client.clone();
            state.recompute_connected();
            self.emit(AdapterEvent::Connection(result.clone()));
        }
        info!(database = result.handle.name(), "Storage connection established");
        self.watch_backend(&result);
        self.ready.settle(Ok(result));
    }

    fn fail(&self, err: SharedError) {
        {
            let mut state = self.state();
            state.connecting = false;
            state.handle = None;
            state.client = None;
            state.error = Some(Arc::clone(&err));
            state.recompute_connected();
            self.emit(AdapterEvent::ConnectionFailed(Arc::clone(&err)));
        }
        error!(error = %err, "Storage connection failed");
        self.ready.settle(Err(err));
    }

    /// Forward health events from the connection's event source as
    /// `DbError`.  Stops when the source closes or the adapter is dropped.
    fn watch_backend(self: &Arc<Self>, result: &ConnectionResult) {
        let Some(mut events) = result.events() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime; backend health events will not be forwarded");
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        runtime.spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dropped backend health events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_backend_event(event);
            }
        });
    }

    fn on_backend_event(&self, event: BackendEvent) {
        self.state().recompute_connected();
        warn!(event = %event, "Backend reported a connection problem");
        self.emit(AdapterEvent::DbError(Arc::new(anyhow::anyhow!("{event}"))));
    }

    /// Produce the settings for one file from the configured naming.
    async fn file_settings(
        &self,
        request: &RequestContext,
        info: &FileInfo,
    ) -> Result<FileSettings, StorageError> {
        let value = match &self.naming {
            None => serde_json::Value::Null,
            Some(FileNaming::Sync(namer)) => namer(request, info).map_err(settings_error)?,
            Some(FileNaming::Async(namer)) => namer(request, info).await.map_err(settings_error)?,
            Some(FileNaming::Generator(factory)) => {
                let step = {
                    let mut slot = self
                        .generator
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    let generator = slot.get_or_insert_with(|| factory(request, info));
                    generator.resume(request, info)
                };
                match step {
                    GeneratorStep::Yielded(value) => value.await.map_err(settings_error)?,
                    GeneratorStep::Complete => return Err(StorageError::GeneratorEnded),
                }
            }
        };
        Ok(FileSettings::merge(parse_settings(value)?, info))
    }

    /// Pipe `stream` into a new backend file.  On failure the partial
    /// upload is discarded and `StreamError` is emitted.
    async fn store(
        &self,
        handle: &Arc<dyn Database>,
        settings: FileSettings,
        mut stream: FileStream,
    ) -> Result<StoredFile, StorageError> {
        let mut sink = match handle.open_upload_stream(&settings).await {
            Ok(sink) => sink,
            Err(err) => return Err(self.stream_failed(err, settings)),
        };

        if let Err(err) = tokio::io::copy(&mut stream, &mut sink).await {
            if let Err(abort_err) = sink.abort().await {
                warn!(error = %abort_err, "Failed to discard partial upload");
            }
            return Err(self.stream_failed(err.into(), settings));
        }

        match sink.finish().await {
            Ok(record) => {
                let stored = StoredFile::from_record(record, &settings);
                counter!(FILES_STORED_TOTAL, "bucket" => stored.bucket_name.clone()).increment(1);
                counter!(BYTES_STORED_TOTAL).increment(stored.size);
                debug!(id = %stored.id, filename = %stored.filename, size = stored.size, "Stored file");
                self.emit(AdapterEvent::File(stored.clone()));
                Ok(stored)
            }
            Err(err) => Err(self.stream_failed(err, settings)),
        }
    }

    fn stream_failed(&self, err: anyhow::Error, settings: FileSettings) -> StorageError {
        let err = Arc::new(err);
        counter!(STREAM_ERRORS_TOTAL).increment(1);
        warn!(error = %err, filename = %settings.filename, "Upload stream failed");
        self.emit(AdapterEvent::StreamError {
            error: Arc::clone(&err),
            settings,
        });
        StorageError::Stream(err)
    }
}

fn settings_error(err: anyhow::Error) -> StorageError {
    StorageError::Settings(Arc::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use crate::adapter::settings::{Counted, Sequence};
    use crate::cache::options::options_from_json;
    use crate::cache::store::CACHE_CLEARED_MESSAGE;
    use crate::storage::backend::{Connection, Session};
    use crate::storage::memory::{MemoryConnector, MemoryDatabase, MemoryServer};

    const URL: &str = "mongodb://localhost:27017/uploads";

    fn connector() -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector::new(MemoryServer::new()).with_delay(Duration::from_millis(20)))
    }

    fn cached(connector: &Arc<MemoryConnector>, cache: &Arc<ConnectionCache>, name: &str) -> StorageAdapter {
        StorageAdapter::new(
            StorageOptions::url(URL, connector.clone())
                .with_cache(name)
                .with_cache_store(Arc::clone(cache)),
        )
        .unwrap()
    }

    fn cached_with(
        connector: &Arc<MemoryConnector>,
        cache: &Arc<ConnectionCache>,
        options: serde_json::Value,
    ) -> StorageAdapter {
        let options = options_from_json(options).expect("non-empty options");
        StorageAdapter::new(
            StorageOptions::url(URL, connector.clone())
                .with_options(options)
                .with_cache("default")
                .with_cache_store(Arc::clone(cache)),
        )
        .unwrap()
    }

    fn upload(data: &'static str) -> IncomingFile {
        IncomingFile::from_bytes(FileInfo::new("doc", "notes.txt", "text/plain"), data)
    }

    async fn next_event(events: &mut AdapterEvents) -> AdapterEvent {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for an adapter event")
            .expect("event channel closed")
    }

    #[test]
    fn test_missing_target_is_config_error() {
        let err = StorageAdapter::new(StorageOptions::default()).err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
        assert_eq!(err.to_string(), MISSING_TARGET_MESSAGE);
    }

    #[test]
    fn test_url_without_connector_is_config_error() {
        let options = StorageOptions {
            url: Some(URL.to_string()),
            ..StorageOptions::default()
        };
        assert!(matches!(
            StorageAdapter::new(options),
            Err(StorageError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_direct_handle_connects_synchronously() {
        let db = MemoryDatabase::standalone(MemoryServer::new(), "files");
        let adapter = StorageAdapter::new(StorageOptions::db(ConnectionSource::Direct(db))).unwrap();
        assert!(adapter.is_connected());
        assert!(!adapter.is_connecting());
        assert_eq!(adapter.handle().unwrap().name(), "files");
        assert!(adapter.client().is_none());
        assert!(adapter.cache_index().is_none());

        // Every listener registered after construction sees the outcome once.
        let mut first = adapter.subscribe();
        let mut second = adapter.subscribe();
        for events in [&mut first, &mut second] {
            assert!(matches!(next_event(events).await, AdapterEvent::Connection(_)));
            assert!(events.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_failure() {
        let connector = connector();
        connector.fail_with("connect ECONNREFUSED");
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let mut early = adapter.subscribe();
        assert!(adapter.ready().await.is_err());

        let mut late = adapter.subscribe();
        for events in [&mut early, &mut late] {
            match next_event(events).await {
                AdapterEvent::ConnectionFailed(err) => {
                    assert_eq!(err.to_string(), "connect ECONNREFUSED")
                }
                other => panic!("expected a connection failure, got {other:?}"),
            }
            assert!(events.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_wrapped_session_uses_inner_handle() {
        struct Odm(Arc<MemoryDatabase>);
        impl Session for Odm {
            fn database(&self) -> Arc<dyn Database> {
                self.0.clone()
            }
        }

        let db = MemoryDatabase::standalone(MemoryServer::new(), "odm");
        let source = ConnectionSource::Wrapped(Arc::new(Odm(db)));
        let adapter = StorageAdapter::new(StorageOptions::db(source)).unwrap();
        assert_eq!(adapter.handle().unwrap().name(), "odm");
    }

    #[tokio::test]
    async fn test_pending_handle_and_client() {
        let connector = MemoryConnector::new(MemoryServer::new());
        let Connection::Client(client) = connector.connect(URL, None).await.unwrap() else {
            panic!("expected a client");
        };
        let handle = client.database("pending");

        let options = StorageOptions::db(ConnectionSource::pending(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(handle)
        }))
        .with_client(ClientSource::pending(async move { Ok(client) }));
        let adapter = StorageAdapter::new(options).unwrap();
        assert!(adapter.is_connecting());

        let result = adapter.ready().await.unwrap();
        assert_eq!(result.handle.name(), "pending");
        assert!(result.client.is_some());
        assert!(adapter.is_connected());
    }

    #[tokio::test]
    async fn test_db_wins_over_url() {
        let connector = connector();
        let db = MemoryDatabase::standalone(MemoryServer::new(), "files");
        let options = StorageOptions::url(URL, connector.clone());
        let options = StorageOptions {
            db: Some(ConnectionSource::Direct(db)),
            ..options
        };
        let adapter = StorageAdapter::new(options).unwrap();
        assert_eq!(adapter.ready().await.unwrap().handle.name(), "files");
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_url_connects_to_named_database() {
        let connector = connector();
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        assert!(adapter.is_connecting());
        assert!(!adapter.is_connected());

        let result = adapter.ready().await.unwrap();
        assert_eq!(result.handle.name(), "uploads");
        assert!(result.client.is_some());
        assert!(adapter.is_connected());
        assert!(!adapter.is_connecting());
        assert_eq!(connector.attempts(), 1);

        // Already connected: answers without waiting.
        assert!(adapter.ready().await.is_ok());
    }

    #[tokio::test]
    async fn test_cached_adapters_share_one_connection() {
        let connector = connector();
        let cache = Arc::new(ConnectionCache::new());
        let first = cached(&connector, &cache, "default");
        let second = cached(&connector, &cache, "default");
        assert_eq!(first.cache_index(), second.cache_index());

        let (a, b) = tokio::join!(first.ready(), second.ready());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(connector.attempts(), 1);
        assert!(Arc::ptr_eq(&a.handle, &b.handle));
        assert_eq!(cache.connections(), 1);

        // A late adapter reuses the resolved entry.
        let third = cached(&connector, &cache, "default");
        let c = third.ready().await.unwrap();
        assert!(Arc::ptr_eq(&a.handle, &c.handle));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_cache_names_connect_separately() {
        let connector = connector();
        let cache = Arc::new(ConnectionCache::new());
        let first = cached(&connector, &cache, "one");
        let second = cached(&connector, &cache, "two");

        let (a, b) = tokio::join!(first.ready(), second.ready());
        assert!(!Arc::ptr_eq(&a.unwrap().handle, &b.unwrap().handle));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_uncached_adapters_connect_separately() {
        let connector = connector();
        let first = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let second = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let (a, b) = tokio::join!(first.ready(), second.ready());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_shared_failure_reaches_every_adapter() {
        let connector = connector();
        connector.fail_with("connect ECONNREFUSED");
        let cache = Arc::new(ConnectionCache::new());
        let first = cached(&connector, &cache, "default");
        let second = cached(&connector, &cache, "default");

        let (a, b) = tokio::join!(first.ready(), second.ready());
        for result in [a, b] {
            match result {
                Err(StorageError::Connection(err)) => {
                    assert_eq!(err.to_string(), "connect ECONNREFUSED")
                }
                other => panic!("expected a connection error, got {other:?}"),
            }
        }
        assert_eq!(connector.attempts(), 1);
        assert!(first.error().is_some());
        assert!(!first.is_connected());
        assert_eq!(cache.connections(), 0);

        // The failed entry is gone, so the next adapter connects afresh.
        connector.succeed();
        let third = cached(&connector, &cache, "default");
        assert!(third.ready().await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_failure_only_affects_its_slot() {
        let connector = connector();
        let cache = Arc::new(ConnectionCache::new());
        let healthy = cached(&connector, &cache, "healthy");
        healthy.ready().await.unwrap();

        connector.fail_with("authentication failed");
        let broken = cached(&connector, &cache, "broken");
        assert!(broken.ready().await.is_err());
        assert!(healthy.is_connected());
        assert_eq!(cache.connections(), 1);
    }

    #[tokio::test]
    async fn test_different_options_use_separate_slots() {
        let connector = connector();
        let cache = Arc::new(ConnectionCache::new());
        let first = cached_with(&connector, &cache, json!({"x": 1}));
        let second = cached_with(&connector, &cache, json!({"x": 2}));
        assert_ne!(first.cache_index(), second.cache_index());

        let (a, b) = tokio::join!(first.ready(), second.ready());
        assert!(!Arc::ptr_eq(&a.unwrap().handle, &b.unwrap().handle));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(cache.connections(), 2);
    }

    #[tokio::test]
    async fn test_equivalent_options_share_a_slot() {
        let connector = connector();
        let cache = Arc::new(ConnectionCache::new());
        let first = cached_with(&connector, &cache, json!({"ssl": true, "poolSize": 5}));
        let second = cached_with(&connector, &cache, json!({"poolSize": 5, "ssl": true}));
        assert_eq!(first.cache_index(), second.cache_index());

        let (a, b) = tokio::join!(first.ready(), second.ready());
        assert!(Arc::ptr_eq(&a.unwrap().handle, &b.unwrap().handle));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failure_in_one_options_slot_spares_the_other() {
        let connector = connector();
        let cache = Arc::new(ConnectionCache::new());
        let healthy = cached_with(&connector, &cache, json!({"x": 1}));
        healthy.ready().await.unwrap();

        connector.fail_with("authentication failed");
        let broken = cached_with(&connector, &cache, json!({"x": 2}));
        assert_eq!(healthy.cache_index().unwrap().url, broken.cache_index().unwrap().url);
        assert!(broken.ready().await.is_err());

        assert!(healthy.is_connected());
        assert!(healthy.error().is_none());
        assert!(cache.has(healthy.cache_index().unwrap()));
        assert_eq!(cache.connections(), 1);
    }

    #[tokio::test]
    async fn test_clear_unblocks_waiting_adapters() {
        let connector = Arc::new(
            MemoryConnector::new(MemoryServer::new()).with_delay(Duration::from_millis(50)),
        );
        let cache = Arc::new(ConnectionCache::new());
        let first = cached(&connector, &cache, "default");
        let second = cached(&connector, &cache, "default");
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.clear();

        let (a, b) = timeout(Duration::from_secs(2), async {
            tokio::join!(first.ready(), second.ready())
        })
        .await
        .expect("adapters stayed connecting after clear");

        // The claimant still gets its connection; the waiter is released.
        let (connected, failed): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(Result::is_ok);
        assert_eq!(connected.len(), 1);
        match &failed[..] {
            [Err(StorageError::Connection(err))] => {
                assert_eq!(err.to_string(), CACHE_CLEARED_MESSAGE)
            }
            other => panic!("expected one cleared-cache error, got {other:?}"),
        }
        assert!(!first.is_connecting());
        assert!(!second.is_connecting());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_adapter_refuses_files() {
        let connector = connector();
        connector.fail_with("connect ECONNREFUSED");
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let mut events = adapter.subscribe();
        assert!(matches!(
            next_event(&mut events).await,
            AdapterEvent::ConnectionFailed(_)
        ));

        let request = RequestContext::default();
        let err = adapter.handle_file(&request, upload("data")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotConnected));
        assert!(adapter.ready().await.is_err());
    }

    #[tokio::test]
    async fn test_store_file_round_trip() {
        let connector = connector();
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let mut events = adapter.subscribe();
        let request = RequestContext::default();

        // Arrives while connecting; waits for the connection.
        let stored = adapter.handle_file(&request, upload("hello world")).await.unwrap();
        assert_eq!(stored.size, 11);
        assert_eq!(stored.bucket_name, "fs");
        assert_eq!(stored.chunk_size, 261_120);
        assert_eq!(stored.filename.len(), 32);
        assert_eq!(stored.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            stored.md5.as_deref(),
            Some(MemoryServer::compute_md5(b"hello world").as_str())
        );

        let data = connector
            .server()
            .read_file("uploads", "fs", &stored.id)
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello world");

        assert!(matches!(next_event(&mut events).await, AdapterEvent::Connection(_)));
        match next_event(&mut events).await {
            AdapterEvent::File(file) => assert_eq!(file, stored),
            other => panic!("expected a file event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_naming_sets_file_fields() {
        let connector = connector();
        let naming = FileNaming::sync(|_req: &RequestContext, file: &FileInfo| {
            Ok(json!({
                "filename": format!("{}-upload", file.fieldname),
                "bucketName": "docs",
                "metadata": {"source": "test"}
            }))
        });
        let adapter =
            StorageAdapter::new(StorageOptions::url(URL, connector.clone()).with_file(naming)).unwrap();

        let stored = adapter
            .handle_file(&RequestContext::default(), upload("x"))
            .await
            .unwrap();
        assert_eq!(stored.filename, "doc-upload");
        assert_eq!(stored.bucket_name, "docs");
        assert_eq!(stored.metadata, Some(json!({"source": "test"})));
        assert_eq!(connector.server().file_count("uploads", "docs").await, 1);
    }

    #[tokio::test]
    async fn test_async_naming() {
        let connector = connector();
        let naming = FileNaming::future(|_req: &RequestContext, _file: &FileInfo| async {
            tokio::task::yield_now().await;
            Ok(json!("async-name"))
        });
        let adapter =
            StorageAdapter::new(StorageOptions::url(URL, connector.clone()).with_file(naming)).unwrap();
        let stored = adapter
            .handle_file(&RequestContext::default(), upload("x"))
            .await
            .unwrap();
        assert_eq!(stored.filename, "async-name");
    }

    #[tokio::test]
    async fn test_boolean_settings_are_rejected() {
        let connector = connector();
        let naming = FileNaming::sync(|_req: &RequestContext, _file: &FileInfo| Ok(json!(true)));
        let adapter =
            StorageAdapter::new(StorageOptions::url(URL, connector.clone()).with_file(naming)).unwrap();

        let err = adapter
            .handle_file(&RequestContext::default(), upload("x"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid type for file settings, got boolean");
        assert_eq!(connector.server().file_count("uploads", "fs").await, 0);
    }

    #[tokio::test]
    async fn test_naming_error_only_fails_that_file() {
        let connector = connector();
        let naming = FileNaming::sync(|_req: &RequestContext, file: &FileInfo| {
            if file.originalname == "bad.txt" {
                anyhow::bail!("name rejected");
            }
            Ok(json!(null))
        });
        let adapter =
            StorageAdapter::new(StorageOptions::url(URL, connector.clone()).with_file(naming)).unwrap();
        let request = RequestContext::default();

        let bad = IncomingFile::from_bytes(FileInfo::new("doc", "bad.txt", "text/plain"), "x");
        assert!(matches!(
            adapter.handle_file(&request, bad).await,
            Err(StorageError::Settings(_))
        ));
        assert!(adapter.handle_file(&request, upload("y")).await.is_ok());
    }

    #[tokio::test]
    async fn test_generator_ending_fails_next_file() {
        let connector = connector();
        let naming = FileNaming::generator(|_req: &RequestContext, _file: &FileInfo| {
            Sequence::new(vec![json!({"filename": "only-one"})])
        });
        let adapter =
            StorageAdapter::new(StorageOptions::url(URL, connector.clone()).with_file(naming)).unwrap();
        let request = RequestContext::default();

        let first = adapter.handle_file(&request, upload("a")).await.unwrap();
        assert_eq!(first.filename, "only-one");
        let err = adapter.handle_file(&request, upload("b")).await.unwrap_err();
        assert!(matches!(err, StorageError::GeneratorEnded));
        assert_eq!(err.to_string(), "Generator ended unexpectedly");
    }

    #[tokio::test]
    async fn test_generator_sees_each_file() {
        let connector = connector();
        let naming = FileNaming::generator(|_req: &RequestContext, _file: &FileInfo| {
            Counted::new(|n, _req: &RequestContext, file: &FileInfo| {
                Some(json!(format!("{}-{n}", file.originalname)))
            })
        });
        let adapter =
            StorageAdapter::new(StorageOptions::url(URL, connector.clone()).with_file(naming)).unwrap();
        let request = RequestContext::default();

        let a = IncomingFile::from_bytes(FileInfo::new("f", "a.txt", "text/plain"), "1");
        let b = IncomingFile::from_bytes(FileInfo::new("f", "b.txt", "text/plain"), "2");
        assert_eq!(adapter.handle_file(&request, a).await.unwrap().filename, "a.txt-0");
        assert_eq!(adapter.handle_file(&request, b).await.unwrap().filename, "b.txt-1");
    }

    #[tokio::test]
    async fn test_stream_error_is_reported() {
        let connector = connector();
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let mut events = adapter.subscribe();
        adapter.ready().await.unwrap();
        connector.server().set_fail_writes(true);

        let err = adapter
            .handle_file(&RequestContext::default(), upload("doomed"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Stream(_)));
        assert_eq!(connector.server().file_count("uploads", "fs").await, 0);

        assert!(matches!(next_event(&mut events).await, AdapterEvent::Connection(_)));
        match next_event(&mut events).await {
            AdapterEvent::StreamError { settings, .. } => {
                assert_eq!(settings.bucket_name, "fs")
            }
            other => panic!("expected a stream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_events_are_forwarded() {
        let connector = connector();
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let mut events = adapter.subscribe();
        adapter.ready().await.unwrap();
        assert!(matches!(next_event(&mut events).await, AdapterEvent::Connection(_)));

        let client = connector.last_client().unwrap();
        client.emit(BackendEvent::Timeout);
        match next_event(&mut events).await {
            AdapterEvent::DbError(err) => {
                assert_eq!(err.to_string(), "database connection timed out")
            }
            other => panic!("expected a db error, got {other:?}"),
        }
        assert!(adapter.is_connected());

        client.close();
        assert!(matches!(next_event(&mut events).await, AdapterEvent::DbError(_)));
        assert!(!adapter.is_connected());

        let err = adapter
            .handle_file(&RequestContext::default(), upload("late"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The database connection must be open to store files");
    }

    #[tokio::test]
    async fn test_handle_only_connector_events() {
        let connector = Arc::new(MemoryConnector::new(MemoryServer::new()).handle_only());
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let mut events = adapter.subscribe();
        let result = adapter.ready().await.unwrap();
        assert!(result.client.is_none());
        assert!(matches!(next_event(&mut events).await, AdapterEvent::Connection(_)));

        connector.last_database().unwrap().emit(BackendEvent::Error("bad".into()));
        assert!(matches!(next_event(&mut events).await, AdapterEvent::DbError(_)));
    }

    #[tokio::test]
    async fn test_remove_file() {
        let connector = connector();
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let request = RequestContext::default();
        let stored = adapter.handle_file(&request, upload("bye")).await.unwrap();
        assert_eq!(connector.server().file_count("uploads", "fs").await, 1);

        adapter.remove_file(&request, &stored).await.unwrap();
        assert_eq!(connector.server().file_count("uploads", "fs").await, 0);
        assert!(adapter.remove_file(&request, &stored).await.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let connector = connector();
        let adapter = StorageAdapter::new(StorageOptions::url(URL, connector.clone())).unwrap();
        let clone = adapter.clone();
        adapter.ready().await.unwrap();
        assert!(clone.is_connected());
        assert!(Arc::ptr_eq(&adapter.handle().unwrap(), &clone.handle().unwrap()));
    }
}
