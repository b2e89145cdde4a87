//! Adapter construction options and connection sources.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::adapter::settings::FileNaming;
use crate::cache::options::{options_from_json, ConnectOptions};
use crate::cache::store::ConnectionCache;
use crate::config::{CacheSetting, ConnectionConfig};
use crate::storage::backend::{Client, Connector, Database, Session};

/// A connection that is still being established elsewhere.
pub type Pending<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Where a caller-supplied database handle comes from.
pub enum ConnectionSource {
    Direct(Arc<dyn Database>),
    Awaitable(Pending<Arc<dyn Database>>),
    /// A session wrapper whose inner handle is used.
    Wrapped(Arc<dyn Session>),
}

impl ConnectionSource {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Arc<dyn Database>>> + Send + 'static,
    {
        ConnectionSource::Awaitable(Box::pin(future))
    }

    /// The handle, if available without waiting.
    pub fn immediate(&self) -> Option<Arc<dyn Database>> {
        match self {
            ConnectionSource::Direct(handle) => Some(Arc::clone(handle)),
            ConnectionSource::Wrapped(session) => Some(session.database()),
            ConnectionSource::Awaitable(_) => None,
        }
    }

    pub async fn resolve(self) -> anyhow::Result<Arc<dyn Database>> {
        match self {
            ConnectionSource::Direct(handle) => Ok(handle),
            ConnectionSource::Wrapped(session) => Ok(session.database()),
            ConnectionSource::Awaitable(pending) => pending.await,
        }
    }
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSource::Direct(handle) => write!(f, "Direct({})", handle.name()),
            ConnectionSource::Awaitable(_) => f.write_str("Awaitable"),
            ConnectionSource::Wrapped(_) => f.write_str("Wrapped"),
        }
    }
}

/// Where a caller-supplied client comes from.
pub enum ClientSource {
    Direct(Arc<dyn Client>),
    Awaitable(Pending<Arc<dyn Client>>),
}

impl ClientSource {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Arc<dyn Client>>> + Send + 'static,
    {
        ClientSource::Awaitable(Box::pin(future))
    }

    pub async fn resolve(self) -> anyhow::Result<Arc<dyn Client>> {
        match self {
            ClientSource::Direct(client) => Ok(client),
            ClientSource::Awaitable(pending) => pending.await,
        }
    }
}

/// Everything needed to build a [`StorageAdapter`](crate::StorageAdapter).
///
/// Either `url` (with a `connector`) or `db` must be set.  When both are
/// set the supplied handle wins and the URL is ignored.
#[derive(Default)]
pub struct StorageOptions {
    pub url: Option<String>,
    pub options: Option<ConnectOptions>,
    pub cache: CacheSetting,
    pub db: Option<ConnectionSource>,
    pub client: Option<ClientSource>,
    pub file: Option<FileNaming>,
    pub connector: Option<Arc<dyn Connector>>,
    /// Cache to use instead of [`ConnectionCache::global`].
    pub cache_store: Option<Arc<ConnectionCache>>,
}

impl StorageOptions {
    /// Options that open `url` through `connector`.
    pub fn url(url: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            url: Some(url.into()),
            connector: Some(connector),
            ..Self::default()
        }
    }

    /// Options that use an existing database handle.
    pub fn db(source: ConnectionSource) -> Self {
        Self {
            db: Some(source),
            ..Self::default()
        }
    }

    /// Options described by a loaded configuration section.
    pub fn from_config(config: &ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            url: config.url.clone(),
            options: config.options.clone().and_then(options_from_json),
            cache: config.cache.clone(),
            connector: Some(connector),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_cache(mut self, cache: impl Into<CacheSetting>) -> Self {
        self.cache = cache.into();
        self
    }

    pub fn with_client(mut self, client: ClientSource) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_file(mut self, naming: FileNaming) -> Self {
        self.file = Some(naming);
        self
    }

    pub fn with_cache_store(mut self, cache: Arc<ConnectionCache>) -> Self {
        self.cache_store = Some(cache);
        self
    }
}
