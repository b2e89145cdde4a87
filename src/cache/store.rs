//! The connection cache.
//!
//! Entries are addressed `cache_name → url → slot`.  Every operation that
//! inspects or mutates entries runs under one synchronous lock that is
//! never held across an `.await`, so checking an entry and claiming it
//! ([`ConnectionCache::try_claim`]) is atomic with respect to every other
//! adapter.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use metrics::gauge;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::options::{is_empty, ConnectOptions, LooseComparator, OptionsComparator};
use crate::errors::{SharedError, StorageError};
use crate::metrics::CACHE_ENTRIES;
use crate::settle::Settle;
use crate::storage::backend::{Client, ConnectionResult, Database};
use crate::uri;

/// Capacity of the cache event channel.
const EVENT_CAPACITY: usize = 64;

/// Message carried by the rejection sent when a pending entry is removed.
pub const ENTRY_DELETED_MESSAGE: &str = "The cache entry was deleted";

/// Message carried by pending entries dropped by [`ConnectionCache::clear`].
pub const CACHE_CLEARED_MESSAGE: &str = "The cache was cleared";

/// Message carried by a pending entry overwritten through [`ConnectionCache::set`].
pub const ENTRY_REPLACED_MESSAGE: &str = "The cache entry was replaced";

/// Address of one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheIndex {
    pub cache_name: String,
    /// Normalized connection URL.
    pub url: String,
    pub slot: u64,
}

impl fmt::Display for CacheIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.cache_name, self.url, self.slot)
    }
}

/// One physical connection attempt and its outcome.
#[derive(Clone)]
pub struct CacheEntry {
    pub handle: Option<Arc<dyn Database>>,
    pub client: Option<Arc<dyn Client>>,
    /// The attempt has not resolved yet.
    pub pending: bool,
    /// Some adapter has claimed responsibility for connecting.
    pub opening: bool,
    /// Options the entry was created with; `None` when empty.
    pub init: Option<ConnectOptions>,
    outcome: Settle<ConnectionResult, SharedError>,
}

impl CacheEntry {
    /// A fresh pending entry.
    pub fn pending(init: Option<ConnectOptions>) -> Self {
        Self {
            handle: None,
            client: None,
            pending: true,
            opening: false,
            init,
            outcome: Settle::new(),
        }
    }

    /// The cell this entry settles on resolve or reject.
    pub fn outcome(&self) -> Settle<ConnectionResult, SharedError> {
        self.outcome.clone()
    }

    fn result(&self) -> Option<ConnectionResult> {
        self.handle.as_ref().map(|handle| ConnectionResult {
            handle: Arc::clone(handle),
            client: self.client.clone(),
        })
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("handle", &self.handle.as_ref().map(|h| h.name().to_string()))
            .field("client", &self.client.is_some())
            .field("pending", &self.pending)
            .field("opening", &self.opening)
            .field("init", &self.init)
            .finish()
    }
}

/// Broadcast when an entry settles.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Resolved(CacheIndex),
    Rejected(CacheIndex, SharedError),
}

#[derive(Default)]
struct UrlBucket {
    /// Next slot to hand out; never decremented.
    next: u64,
    slots: BTreeMap<u64, CacheEntry>,
}

#[derive(Default)]
struct CacheState {
    names: HashMap<String, HashMap<String, UrlBucket>>,
}

impl CacheState {
    fn entry(&self, index: &CacheIndex) -> Option<&CacheEntry> {
        self.names
            .get(&index.cache_name)?
            .get(&index.url)?
            .slots
            .get(&index.slot)
    }

    fn entry_mut(&mut self, index: &CacheIndex) -> Option<&mut CacheEntry> {
        self.names
            .get_mut(&index.cache_name)?
            .get_mut(&index.url)?
            .slots
            .get_mut(&index.slot)
    }

    fn take(&mut self, index: &CacheIndex) -> Option<CacheEntry> {
        self.names
            .get_mut(&index.cache_name)?
            .get_mut(&index.url)?
            .slots
            .remove(&index.slot)
    }

    fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.names
            .values()
            .flat_map(HashMap::values)
            .flat_map(|bucket| bucket.slots.values())
    }

    fn len(&self) -> usize {
        self.names
            .values()
            .flat_map(HashMap::values)
            .map(|bucket| bucket.slots.len())
            .sum()
    }
}

/// Process-wide registry of connection attempts.
pub struct ConnectionCache {
    state: Mutex<CacheState>,
    events: Mutex<broadcast::Sender<CacheEvent>>,
    comparator: Arc<dyn OptionsComparator>,
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCache {
    /// An empty cache using [`LooseComparator`].
    pub fn new() -> Self {
        Self::with_comparator(Arc::new(LooseComparator))
    }

    /// An empty cache that matches options with `comparator`.
    pub fn with_comparator(comparator: Arc<dyn OptionsComparator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(CacheState::default()),
            events: Mutex::new(events),
            comparator,
        }
    }

    /// The shared default instance used by adapters that are not given one.
    pub fn global() -> Arc<ConnectionCache> {
        static GLOBAL: OnceLock<Arc<ConnectionCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ConnectionCache::new())))
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CacheEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        // No subscribers is fine; waiters use the entry's own cell.
        let _ = events.send(event);
    }

    /// Receive every resolve/reject broadcast from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe()
    }

    /// Find or create the slot for `(cache_name, url, init)`.
    pub fn initialize(
        &self,
        cache_name: &str,
        url: &str,
        init: Option<ConnectOptions>,
    ) -> CacheIndex {
        let url = uri::normalize(url);
        let init = if is_empty(init.as_ref()) { None } else { init };

        let mut state = self.state();
        let bucket = state
            .names
            .entry(cache_name.to_string())
            .or_default()
            .entry(url.clone())
            .or_default();

        let existing = bucket
            .slots
            .iter()
            .find(|(_, entry)| self.comparator.equivalent(entry.init.as_ref(), init.as_ref()))
            .map(|(slot, _)| *slot);

        let slot = match existing {
            Some(slot) => {
                debug!(cache = cache_name, url = %url, slot, "Reusing cached connection slot");
                slot
            }
            None => {
                let slot = bucket.next;
                bucket.next += 1;
                bucket.slots.insert(slot, CacheEntry::pending(init));
                debug!(cache = cache_name, url = %url, slot, "Created connection cache slot");
                slot
            }
        };
        gauge!(CACHE_ENTRIES).set(state.len() as f64);

        CacheIndex {
            cache_name: cache_name.to_string(),
            url,
            slot,
        }
    }

    pub fn has(&self, index: &CacheIndex) -> bool {
        self.state().entry(index).is_some()
    }

    /// Snapshot of the entry at `index`.
    pub fn get(&self, index: &CacheIndex) -> Option<CacheEntry> {
        self.state().entry(index).cloned()
    }

    /// Overwrite (or create) the entry at `index`.
    ///
    /// A pending entry that is displaced settles with an error, so adapters
    /// waiting on it do not hang.
    pub fn set(&self, index: &CacheIndex, entry: CacheEntry) {
        let displaced = {
            let mut state = self.state();
            let bucket = state
                .names
                .entry(index.cache_name.clone())
                .or_default()
                .entry(index.url.clone())
                .or_default();
            bucket.next = bucket.next.max(index.slot + 1);
            bucket.slots.insert(index.slot, entry)
        };
        if let Some(old) = displaced.filter(|old| old.pending) {
            old.outcome
                .settle(Err(Arc::new(anyhow::anyhow!(ENTRY_REPLACED_MESSAGE))));
        }
        self.update_gauge();
    }

    pub fn is_pending(&self, index: &CacheIndex) -> bool {
        self.state().entry(index).is_some_and(|e| e.pending)
    }

    pub fn is_opening(&self, index: &CacheIndex) -> bool {
        self.state().entry(index).is_some_and(|e| e.opening)
    }

    /// Claim the connect attempt for `index`.
    ///
    /// Succeeds only for an existing entry that is pending and unclaimed;
    /// the caller then owns the attempt and must resolve or reject it.
    pub fn try_claim(&self, index: &CacheIndex) -> bool {
        let mut state = self.state();
        match state.entry_mut(index) {
            Some(entry) if entry.pending && !entry.opening => {
                entry.opening = true;
                true
            }
            _ => false,
        }
    }

    /// Record a successful connection and wake every waiter.
    pub fn resolve(
        &self,
        index: &CacheIndex,
        handle: Arc<dyn Database>,
        client: Option<Arc<dyn Client>>,
    ) {
        {
            let mut state = self.state();
            let Some(entry) = state.entry_mut(index) else {
                warn!(index = %index, "Resolve for a cache entry that no longer exists");
                return;
            };
            entry.handle = Some(Arc::clone(&handle));
            entry.client = client.clone();
            entry.pending = false;
            entry.opening = false;
            entry.outcome.settle(Ok(ConnectionResult { handle, client }));
        }
        info!(index = %index, "Cached connection resolved");
        self.emit(CacheEvent::Resolved(index.clone()));
    }

    /// Broadcast a failed connection, then drop the entry so a later
    /// `initialize` starts over.
    ///
    /// Settling, broadcasting and removal happen under the cache lock, so no
    /// other adapter can pick up the failed entry in between.
    pub fn reject(&self, index: &CacheIndex, error: SharedError) {
        {
            let mut state = self.state();
            if let Some(entry) = state.entry(index) {
                entry.outcome.settle(Err(Arc::clone(&error)));
            }
            self.emit(CacheEvent::Rejected(index.clone(), Arc::clone(&error)));
            state.take(index);
        }
        warn!(index = %index, error = %error, "Cached connection rejected");
        self.update_gauge();
    }

    /// Wait until the entry at `index` settles.
    ///
    /// Returns immediately for an entry that already resolved.
    pub async fn wait_for(&self, index: &CacheIndex) -> Result<ConnectionResult, StorageError> {
        let waiter = {
            let state = self.state();
            let Some(entry) = state.entry(index) else {
                return Err(missing(index));
            };
            if !entry.pending && !entry.opening {
                return entry.result().ok_or_else(|| missing(index));
            }
            entry.outcome.waiter()
        };

        match waiter.wait().await {
            Some(Ok(result)) => Ok(result),
            Some(Err(error)) => Err(StorageError::Connection(error)),
            None => Err(missing(index)),
        }
    }

    /// Delete the entry at `index`.  A pending entry is rejected first.
    pub fn remove(&self, index: &CacheIndex) {
        let Some(entry) = self.state().take(index) else {
            return;
        };
        if entry.pending {
            let error: SharedError = Arc::new(anyhow::anyhow!(ENTRY_DELETED_MESSAGE));
            entry.outcome.settle(Err(Arc::clone(&error)));
            self.emit(CacheEvent::Rejected(index.clone(), error));
        }
        self.update_gauge();
    }

    /// Drop every entry and disconnect every event subscriber.  Entries
    /// still pending settle with an error first.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.state());
        let error: SharedError = Arc::new(anyhow::anyhow!(CACHE_CLEARED_MESSAGE));
        for entry in dropped.entries().filter(|entry| entry.pending) {
            entry.outcome.settle(Err(Arc::clone(&error)));
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = events;
        self.update_gauge();
    }

    /// Number of live entries across every bucket.
    pub fn connections(&self) -> usize {
        self.state().len()
    }

    fn update_gauge(&self) {
        gauge!(CACHE_ENTRIES).set(self.connections() as f64);
    }
}

fn missing(index: &CacheIndex) -> StorageError {
    StorageError::CacheEntryMissing {
        cache_name: index.cache_name.clone(),
        url: index.url.clone(),
        slot: index.slot,
    }
}
