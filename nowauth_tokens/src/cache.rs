//! The in-memory token cache and its write-through persistence

use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use nowauth_clock::{SharedClock, System};

use crate::{
    store::{InMemoryTokenStore, StoreError, TokenRecords, TokenStore},
    BackendIdentity, TokenRecord,
};

/// An in-memory map of backend identity to token record
///
/// Every update is written through to the backing [`TokenStore`] in the
/// background. Persistence failures are logged and never reach the caller.
/// Clones share the same cache.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

struct Inner {
    records: Mutex<TokenRecords>,
    store: Arc<dyn TokenStore>,
    write_lock: tokio::sync::Mutex<()>,
    clock: SharedClock,
}

impl TokenCache {
    /// Constructs an empty cache backed by `store`
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self::with_records(store, TokenRecords::new(), Arc::new(System))
    }

    /// Constructs an empty cache that does not persist anywhere
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTokenStore::new()))
    }

    /// Constructs a cache populated from `store`
    ///
    /// Records that have already expired are discarded. If the store cannot be
    /// read, the failure is logged and the cache starts empty.
    pub async fn restore(store: Arc<dyn TokenStore>, clock: SharedClock) -> Self {
        let now = clock.now();
        let records = match store.load().await {
            Ok(records) => {
                let total = records.len();
                let live: TokenRecords = records
                    .into_iter()
                    .filter(|(_, record)| record.expires_at() > now)
                    .collect();
                tracing::debug!(
                    loaded = live.len(),
                    discarded = total - live.len(),
                    "restored token cache"
                );
                live
            }
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "unable to load token cache, continuing in memory"
                );
                TokenRecords::new()
            }
        };

        Self::with_records(store, records, clock)
    }

    fn with_records(store: Arc<dyn TokenStore>, records: TokenRecords, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(records),
                store,
                write_lock: tokio::sync::Mutex::new(()),
                clock,
            }),
        }
    }

    /// Replaces the clock used for validity checks
    ///
    /// Useful for testing purposes
    pub fn with_clock(self, clock: SharedClock) -> Self {
        let records = self.records().clone();
        Self::with_records(self.inner.store.clone(), records, clock)
    }

    /// The clock used for validity checks
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Gets the record for `identity`, whether or not it is still valid
    pub fn get(&self, identity: &BackendIdentity) -> Option<TokenRecord> {
        self.records().get(identity).cloned()
    }

    /// Gets the record for `identity` only if it is still valid
    pub fn get_valid(&self, identity: &BackendIdentity) -> Option<TokenRecord> {
        self.get(identity)
            .filter(|record| record.is_valid_with_clock(&*self.inner.clock))
    }

    /// Whether a record exists for `identity` and has not yet expired
    pub fn is_valid(&self, identity: &BackendIdentity) -> bool {
        self.get_valid(identity).is_some()
    }

    /// Stores `record` under its backend identity
    pub fn set(&self, record: TokenRecord) {
        tracing::debug!(
            backend = %record.backend(),
            expires_at = record.expires_at().0,
            "caching token"
        );
        self.records().insert(record.backend().clone(), record);
        self.persist_in_background();
    }

    /// Evicts the record for `identity`
    ///
    /// Returns the evicted record, if there was one.
    pub fn invalidate(&self, identity: &BackendIdentity) -> Option<TokenRecord> {
        let evicted = self.records().remove(identity);
        if evicted.is_some() {
            tracing::debug!(backend = %identity, "invalidated cached token");
            self.persist_in_background();
        }
        evicted
    }

    /// Evicts every record
    pub fn clear(&self) {
        self.records().clear();
        self.persist_in_background();
    }

    /// Writes the current records to the store and waits for the write to finish
    pub async fn flush(&self) -> Result<(), StoreError> {
        persist(&self.inner).await
    }

    fn persist_in_background(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime available, skipping token cache write");
            return;
        };

        let inner = self.inner.clone();
        handle.spawn(async move {
            if let Err(error) = persist(&inner).await {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "unable to persist token cache"
                );
            }
        });
    }

    fn records(&self) -> MutexGuard<'_, TokenRecords> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Writes are serialized and always take the latest snapshot, so the last
/// write to finish matches the final in-memory state.
async fn persist(inner: &Inner) -> Result<(), StoreError> {
    let _guard = inner.write_lock.lock().await;
    let snapshot = inner
        .records
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    inner.store.save(&snapshot).await?;
    tracing::trace!(records = snapshot.len(), "persisted token cache");
    Ok(())
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("backends", &self.records().keys().collect::<Vec<_>>())
            .field("clock", &self.inner.clock)
            .finish()
    }
}
