//! Deduplication of concurrent refreshes

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::{
    cache::TokenCache, config::CredentialConfig, resolver::CredentialResolver, AccessToken,
    BackendIdentity, BrokerError, TokenRecord,
};

type PendingRefresh = Shared<BoxFuture<'static, Result<TokenRecord, BrokerError>>>;

/// In-flight refreshes, and a generation per backend that is bumped whenever
/// the backend's in-flight refresh is abandoned
#[derive(Default)]
struct PendingState {
    refreshes: HashMap<BackendIdentity, PendingRefresh>,
    generations: HashMap<BackendIdentity, u64>,
}

impl PendingState {
    fn generation(&self, identity: &BackendIdentity) -> u64 {
        self.generations.get(identity).copied().unwrap_or_default()
    }

    fn abandon(&mut self, identity: &BackendIdentity) {
        if self.refreshes.remove(identity).is_some() {
            *self.generations.entry(identity.clone()).or_default() += 1;
        }
    }
}

/// Hands out valid tokens, running at most one resolution per backend at a time
///
/// When no valid token is cached, the first caller starts a resolution and
/// every concurrent caller for the same backend awaits that same attempt and
/// receives the same outcome.
#[derive(Clone)]
pub struct RefreshCoordinator {
    cache: TokenCache,
    resolver: Arc<CredentialResolver>,
    pending: Arc<Mutex<PendingState>>,
}

impl RefreshCoordinator {
    /// Constructs a coordinator over `cache` that resolves tokens with `resolver`
    pub fn new(cache: TokenCache, resolver: CredentialResolver) -> Self {
        Self {
            cache,
            resolver: Arc::new(resolver),
            pending: Arc::default(),
        }
    }

    /// The cache this coordinator fills
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Gets a valid access token for `identity`
    pub async fn get_token(
        &self,
        identity: &BackendIdentity,
        config: &CredentialConfig,
    ) -> Result<AccessToken, BrokerError> {
        let record = self.get_record(identity, config).await?;
        Ok(record.access_token().to_owned())
    }

    /// Gets a valid token record for `identity`
    pub async fn get_record(
        &self,
        identity: &BackendIdentity,
        config: &CredentialConfig,
    ) -> Result<TokenRecord, BrokerError> {
        if let Some(record) = self.cache.get_valid(identity) {
            tracing::trace!(backend = %identity, "using cached token");
            return Ok(record);
        }

        let pending = {
            let mut state = self.pending();

            // A refresh may have completed between the check above and taking the lock.
            if let Some(record) = self.cache.get_valid(identity) {
                return Ok(record);
            }

            match state.refreshes.get(identity) {
                Some(pending) => {
                    tracing::debug!(backend = %identity, "awaiting in-flight refresh");
                    pending.clone()
                }
                None => {
                    tracing::debug!(backend = %identity, "starting refresh");
                    let generation = state.generation(identity);
                    let pending =
                        self.start_refresh(identity.clone(), config.clone(), generation);
                    state.refreshes.insert(identity.clone(), pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Whether a refresh for `identity` is currently in flight
    pub fn is_refreshing(&self, identity: &BackendIdentity) -> bool {
        self.pending().refreshes.contains_key(identity)
    }

    /// Abandons the in-flight refresh for `identity`, if any
    ///
    /// Callers already awaiting it still receive its outcome, but the token it
    /// produces is not cached. The next caller starts a new refresh.
    pub fn forget(&self, identity: &BackendIdentity) {
        self.pending().abandon(identity);
    }

    /// Abandons every in-flight refresh
    pub fn forget_all(&self) {
        let mut state = self.pending();
        let identities: Vec<_> = state.refreshes.keys().cloned().collect();
        for identity in &identities {
            state.abandon(identity);
        }
    }

    fn start_refresh(
        &self,
        identity: BackendIdentity,
        config: CredentialConfig,
        generation: u64,
    ) -> PendingRefresh {
        let cache = self.cache.clone();
        let resolver = self.resolver.clone();
        let pending = self.pending.clone();

        async move {
            let cached = cache.get(&identity);
            let result = resolver.resolve(&config, cached.as_ref()).await;

            let mut state = pending.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation(&identity) != generation {
                tracing::debug!(backend = %identity, "discarding abandoned refresh");
                return result;
            }

            // The cache is updated before the entry is removed, so a caller
            // that misses the entry always finds the new token.
            if let Ok(record) = &result {
                cache.set(record.clone());
            }
            state.refreshes.remove(&identity);

            result
        }
        .boxed()
        .shared()
    }

    fn pending(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.pending();
        f.debug_struct("RefreshCoordinator")
            .field("cache", &self.cache)
            .field("resolver", &self.resolver)
            .field("pending", &state.refreshes.keys().collect::<Vec<_>>())
            .finish()
    }
}
