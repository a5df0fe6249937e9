//! The per-process broker that hands out authenticated clients

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use nowauth_tokens::{
    identity, AccessToken, BackendIdentity, BrokerError, BrokerOptions, CredentialConfig,
    CredentialContext, CredentialResolver, RefreshCoordinator, TokenCache,
};
use reqwest::header;
use reqwest_middleware::ClientBuilder;

use crate::{AuthSession, AuthorizationMiddleware, InstanceClient};

/// Builds and caches one authenticated [`InstanceClient`] per backend
///
/// A broker owns the token cache and the refresh coordinator, so a single
/// broker should be shared by everything in the process that talks to the
/// same set of backends. Clones share the same state.
#[derive(Clone)]
pub struct SessionBroker {
    inner: Arc<Inner>,
}

struct Inner {
    coordinator: RefreshCoordinator,
    http: reqwest::Client,
    options: BrokerOptions,
    clients: Mutex<HashMap<BackendIdentity, InstanceClient>>,
    contexts: Mutex<HashMap<BackendIdentity, CredentialContext>>,
}

impl SessionBroker {
    /// Constructs a broker over an existing token cache
    ///
    /// The resolver shares the cache's clock.
    pub fn new(cache: TokenCache, options: BrokerOptions) -> Result<Self, BrokerError> {
        let resolver =
            CredentialResolver::new(options.resolver.clone())?.with_clock(cache.clock().clone());

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        default_headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let http = reqwest::Client::builder()
            .timeout(options.api_timeout)
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                coordinator: RefreshCoordinator::new(cache, resolver),
                http,
                options,
                clients: Mutex::default(),
                contexts: Mutex::default(),
            }),
        })
    }

    /// Constructs a broker whose token cache is persisted to disk
    ///
    /// The cache is restored from [`BrokerOptions::cache_file_path()`]. If no
    /// per-user configuration directory can be found, tokens are only kept in
    /// memory.
    #[cfg(feature = "file")]
    pub async fn from_options(options: BrokerOptions) -> Result<Self, BrokerError> {
        use nowauth_tokens::store::{FileTokenStore, InMemoryTokenStore, TokenStore};

        let store: Arc<dyn TokenStore> = match options.cache_file_path() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "using token cache file");
                Arc::new(FileTokenStore::new(path))
            }
            None => {
                tracing::warn!("no configuration directory found; tokens will not be persisted");
                Arc::new(InMemoryTokenStore::new())
            }
        };

        let cache = TokenCache::restore(store, Arc::new(nowauth_clock::System)).await;
        Self::new(cache, options)
    }

    /// The token cache shared by every client of this broker
    pub fn cache(&self) -> &TokenCache {
        self.inner.coordinator.cache()
    }

    /// The options this broker was built with
    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    /// Gets a client for the backend named in `config`
    ///
    /// A previously built client is reused as long as the backend's token is
    /// still valid. Otherwise a valid token is obtained first and a new client
    /// is built around it.
    #[tracing::instrument(skip_all, fields(backend = %config.backend_url))]
    pub async fn client(&self, config: CredentialConfig) -> Result<InstanceClient, BrokerError> {
        let identity = BackendIdentity::from_url(&config.backend_url)?;
        let base_url = identity::base_url(&config.backend_url)?;
        let context = self.context_for(&identity, config);

        if self.cache().is_valid(&identity) {
            if let Some(client) = self.clients().get(&identity) {
                tracing::trace!("reusing cached client");
                return Ok(client.clone());
            }
        }

        self.inner
            .coordinator
            .get_token(&identity, &context.snapshot())
            .await?;

        let session = AuthSession::new(
            identity.clone(),
            base_url.clone(),
            self.inner.coordinator.clone(),
            context,
        );
        let http = ClientBuilder::new(self.inner.http.clone())
            .with(AuthorizationMiddleware::new(session))
            .build();
        let client = InstanceClient::new(http, base_url, identity.clone());

        tracing::debug!("built client");
        self.clients().insert(identity, client.clone());
        Ok(client)
    }

    /// Gets a valid access token for the backend named in `config`
    pub async fn token(&self, config: CredentialConfig) -> Result<AccessToken, BrokerError> {
        let identity = BackendIdentity::from_url(&config.backend_url)?;
        let context = self.context_for(&identity, config);
        self.inner
            .coordinator
            .get_token(&identity, &context.snapshot())
            .await
    }

    /// Forgets everything known about `identity`
    ///
    /// The cached token is evicted and the removal persisted, the cached
    /// client is dropped, and any preloaded token that was previously
    /// rejected may be used again. A refresh already in flight is abandoned
    /// and its token is never cached.
    pub fn clear_credentials(&self, identity: &BackendIdentity) {
        tracing::info!(backend = %identity, "clearing credentials");
        self.inner.coordinator.forget(identity);
        self.cache().invalidate(identity);
        self.clients().remove(identity);
        lock(&self.inner.contexts).remove(identity);
    }

    /// Forgets everything known about every backend
    pub fn clear_all(&self) {
        tracing::info!("clearing all credentials");
        self.inner.coordinator.forget_all();
        self.cache().clear();
        self.clients().clear();
        lock(&self.inner.contexts).clear();
    }

    fn context_for(&self, identity: &BackendIdentity, config: CredentialConfig) -> CredentialContext {
        let mut contexts = lock(&self.inner.contexts);
        match contexts.get(identity) {
            Some(context) => {
                context.update(config);
                context.clone()
            }
            None => {
                let context = CredentialContext::new(config);
                contexts.insert(identity.clone(), context.clone());
                context
            }
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<BackendIdentity, InstanceClient>> {
        lock(&self.inner.clients)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionBroker")
            .field("coordinator", &self.inner.coordinator)
            .field("options", &self.inner.options)
            .field("clients", &self.clients().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nowauth_clock::{TestClock, UnixTime};
    use nowauth_tokens::{store::InMemoryTokenStore, PreloadedToken};
    use serde_json::json;
    use wiremock::{
        matchers::{body_string_contains, header as header_eq, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const NOW: UnixTime = UnixTime(1_800_000_000_000);

    fn broker(clock: &TestClock) -> SessionBroker {
        let cache = TokenCache::new(Arc::new(InMemoryTokenStore::new()))
            .with_clock(Arc::new(clock.clone()));
        SessionBroker::new(cache, BrokerOptions::default()).unwrap()
    }

    async fn mount_token_endpoint(server: &MockServer, token: &str, calls: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth_token.do"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_in": 1800,
            })))
            .up_to_n_times(calls)
            .expect(calls)
            .mount(server)
            .await;
    }

    fn oauth_config(server: &MockServer) -> CredentialConfig {
        CredentialConfig::new(server.uri()).with_client_credentials("id", "secret")
    }

    mod when_requesting_a_client {
        use super::*;

        #[tokio::test]
        async fn valid_token_reuses_the_client_without_network() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);

            let first = broker.client(oauth_config(&server)).await.unwrap();
            let second = broker.client(oauth_config(&server)).await.unwrap();

            assert_eq!(first.identity(), second.identity());
        }

        #[tokio::test]
        async fn expired_token_rebuilds_the_client() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 2).await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);

            broker.client(oauth_config(&server)).await.unwrap();
            clock.advance(Duration::from_secs(1800));
            broker.client(oauth_config(&server)).await.unwrap();
        }

        #[tokio::test]
        async fn placeholder_backend_is_a_configuration_error() {
            let clock = TestClock::new(NOW);
            let broker = broker(&clock);

            let err = broker
                .client(
                    CredentialConfig::new("https://your-instance.service-now.com")
                        .with_client_credentials("id", "secret"),
                )
                .await
                .unwrap_err();

            assert!(matches!(err, BrokerError::Configuration(_)));
        }

        #[tokio::test]
        async fn missing_credentials_are_a_configuration_error() {
            let server = MockServer::start().await;
            let clock = TestClock::new(NOW);
            let broker = broker(&clock);

            let err = broker
                .client(CredentialConfig::new(server.uri()))
                .await
                .unwrap_err();

            assert!(matches!(err, BrokerError::Configuration(_)));
        }
    }

    mod when_calling_the_backend {
        use super::*;

        #[tokio::test]
        async fn bare_array_is_normalized_and_headers_are_set() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;
            Mock::given(method("GET"))
                .and(path("/api/now/table/incident"))
                .and(query_param("sysparm_limit", "1"))
                .and(header_eq("authorization", "Bearer token-1"))
                .and(header_eq("accept", "application/json"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "sys_id": "1" }])))
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let client = broker(&clock).client(oauth_config(&server)).await.unwrap();

            let value = client
                .get("/api/now/table/incident", &[("sysparm_limit", "1")])
                .await
                .unwrap();

            assert_eq!(value, json!({ "result": [{ "sys_id": "1" }] }));
        }

        #[tokio::test]
        async fn json_bodies_are_sent() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;
            Mock::given(method("POST"))
                .and(path("/api/now/table/incident"))
                .and(header_eq("content-type", "application/json"))
                .and(body_string_contains(r#""short_description":"printer on fire""#))
                .respond_with(
                    ResponseTemplate::new(201)
                        .set_body_json(json!({ "result": { "sys_id": "abc" } })),
                )
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let client = broker(&clock).client(oauth_config(&server)).await.unwrap();

            let value = client
                .post(
                    "api/now/table/incident",
                    &json!({ "short_description": "printer on fire" }),
                )
                .await
                .unwrap();

            assert_eq!(value["result"]["sys_id"], "abc");
        }

        #[tokio::test]
        async fn empty_delete_response_is_a_null_result() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;
            Mock::given(method("DELETE"))
                .and(path("/api/now/table/incident/abc"))
                .respond_with(ResponseTemplate::new(204))
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let client = broker(&clock).client(oauth_config(&server)).await.unwrap();

            let value = client.delete("/api/now/table/incident/abc").await.unwrap();

            assert_eq!(value, json!({ "result": null }));
        }

        #[tokio::test]
        async fn embedded_error_is_an_upstream_error() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "error": { "message": "Invalid query", "detail": "bad field" },
                    "status": "failure",
                })))
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let client = broker(&clock).client(oauth_config(&server)).await.unwrap();

            let err = client.get("/api/now/table/incident", &[]).await.unwrap_err();

            assert!(matches!(
                err,
                BrokerError::Upstream { status: Some(200), ref message, .. } if message == "Invalid query"
            ));
        }

        #[tokio::test]
        async fn forbidden_is_a_permission_error_without_refresh() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                    "error": { "message": "User Not Authorized" },
                    "status": "failure",
                })))
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);
            let client = broker.client(oauth_config(&server)).await.unwrap();

            let err = client.get("/api/now/table/incident", &[]).await.unwrap_err();

            assert!(matches!(err, BrokerError::Permission(_)));
            assert!(broker.cache().is_valid(client.identity()));
        }

        #[tokio::test]
        async fn basic_credentials_are_sent_verbatim() {
            let server = MockServer::start().await;
            // base64("admin:pw")
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Basic YWRtaW46cHc="))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [] })))
                .expect(2)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let client = broker(&clock)
                .client(CredentialConfig::new(server.uri()).with_basic_auth("admin", "pw"))
                .await
                .unwrap();

            let value = client.get("/api/now/table/incident", &[]).await.unwrap();

            assert_eq!(value, json!({ "result": [] }));
        }
    }

    mod when_backend_rejects_the_token {
        use super::*;

        #[tokio::test]
        async fn request_is_retried_once_with_a_new_token() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;
            mount_token_endpoint(&server, "token-2", 1).await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer token-1"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer token-2"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);
            let client = broker.client(oauth_config(&server)).await.unwrap();

            let value = client.get("/api/now/table/incident", &[]).await.unwrap();

            assert_eq!(value, json!({ "result": [] }));
            let record = broker.cache().get(client.identity()).unwrap();
            assert_eq!(record.access_token().as_str(), "token-2");
        }

        #[tokio::test]
        async fn second_rejection_is_an_authentication_error() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 2).await;
            Mock::given(method("GET"))
                .and(path("/api/now/table/incident"))
                .respond_with(ResponseTemplate::new(401))
                .expect(2)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let client = broker(&clock).client(oauth_config(&server)).await.unwrap();

            let err = client.get("/api/now/table/incident", &[]).await.unwrap_err();

            assert!(matches!(err, BrokerError::Authentication { .. }));
        }

        #[tokio::test]
        async fn rejected_preloaded_token_is_never_reselected() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "fresh-token", 2).await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer stale-token"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer fresh-token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
                .expect(2)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);
            let config =
                oauth_config(&server).with_preloaded(PreloadedToken::new("stale-token"));

            let client = broker.client(config.clone()).await.unwrap();
            client.get("/api/now/table/incident", &[]).await.unwrap();

            // Same configuration, but the cached token is gone.
            broker.cache().invalidate(client.identity());
            let client = broker.client(config).await.unwrap();
            client.get("/api/now/table/incident", &[]).await.unwrap();
        }

        #[tokio::test]
        async fn refresh_token_from_a_rejected_login_is_used() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/oauth_token.do"))
                .and(body_string_contains("grant_type=refresh_token"))
                .and(body_string_contains("refresh_token=login-refresh"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "via-refresh",
                    "expires_in": 1800,
                })))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/oauth_token.do"))
                .and(body_string_contains("grant_type=client_credentials"))
                .respond_with(
                    ResponseTemplate::new(401)
                        .set_body_json(json!({ "error": "unauthorized_client" })),
                )
                .expect(0)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer stale"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer via-refresh"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);
            let config = oauth_config(&server)
                .with_preloaded(PreloadedToken::new("stale").with_refresh_token("login-refresh"));
            let client = broker.client(config).await.unwrap();

            let value = client.get("/api/now/table/incident", &[]).await.unwrap();

            assert_eq!(value, json!({ "result": [] }));
            let record = broker.cache().get(client.identity()).unwrap();
            assert_eq!(record.access_token().as_str(), "via-refresh");
            assert_eq!(
                record.refresh_token().map(|rt| rt.as_str()),
                Some("login-refresh")
            );
        }

        #[tokio::test]
        async fn rotated_refresh_token_is_used_after_rejection() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/oauth_token.do"))
                .and(body_string_contains("refresh_token=original"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "token-1",
                    "refresh_token": "rotated",
                    "expires_in": 1800,
                })))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/oauth_token.do"))
                .and(body_string_contains("refresh_token=rotated"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "token-2",
                    "expires_in": 1800,
                })))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer token-1"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer token-2"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let client = broker(&clock)
                .client(oauth_config(&server).with_refresh_token("original"))
                .await
                .unwrap();

            client.get("/api/now/table/incident", &[]).await.unwrap();
        }
    }

    mod when_clearing_credentials {
        use super::*;

        #[tokio::test]
        async fn next_client_resolves_again() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 2).await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);
            let client = broker.client(oauth_config(&server)).await.unwrap();

            broker.clear_credentials(client.identity());
            assert!(broker.cache().get(client.identity()).is_none());

            broker.client(oauth_config(&server)).await.unwrap();
        }

        #[tokio::test]
        async fn refresh_in_flight_does_not_restore_cleared_credentials() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/oauth_token.do"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_delay(Duration::from_millis(200))
                        .set_body_json(json!({ "access_token": "token-1", "expires_in": 1800 })),
                )
                .expect(1)
                .mount(&server)
                .await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);
            let identity = BackendIdentity::from_url(&server.uri()).unwrap();

            let refresh = tokio::spawn({
                let broker = broker.clone();
                let config = oauth_config(&server);
                async move { broker.token(config).await }
            });
            while !broker.inner.coordinator.is_refreshing(&identity) {
                tokio::task::yield_now().await;
            }

            broker.clear_credentials(&identity);
            refresh.await.unwrap().unwrap();

            assert!(broker.cache().get(&identity).is_none());
        }

        #[tokio::test]
        async fn clear_all_empties_the_cache() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, "token-1", 1).await;

            let clock = TestClock::new(NOW);
            let broker = broker(&clock);
            let token = broker.token(oauth_config(&server)).await.unwrap();
            assert_eq!(token.as_str(), "token-1");

            broker.clear_all();
            let identity = BackendIdentity::from_url(&server.uri()).unwrap();
            assert!(!broker.cache().is_valid(&identity));
        }
    }
}
