//! Authorization header injection with a single refresh-and-retry on 401

use std::fmt;

use bytes::{BufMut, BytesMut};
use nowauth_tokens::{
    AccessToken, AccessTokenRef, BackendIdentity, BrokerError, CredentialContext,
    RefreshCoordinator,
};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode, Url};
use reqwest_middleware::{Middleware, Next, Result};

/// The number of times a request is sent before a 401 is surfaced as an error
const MAX_ATTEMPTS: u32 = 2;

/// Everything a client needs to obtain and discard tokens for one backend
#[derive(Clone, Debug)]
pub struct AuthSession {
    identity: BackendIdentity,
    base_url: Url,
    coordinator: RefreshCoordinator,
    context: CredentialContext,
}

impl AuthSession {
    /// Constructs a session for the backend at `base_url`
    pub fn new(
        identity: BackendIdentity,
        base_url: Url,
        coordinator: RefreshCoordinator,
        context: CredentialContext,
    ) -> Self {
        Self {
            identity,
            base_url,
            coordinator,
            context,
        }
    }

    /// The backend this session authenticates against
    pub fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    /// The credential state shared with the broker
    pub fn context(&self) -> &CredentialContext {
        &self.context
    }

    /// Gets a valid token, resolving a new one if needed
    pub async fn token(&self) -> std::result::Result<AccessToken, BrokerError> {
        self.coordinator
            .get_token(&self.identity, &self.context.snapshot())
            .await
    }

    /// Discards `rejected` so that the next call to [`token()`][Self::token()]
    /// resolves fresh credentials
    ///
    /// The cached record is only invalidated if it still holds the rejected
    /// token; a concurrent request may already have replaced it. Refresh
    /// tokens are kept for the next resolution.
    pub fn reject(&self, rejected: &AccessTokenRef) {
        let cache = self.coordinator.cache();
        let still_cached = cache
            .get(&self.identity)
            .map_or(false, |record| record.access_token().as_str() == rejected.as_str());

        self.context.clear_preloaded();
        if still_cached {
            let refresh_token = cache
                .invalidate(&self.identity)
                .and_then(|record| record.refresh_token().map(|rt| rt.to_owned()));
            if let Some(refresh_token) = refresh_token {
                self.context.retain_refresh_token(refresh_token);
            }
        }
    }
}

/// A middleware that injects backend credentials into outgoing requests
///
/// A request answered with `401 Unauthorized` has its token discarded and is
/// sent once more with freshly resolved credentials. A second 401 is surfaced
/// as [`BrokerError::Authentication`].
///
/// If a request already carries an `Authorization` header by the time the
/// middleware executes, the existing value is left in place and the request
/// is never retried.
#[derive(Clone, Debug)]
pub struct AuthorizationMiddleware<P> {
    session: AuthSession,
    predicate: P,
}

impl AuthorizationMiddleware<BackendHostMatch> {
    /// Constructs a new middleware from a session
    ///
    /// By default, credentials are only attached to requests sent to the
    /// session's backend host and port. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(session: AuthSession) -> Self {
        let predicate = BackendHostMatch::for_url(&session.base_url);
        Self { session, predicate }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AuthorizationMiddleware<P> {
        AuthorizationMiddleware {
            session: self.session,
            predicate,
        }
    }
}

impl<P> AuthorizationMiddleware<P> {
    async fn authorization(&self) -> Result<(AccessToken, header::HeaderValue)> {
        let token = self.session.token().await.map_err(middleware_error)?;
        let value = authorization_value(&token).map_err(middleware_error)?;
        Ok((token, value))
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AuthorizationMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let mut attempt = 1;
        loop {
            let replay = (attempt < MAX_ATTEMPTS).then(|| req.try_clone()).flatten();

            let (token, value) = self.authorization().await?;
            req.headers_mut().insert(header::AUTHORIZATION, value);

            let resp = next.clone().run(req, extensions).await?;
            if resp.status() != StatusCode::UNAUTHORIZED {
                return Ok(resp);
            }

            if attempt >= MAX_ATTEMPTS {
                tracing::warn!(
                    backend = %self.session.identity,
                    attempt,
                    "refreshed credentials were rejected"
                );
                return Err(middleware_error(BrokerError::authentication(format!(
                    "{} rejected the refreshed credentials",
                    self.session.identity
                ))));
            }

            let Some(replay) = replay else {
                tracing::warn!(
                    backend = %self.session.identity,
                    "request body cannot be replayed; not retrying"
                );
                return Ok(resp);
            };

            tracing::info!(
                backend = %self.session.identity,
                attempt,
                "credentials rejected, refreshing and retrying"
            );
            self.session.reject(&token);
            req = replay;
            attempt += 1;
        }
    }
}

/// Builds an `Authorization` header value for `token`
///
/// Values that already carry a `Basic` or `Bearer` scheme are sent as-is;
/// anything else is sent as a bearer token.
pub fn authorization_value(
    token: &AccessTokenRef,
) -> std::result::Result<header::HeaderValue, BrokerError> {
    let raw = token.as_str();
    let has_scheme = ["Basic ", "Bearer "].iter().any(|scheme| {
        raw.get(..scheme.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(scheme))
    });

    let mut header_value = BytesMut::with_capacity(raw.len() + 7);
    if !has_scheme {
        header_value.put_slice(b"Bearer ");
    }
    header_value.put_slice(raw.as_bytes());

    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())
        .map_err(|_| BrokerError::authentication("access token is not a valid header value"))?;
    value.set_sensitive(true);
    Ok(value)
}

fn middleware_error(err: BrokerError) -> reqwest_middleware::Error {
    reqwest_middleware::Error::Middleware(anyhow::Error::new(err))
}

/// Only attach credentials if the request is being sent to the backend's host and port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendHostMatch {
    host: String,
    port: Option<u16>,
}

impl BackendHostMatch {
    /// Construct a new predicate matching the host and port of `url`
    pub fn for_url(url: &Url) -> Self {
        Self {
            host: url.host_str().unwrap_or_default().to_ascii_lowercase(),
            port: url.port_or_known_default(),
        }
    }
}

impl Predicate<Request> for BackendHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host) && req.url().port_or_known_default() == self.port
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result)
                    .add_product(reflection::Product::new(
                        "host",
                        req.url().host_str().unwrap_or("<none>").to_owned(),
                    ))
                    .add_product(reflection::Product::new(
                        "port",
                        req.url()
                            .port_or_known_default()
                            .map_or_else(|| "<none>".to_owned(), |p| p.to_string()),
                    )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for BackendHostMatch {}
impl fmt::Display for BackendHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nowauth_tokens::{
        store::InMemoryTokenStore, CredentialConfig, CredentialResolver, PreloadedToken,
        ResolverOptions, TokenCache,
    };
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;
    use wiremock::{
        matchers::{header as header_eq, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";

    fn session_for(base: &str, config: CredentialConfig) -> AuthSession {
        let cache = TokenCache::new(Arc::new(InMemoryTokenStore::new()));
        let resolver = CredentialResolver::new(ResolverOptions::default()).unwrap();
        AuthSession::new(
            BackendIdentity::from_url(base).unwrap(),
            nowauth_tokens::identity::base_url(base).unwrap(),
            RefreshCoordinator::new(cache, resolver),
            CredentialContext::new(config),
        )
    }

    fn preloaded_session(base: &str) -> AuthSession {
        session_for(
            base,
            CredentialConfig::new(base).with_preloaded(PreloadedToken::new(TEST_TOKEN)),
        )
    }

    fn without_authorization(req: &wiremock::Request) -> bool {
        !req.headers.contains_key("authorization")
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_attaches_token_for_backend_requests() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", BEARER_TEST_TOKEN))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let client = ClientBuilder::new(Client::default())
                .with(AuthorizationMiddleware::new(preloaded_session(&server.uri())))
                .build();

            let resp = client
                .get(format!("{}/api/now/table/incident", server.uri()))
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
        }

        #[tokio::test]
        async fn middleware_does_not_attach_token_for_other_hosts() {
            let backend = MockServer::start().await;
            let elsewhere = MockServer::start().await;
            Mock::given(method("GET"))
                .and(without_authorization)
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&elsewhere)
                .await;

            let client = ClientBuilder::new(Client::default())
                .with(AuthorizationMiddleware::new(preloaded_session(&backend.uri())))
                .build();

            let resp = client.get(elsewhere.uri()).send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_token() {
                let server = MockServer::start().await;
                Mock::given(method("GET"))
                    .and(without_authorization)
                    .respond_with(ResponseTemplate::new(200))
                    .expect(1)
                    .mount(&server)
                    .await;

                let middleware = AuthorizationMiddleware::new(preloaded_session(&server.uri()))
                    .with_predicate(predicate::never());
                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .build();

                let resp = client.get(server.uri()).send().await.unwrap();

                assert_eq!(resp.status(), StatusCode::OK);
            }
        }

        mod and_token_is_a_basic_authorization {
            use super::*;

            #[tokio::test]
            async fn middleware_sends_it_verbatim() {
                let server = MockServer::start().await;
                Mock::given(method("GET"))
                    .and(header_eq("authorization", "Basic YWRtaW46cHc="))
                    .respond_with(ResponseTemplate::new(200))
                    .expect(1)
                    .mount(&server)
                    .await;

                let session = session_for(
                    &server.uri(),
                    CredentialConfig::new(server.uri())
                        .with_preloaded(PreloadedToken::new("Basic YWRtaW46cHc=")),
                );
                let client = ClientBuilder::new(Client::default())
                    .with(AuthorizationMiddleware::new(session))
                    .build();

                let resp = client.get(server.uri()).send().await.unwrap();

                assert_eq!(resp.status(), StatusCode::OK);
            }
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_neither_replaces_nor_retries() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer overridden!"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;

            let client = ClientBuilder::new(Client::default())
                .with(AuthorizationMiddleware::new(preloaded_session(&server.uri())))
                .build();

            let resp = client
                .get(server.uri())
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
    }

    mod when_backend_rejects_the_token {
        use super::*;

        async fn mount_token_endpoint(server: &MockServer, calls: u64) {
            Mock::given(method("POST"))
                .and(path("/oauth_token.do"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "fresh-token",
                    "expires_in": 1800,
                })))
                .expect(calls)
                .mount(server)
                .await;
        }

        fn stale_then_oauth(base: &str) -> AuthSession {
            session_for(
                base,
                CredentialConfig::new(base)
                    .with_preloaded(PreloadedToken::new("stale-token"))
                    .with_client_credentials("id", "secret"),
            )
        }

        #[tokio::test]
        async fn request_is_retried_once_with_fresh_credentials() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, 1).await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer stale-token"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header_eq("authorization", "Bearer fresh-token"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let session = stale_then_oauth(&server.uri());
            let client = ClientBuilder::new(Client::default())
                .with(AuthorizationMiddleware::new(session.clone()))
                .build();

            let resp = client.get(server.uri()).send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert!(session.context().snapshot().preloaded.is_none());
        }

        #[tokio::test]
        async fn second_rejection_is_an_authentication_error() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, 1).await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(401))
                .expect(2)
                .mount(&server)
                .await;

            let client = ClientBuilder::new(Client::default())
                .with(AuthorizationMiddleware::new(stale_then_oauth(&server.uri())))
                .build();

            let err = client.get(server.uri()).send().await.unwrap_err();

            let err = match err {
                reqwest_middleware::Error::Middleware(err) => err,
                other => panic!("expected a middleware error, got {other:?}"),
            };
            assert!(matches!(
                err.downcast_ref::<BrokerError>(),
                Some(BrokerError::Authentication { .. })
            ));
        }

        #[tokio::test]
        async fn forbidden_is_not_retried() {
            let server = MockServer::start().await;
            mount_token_endpoint(&server, 0).await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(403))
                .expect(1)
                .mount(&server)
                .await;

            let client = ClientBuilder::new(Client::default())
                .with(AuthorizationMiddleware::new(stale_then_oauth(&server.uri())))
                .build();

            let resp = client.get(server.uri()).send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        }
    }

    mod authorization_value {
        use super::*;

        #[test]
        fn bare_tokens_become_bearer_tokens() {
            let value = authorization_value(&AccessToken::new(TEST_TOKEN.to_owned())).unwrap();
            assert_eq!(value.to_str().unwrap(), BEARER_TEST_TOKEN);
            assert!(value.is_sensitive());
        }

        #[test]
        fn existing_schemes_are_kept() {
            for raw in ["Basic YWRtaW46cHc=", "Bearer abc", "bearer abc"] {
                let value = authorization_value(&AccessToken::new(raw.to_owned())).unwrap();
                assert_eq!(value.to_str().unwrap(), raw);
            }
        }

        #[test]
        fn tokens_with_newlines_are_rejected() {
            let err = authorization_value(&AccessToken::new("abc\ndef".to_owned())).unwrap_err();
            assert!(matches!(err, BrokerError::Authentication { .. }));
        }
    }

    mod backend_host_match_predicate {
        use super::*;

        fn predicate() -> BackendHostMatch {
            BackendHostMatch::for_url(&"https://Dev1.service-now.com".parse().unwrap())
        }

        #[test]
        fn matches_when_request_has_same_host_and_port() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://dev1.service-now.com:443/api/now/table/incident"
                    .parse()
                    .unwrap(),
            );
            let predicate = predicate();
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://does-not-match.com".parse().unwrap(),
            );
            let predicate = predicate();
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_port() {
            let request = Request::new(
                reqwest::Method::GET,
                "http://dev1.service-now.com".parse().unwrap(),
            );
            let predicate = predicate();
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }

        #[test]
        fn displays_host_and_port() {
            assert_eq!(predicate().to_string(), "host == dev1.service-now.com:443");
        }
    }
}
