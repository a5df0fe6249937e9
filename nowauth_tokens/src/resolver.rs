//! Selection and execution of authentication strategies
//!
//! Resolution walks a fixed, ordered list of strategies. Each strategy has a
//! predicate, [`ResolutionInputs::select`], that extracts its [`Credentials`]
//! when the required inputs are present, and an executor that exchanges those
//! credentials for a [`TokenRecord`]. The first success wins; a failure is
//! logged and the next applicable strategy is tried.

use std::{error, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use nowauth_clock::{SharedClock, System, UnixTime};
use reqwest::{header, Url};
use thiserror::Error;

use crate::{
    config::{is_placeholder, CredentialConfig, PreloadedToken, ResolverOptions},
    identity, AccessToken, BackendIdentity, BrokerError, ClientId, ClientSecret, Password,
    RefreshToken, StrategyKind, TokenRecord, Username,
};

pub mod oauth2;

use oauth2::{
    dto::{ClientCredentialsGrant, RefreshTokenGrant},
    TokenRequestError,
};

/// Strategies in precedence order
pub const STRATEGY_ORDER: [StrategyKind; 4] = [
    StrategyKind::PreloadedToken,
    StrategyKind::RefreshTokenGrant,
    StrategyKind::ClientCredentialsGrant,
    StrategyKind::BasicAuth,
];

/// The credentials consumed by exactly one strategy
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// A token supplied out-of-band
    PreloadedToken(PreloadedToken),
    /// An OAuth refresh token grant
    RefreshTokenGrant(RefreshTokenGrant),
    /// An OAuth client credentials grant
    ClientCredentialsGrant(ClientCredentialsGrant),
    /// A username and password
    BasicAuth {
        /// The username
        username: Username,
        /// The password
        password: Password,
    },
}

impl Credentials {
    /// The strategy these credentials belong to
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::PreloadedToken(_) => StrategyKind::PreloadedToken,
            Self::RefreshTokenGrant(_) => StrategyKind::RefreshTokenGrant,
            Self::ClientCredentialsGrant(_) => StrategyKind::ClientCredentialsGrant,
            Self::BasicAuth { .. } => StrategyKind::BasicAuth,
        }
    }
}

/// The usable credential inputs for one resolution attempt
///
/// Placeholder values have already been discarded.
#[derive(Clone, Debug, Default)]
pub struct ResolutionInputs {
    preloaded: Option<PreloadedToken>,
    client: Option<(ClientId, ClientSecret)>,
    refresh_token: Option<RefreshToken>,
    basic: Option<(Username, Password)>,
}

impl ResolutionInputs {
    /// Gathers inputs from `config` and from the previously cached record
    ///
    /// A refresh token from the cached record is preferred over one supplied
    /// with a preloaded token, which is preferred over the configured one.
    pub fn gather(config: &CredentialConfig, cached: Option<&TokenRecord>) -> Self {
        let preloaded = config
            .preloaded
            .clone()
            .filter(|p| !is_placeholder(p.access_token.as_str()));

        let client = match (
            config.client_id.as_ref().filter(|v| !is_placeholder(v.as_str())),
            config.client_secret.as_ref().filter(|v| !is_placeholder(v.as_str())),
        ) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            _ => None,
        };

        let refresh_token = cached
            .and_then(|record| record.refresh_token())
            .map(|rt| rt.to_owned())
            .or_else(|| preloaded.as_ref().and_then(|p| p.refresh_token.clone()))
            .or_else(|| config.refresh_token.clone())
            .filter(|rt| !is_placeholder(rt.as_str()));

        let basic = match (
            config.username.as_ref().filter(|v| !is_placeholder(v.as_str())),
            config.password.as_ref().filter(|v| !is_placeholder(v.as_str())),
        ) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Self {
            preloaded,
            client,
            refresh_token,
            basic,
        }
    }

    /// Whether no strategy could possibly apply
    pub fn is_empty(&self) -> bool {
        self.preloaded.is_none() && self.client.is_none() && self.basic.is_none()
    }

    /// Extracts the credentials for `kind`, if its required inputs are present
    pub fn select(&self, kind: StrategyKind) -> Option<Credentials> {
        match kind {
            StrategyKind::PreloadedToken => {
                self.preloaded.clone().map(Credentials::PreloadedToken)
            }
            StrategyKind::RefreshTokenGrant => {
                let (client_id, client_secret) = self.client.clone()?;
                let refresh_token = self.refresh_token.clone()?;
                Some(Credentials::RefreshTokenGrant(RefreshTokenGrant {
                    client_id,
                    client_secret,
                    refresh_token,
                }))
            }
            StrategyKind::ClientCredentialsGrant => {
                let (client_id, client_secret) = self.client.clone()?;
                Some(Credentials::ClientCredentialsGrant(ClientCredentialsGrant {
                    client_id,
                    client_secret,
                }))
            }
            StrategyKind::BasicAuth => {
                let (username, password) = self.basic.clone()?;
                Some(Credentials::BasicAuth { username, password })
            }
        }
    }

    /// Drops the preloaded token so no later step can select it
    pub fn discard_preloaded(&mut self) {
        self.preloaded = None;
    }
}

/// The reason a single strategy failed
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The preloaded token is expired or about to expire
    #[error("preloaded token expired at {expires_at}")]
    PreloadedExpired {
        /// The declared expiry
        expires_at: UnixTime,
    },
    /// The token endpoint request failed
    #[error(transparent)]
    TokenRequest(#[from] TokenRequestError),
    /// The probe endpoint rejected the basic-auth credentials
    #[error("credential probe was rejected with status {status}")]
    ProbeRejected {
        /// The probe's HTTP status
        status: u16,
    },
    /// The probe request could not be sent
    #[error("error sending credential probe")]
    ProbeSend(#[source] reqwest::Error),
}

impl StrategyError {
    fn into_transport(self) -> Result<reqwest::Error, Self> {
        match self {
            Self::TokenRequest(TokenRequestError::RequestSend(error)) | Self::ProbeSend(error) => {
                Ok(error)
            }
            other => Err(other),
        }
    }
}

/// Obtains fresh tokens for a backend from its credential configuration
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    client: reqwest::Client,
    options: ResolverOptions,
    clock: SharedClock,
}

impl CredentialResolver {
    /// Constructs a resolver with its own HTTP client
    pub fn new(options: ResolverOptions) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(options.token_timeout)
            .build()?;
        Ok(Self::with_client(client, options))
    }

    /// Constructs a resolver that sends its requests through `client`
    pub fn with_client(client: reqwest::Client, options: ResolverOptions) -> Self {
        Self {
            client,
            options,
            clock: Arc::new(System),
        }
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The options in use
    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolves a fresh token record for the backend named in `config`
    ///
    /// `cached` is the previous record for the backend, if any; its refresh
    /// token may be used for a refresh grant. A username or password missing
    /// from `config` is taken from [`ResolverOptions::credential_fallback`].
    #[tracing::instrument(skip_all, fields(backend = %config.backend_url))]
    pub async fn resolve(
        &self,
        config: &CredentialConfig,
        cached: Option<&TokenRecord>,
    ) -> Result<TokenRecord, BrokerError> {
        let backend = BackendIdentity::from_url(&config.backend_url)?;
        let base_url = identity::base_url(&config.backend_url)?;

        let config = self.options.credential_fallback.apply(config.clone());
        let mut inputs = ResolutionInputs::gather(&config, cached);
        if inputs.is_empty() {
            return Err(BrokerError::Configuration(format!(
                "no credentials configured for {backend}; set an OAuth client id and secret, \
                 a username and password, or supply an access token"
            )));
        }

        let mut tried = Vec::new();
        let mut last_failure = None;
        let mut last_transport = None;
        let mut transport_only = true;

        for kind in STRATEGY_ORDER {
            let Some(credentials) = inputs.select(kind) else {
                tracing::trace!(strategy = %kind, "strategy not applicable");
                continue;
            };

            tracing::debug!(strategy = %kind, "attempting strategy");
            tried.push(kind);

            match self.execute(&backend, &base_url, credentials).await {
                Ok(record) => {
                    tracing::info!(
                        strategy = %kind,
                        expires_at = record.expires_at().0,
                        has_refresh_token = record.refresh_token().is_some(),
                        "resolved credentials"
                    );
                    return Ok(record);
                }
                Err(error) => {
                    tracing::warn!(
                        strategy = %kind,
                        error = (&error as &dyn error::Error),
                        "strategy failed, trying next"
                    );
                    if kind == StrategyKind::PreloadedToken {
                        inputs.discard_preloaded();
                    }
                    last_failure = Some(error.to_string());
                    match error.into_transport() {
                        Ok(transport) => last_transport = Some(transport),
                        Err(_) => transport_only = false,
                    }
                }
            }
        }

        match last_transport {
            Some(transport) if transport_only => Err(transport.into()),
            _ => Err(BrokerError::Authentication {
                message: last_failure.unwrap_or_else(|| "no strategy succeeded".into()),
                tried,
            }),
        }
    }

    /// Exchanges one set of credentials for a token record
    pub async fn execute(
        &self,
        backend: &BackendIdentity,
        base_url: &Url,
        credentials: Credentials,
    ) -> Result<TokenRecord, StrategyError> {
        match credentials {
            Credentials::PreloadedToken(preloaded) => self.accept_preloaded(backend, preloaded),
            Credentials::RefreshTokenGrant(grant) => {
                let resp =
                    oauth2::request_token(&self.client, token_url(base_url), &grant).await?;
                let refresh_token = resp.refresh_token.or(Some(grant.refresh_token));
                Ok(self.oauth_record(backend, resp.access_token, refresh_token, resp.expires_in))
            }
            Credentials::ClientCredentialsGrant(grant) => {
                let resp =
                    oauth2::request_token(&self.client, token_url(base_url), &grant).await?;
                Ok(self.oauth_record(
                    backend,
                    resp.access_token,
                    resp.refresh_token,
                    resp.expires_in,
                ))
            }
            Credentials::BasicAuth { username, password } => {
                self.verify_basic(backend, base_url, &username, &password)
                    .await
            }
        }
    }

    fn accept_preloaded(
        &self,
        backend: &BackendIdentity,
        preloaded: PreloadedToken,
    ) -> Result<TokenRecord, StrategyError> {
        let now = self.clock.now();
        let expires_at = match preloaded.expires_at {
            Some(expires_at) if now + self.options.validity_buffer >= expires_at => {
                return Err(StrategyError::PreloadedExpired { expires_at });
            }
            Some(expires_at) => expires_at,
            None => now + self.options.preloaded_lifetime,
        };

        Ok(TokenRecord::new(
            backend.clone(),
            preloaded.access_token,
            preloaded.refresh_token,
            expires_at,
        ))
    }

    fn oauth_record(
        &self,
        backend: &BackendIdentity,
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
        expires_in: u64,
    ) -> TokenRecord {
        let lifetime = std::time::Duration::from_secs(expires_in);
        // Short-lived tokens keep at least half their lifetime.
        let buffer = self.options.validity_buffer.min(lifetime / 2);
        let expires_at = self.clock.now() + lifetime - buffer;
        TokenRecord::new(backend.clone(), access_token, refresh_token, expires_at)
    }

    #[tracing::instrument(skip_all, fields(username = %username))]
    async fn verify_basic(
        &self,
        backend: &BackendIdentity,
        base_url: &Url,
        username: &Username,
        password: &Password,
    ) -> Result<TokenRecord, StrategyError> {
        let value = basic_authorization(username, password);
        let probe_url = identity::endpoint(base_url, &self.options.probe_path);

        let resp = self
            .client
            .get(probe_url)
            .header(header::AUTHORIZATION, value.as_str())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(StrategyError::ProbeSend)?;

        let status = resp.status();
        tracing::debug!(response.status = status.as_u16(), "received probe response");
        if !status.is_success() {
            return Err(StrategyError::ProbeRejected {
                status: status.as_u16(),
            });
        }

        Ok(TokenRecord::new(
            backend.clone(),
            value,
            None,
            self.clock.now() + self.options.basic_lifetime,
        ))
    }
}

fn token_url(base_url: &Url) -> Url {
    identity::endpoint(base_url, "/oauth_token.do")
}

/// Builds a `Basic <base64(user:pass)>` authorization value
pub fn basic_authorization(username: &Username, password: &Password) -> AccessToken {
    let encoded = STANDARD.encode(format!("{}:{}", username.as_str(), password.as_str()));
    AccessToken::new(format!("Basic {encoded}"))
}
