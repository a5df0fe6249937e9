//! Credential inputs and tuning options

use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use nowauth_clock::UnixTime;

use crate::{AccessToken, ClientId, ClientSecret, Password, RefreshToken, Username};

const PLACEHOLDER_MARKERS: &[&str] = &["your-", "your_"];

/// Whether `value` is empty or an obvious placeholder such as `your-client-id`
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }

    let lower = trimmed.to_ascii_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// An access token obtained out-of-band, for example by an interactive login
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreloadedToken {
    /// The access token, or a complete `Basic ...` authorization value
    pub access_token: AccessToken,
    /// A refresh token issued alongside the access token
    pub refresh_token: Option<RefreshToken>,
    /// When the access token expires, if known
    pub expires_at: Option<UnixTime>,
}

impl PreloadedToken {
    /// Constructs a preloaded token with no refresh token or declared expiry
    pub fn new(access_token: impl Into<AccessToken>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Sets the declared expiry
    pub fn expiring_at(mut self, expires_at: UnixTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the refresh token
    pub fn with_refresh_token(mut self, refresh_token: impl Into<RefreshToken>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

/// The credential inputs for one backend
///
/// These are read once per resolution attempt and are never cached beyond the
/// process. Placeholder values are tolerated here and treated as absent by
/// the resolver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialConfig {
    /// The backend's base URL
    pub backend_url: String,
    /// The OAuth client ID
    pub client_id: Option<ClientId>,
    /// The OAuth client secret
    pub client_secret: Option<ClientSecret>,
    /// A long-lived refresh token
    pub refresh_token: Option<RefreshToken>,
    /// A username for basic authentication
    pub username: Option<Username>,
    /// A password for basic authentication
    pub password: Option<Password>,
    /// An access token supplied by an upstream login flow
    pub preloaded: Option<PreloadedToken>,
}

/// Environment variable naming the backend's base URL
pub const ENV_INSTANCE_URL: &str = "SERVICENOW_INSTANCE_URL";
/// Environment variable naming the OAuth client ID
pub const ENV_CLIENT_ID: &str = "SERVICENOW_CLIENT_ID";
/// Environment variable naming the OAuth client secret
pub const ENV_CLIENT_SECRET: &str = "SERVICENOW_CLIENT_SECRET";
/// Environment variable naming the OAuth refresh token
pub const ENV_REFRESH_TOKEN: &str = "SERVICENOW_REFRESH_TOKEN";
/// Environment variable naming the basic-auth username
pub const ENV_USERNAME: &str = "SERVICENOW_USERNAME";
/// Environment variable naming the basic-auth password
pub const ENV_PASSWORD: &str = "SERVICENOW_PASSWORD";
/// Environment variable naming a preloaded access token
pub const ENV_ACCESS_TOKEN: &str = "SERVICENOW_ACCESS_TOKEN";
/// Environment variable naming the preloaded token's expiry, in Unix milliseconds
pub const ENV_TOKEN_EXPIRES_AT: &str = "SERVICENOW_TOKEN_EXPIRES_AT";

impl CredentialConfig {
    /// Constructs an empty configuration for the backend at `backend_url`
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Self::default()
        }
    }

    /// Sets the OAuth client credentials
    pub fn with_client_credentials(
        mut self,
        client_id: impl Into<ClientId>,
        client_secret: impl Into<ClientSecret>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Sets the refresh token
    pub fn with_refresh_token(mut self, refresh_token: impl Into<RefreshToken>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets the basic-auth credentials
    pub fn with_basic_auth(
        mut self,
        username: impl Into<Username>,
        password: impl Into<Password>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets a preloaded access token
    pub fn with_preloaded(mut self, preloaded: PreloadedToken) -> Self {
        self.preloaded = Some(preloaded);
        self
    }

    /// Reads the whole configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the whole configuration using `lookup` to resolve variable names
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let preloaded = lookup(ENV_ACCESS_TOKEN).map(|token| PreloadedToken {
            access_token: AccessToken::new(token),
            refresh_token: None,
            expires_at: lookup(ENV_TOKEN_EXPIRES_AT)
                .and_then(|raw| raw.trim().parse().ok())
                .map(UnixTime),
        });

        Self {
            backend_url: lookup(ENV_INSTANCE_URL).unwrap_or_default(),
            client_id: lookup(ENV_CLIENT_ID).map(ClientId::new),
            client_secret: lookup(ENV_CLIENT_SECRET).map(ClientSecret::new),
            refresh_token: lookup(ENV_REFRESH_TOKEN).map(RefreshToken::new),
            username: lookup(ENV_USERNAME).map(Username::new),
            password: lookup(ENV_PASSWORD).map(Password::new),
            preloaded,
        }
    }

    /// Fills in a missing username or password from the process environment
    pub fn with_env_fallback(self) -> Self {
        self.with_fallback_lookup(|key| std::env::var(key).ok())
    }

    /// Fills in a missing username or password using `lookup`
    pub fn with_fallback_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let usable = |v: &Option<String>| v.as_deref().map_or(false, |v| !is_placeholder(v));

        if self.username.as_ref().map_or(true, |u| is_placeholder(u.as_str())) {
            let candidate = lookup(ENV_USERNAME);
            if usable(&candidate) {
                self.username = candidate.map(Username::new);
            }
        }

        if self.password.as_ref().map_or(true, |p| is_placeholder(p.as_str())) {
            let candidate = lookup(ENV_PASSWORD);
            if usable(&candidate) {
                self.password = candidate.map(Password::new);
            }
        }

        self
    }
}

/// The mutable credential state backing one backend's client
///
/// Clones share the same state. Once a preloaded token has been cleared, for
/// example after the backend rejected it, that same token is never
/// reinstated by [`CredentialContext::update`]. Refresh tokens that arrived
/// with a discarded access token are retained and offered to the next
/// resolution ahead of the configured one.
#[derive(Clone, Debug, Default)]
pub struct CredentialContext {
    inner: Arc<Mutex<ContextState>>,
}

#[derive(Debug, Default)]
struct ContextState {
    config: CredentialConfig,
    rejected_preloaded: Option<AccessToken>,
    retained_refresh: Option<RefreshToken>,
}

impl CredentialContext {
    /// Constructs a context holding `config`
    pub fn new(config: CredentialConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextState {
                config,
                ..ContextState::default()
            })),
        }
    }

    /// A copy of the current configuration
    ///
    /// A retained refresh token takes the place of the configured one.
    pub fn snapshot(&self) -> CredentialConfig {
        let state = self.lock();
        let mut config = state.config.clone();
        if let Some(refresh_token) = &state.retained_refresh {
            config.refresh_token = Some(refresh_token.clone());
        }
        config
    }

    /// Discards the preloaded access token, if any, so that it is never selected again
    ///
    /// A refresh token supplied with it is retained.
    pub fn clear_preloaded(&self) {
        let mut state = self.lock();
        if let Some(preloaded) = state.config.preloaded.take() {
            tracing::debug!("discarding preloaded access token");
            state.rejected_preloaded = Some(preloaded.access_token);
            if let Some(refresh_token) = preloaded.refresh_token {
                state.retained_refresh = Some(refresh_token);
            }
        }
    }

    /// Keeps `refresh_token` for later resolutions
    ///
    /// Used when a cached record is evicted so its refresh token is not lost
    /// along with the rejected access token.
    pub fn retain_refresh_token(&self, refresh_token: RefreshToken) {
        self.lock().retained_refresh = Some(refresh_token);
    }

    /// Replaces the configuration, dropping a preloaded token that was previously cleared
    ///
    /// A newly configured refresh token supersedes any retained one.
    pub fn update(&self, mut config: CredentialConfig) {
        let mut state = self.lock();
        if config.refresh_token != state.config.refresh_token {
            state.retained_refresh = None;
        }
        let stale = matches!(
            (&config.preloaded, &state.rejected_preloaded),
            (Some(preloaded), Some(rejected)) if preloaded.access_token == *rejected
        );
        if stale {
            config.preloaded = None;
        }
        state.config = config;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Where a resolver looks for basic-auth credentials that the configuration lacks
///
/// The default reads [`ENV_USERNAME`] and [`ENV_PASSWORD`] from the process
/// environment.
#[derive(Clone)]
pub struct CredentialFallback(Option<Lookup>);

impl CredentialFallback {
    /// Reads the process environment
    pub fn environment() -> Self {
        Self::lookup(|key| std::env::var(key).ok())
    }

    /// Resolves variable names with `lookup`
    pub fn lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self(Some(Arc::new(lookup)))
    }

    /// Never fills in anything
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Fills in a missing or placeholder username and password in `config`
    pub fn apply(&self, config: CredentialConfig) -> CredentialConfig {
        match &self.0 {
            Some(lookup) => config.with_fallback_lookup(|key| lookup(key)),
            None => config,
        }
    }
}

impl Default for CredentialFallback {
    fn default() -> Self {
        Self::environment()
    }
}

impl fmt::Debug for CredentialFallback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self.0 {
            Some(_) => "CredentialFallback(Lookup)",
            None => "CredentialFallback(Disabled)",
        })
    }
}

/// Options controlling how credentials are resolved
#[derive(Clone, Debug)]
pub struct ResolverOptions {
    /// Timeout applied to token endpoint and probe requests
    pub token_timeout: Duration,
    /// Tokens are treated as expired this long before their declared expiry
    pub validity_buffer: Duration,
    /// Lifetime assumed for a preloaded token without a declared expiry
    pub preloaded_lifetime: Duration,
    /// Lifetime assigned to verified basic-auth credentials
    pub basic_lifetime: Duration,
    /// Path and query of the read-only probe used to verify basic-auth credentials
    pub probe_path: String,
    /// Source of basic-auth credentials missing from the configuration
    pub credential_fallback: CredentialFallback,
}

impl Default for ResolverOptions {
    /// Uses a 10 second token timeout, a 60 second validity buffer, a 1 hour
    /// preloaded token lifetime, and a 24 hour basic-auth lifetime. Missing
    /// basic-auth credentials are read from the process environment.
    fn default() -> Self {
        Self {
            token_timeout: Duration::from_secs(10),
            validity_buffer: Duration::from_secs(60),
            preloaded_lifetime: Duration::from_secs(60 * 60),
            basic_lifetime: Duration::from_secs(24 * 60 * 60),
            probe_path: "/api/now/table/sys_user?sysparm_limit=1".into(),
            credential_fallback: CredentialFallback::default(),
        }
    }
}

/// Options for a whole broker
#[derive(Clone, Debug)]
pub struct BrokerOptions {
    /// Timeout applied to outbound API calls
    pub api_timeout: Duration,
    /// Credential resolution options
    pub resolver: ResolverOptions,
    /// Where the token cache is persisted; `None` uses the per-user default
    pub cache_file: Option<PathBuf>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            api_timeout: Duration::from_secs(60),
            resolver: ResolverOptions::default(),
            cache_file: None,
        }
    }
}

#[cfg(feature = "file")]
impl BrokerOptions {
    /// The cache file location, falling back to `<config dir>/nowauth/tokens.json`
    pub fn cache_file_path(&self) -> Option<PathBuf> {
        self.cache_file.clone().or_else(|| {
            directories::BaseDirs::new()
                .map(|dirs| dirs.config_dir().join("nowauth").join("tokens.json"))
        })
    }
}
