//! Facilities for obtaining, caching, and refreshing credentials for a REST backend
//!
//! This library brokers the authentication material used to call a
//! ServiceNow-style REST backend. It picks among a closed set of
//! authentication strategies, caches the resulting token per backend, and makes
//! sure that no matter how many callers need a token at the same time, only one
//! resolution per backend is ever in flight.
//!
//! # Strategies
//!
//! Resolution tries the following in order, skipping any whose inputs are
//! absent or obvious placeholders, and returns the first success:
//!
//! 1. A preloaded access token supplied out-of-band, if not about to expire.
//! 2. An OAuth `refresh_token` grant against `{backend}/oauth_token.do`.
//! 3. An OAuth `client_credentials` grant against the same endpoint.
//! 4. HTTP basic authentication, verified against a cheap read-only probe.
//!
//! # General Flow
//!
//! On application start-up, restore the token cache from disk and wire it to a
//! resolver through a [`RefreshCoordinator`]. Tokens are then requested from the
//! coordinator whenever a call is about to be made.
//!
//! ```
//! use std::sync::Arc;
//!
//! use nowauth_tokens::{
//!     store::InMemoryTokenStore, CredentialConfig, CredentialResolver, RefreshCoordinator,
//!     ResolverOptions, TokenCache,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), nowauth_tokens::BrokerError> {
//! let cache = TokenCache::restore(
//!     Arc::new(InMemoryTokenStore::new()),
//!     Arc::new(nowauth_clock::System),
//! )
//! .await;
//! let resolver = CredentialResolver::new(ResolverOptions::default())?;
//! let coordinator = RefreshCoordinator::new(cache, resolver);
//!
//! let config = CredentialConfig::new("https://dev12345.service-now.com")
//!     .with_client_credentials("client-id", "client-secret");
//! let identity = nowauth_tokens::BackendIdentity::from_url(&config.backend_url)?;
//! # let _ = (coordinator, identity); /* Commented out due to this trying to interact with the world.
//! let token = coordinator.get_token(&identity, &config).await?;
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `file` (default): Provides [`store::FileTokenStore`], which persists the
//!   token cache as JSON in the per-user configuration directory.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod cache;
pub mod config;
pub mod coordinator;
mod error;
pub mod identity;
pub mod resolver;
pub mod store;
mod tokens;

pub use braids::*;
pub use cache::TokenCache;
pub use config::{
    BrokerOptions, CredentialConfig, CredentialContext, CredentialFallback, PreloadedToken,
    ResolverOptions,
};
pub use coordinator::RefreshCoordinator;
pub use error::{BrokerError, StrategyKind};
pub use identity::BackendIdentity;
pub use resolver::{CredentialResolver, Credentials};
pub use tokens::{TokenRecord, TokenStatus};
