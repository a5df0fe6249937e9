//! Authenticated `reqwest` clients for ServiceNow-style REST backends
//!
//! A [`SessionBroker`] hands out one [`InstanceClient`] per backend. Each
//! client runs its requests through an [`AuthorizationMiddleware`], which
//! attaches the backend's current token as an `Authorization` header and, on a
//! `401 Unauthorized`, discards that token and retries the request exactly once
//! with freshly resolved credentials. Response bodies are normalized to the
//! `{"result": ...}` shape, and failures are surfaced as
//! [`BrokerError`](nowauth_tokens::BrokerError)s.
//!
//! ```
//! use nowauth_reqwest::SessionBroker;
//! use nowauth_tokens::{BrokerOptions, CredentialConfig, TokenCache};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), nowauth_tokens::BrokerError> {
//! let broker = SessionBroker::new(TokenCache::in_memory(), BrokerOptions::default())?;
//!
//! let config = CredentialConfig::new("https://dev12345.service-now.com")
//!     .with_client_credentials("client-id", "client-secret");
//! # let _ = (broker, config); /* Commented out due to this trying to interact with the world.
//! let client = broker.client(config).await?;
//! let incidents = client
//!     .get("/api/now/table/incident", &[("sysparm_limit", "10")])
//!     .await?;
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! The middleware can also be used on its own with any
//! [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware). By
//! default it only attaches credentials to requests sent to the backend's own
//! host and port; a different predicate can be supplied, and predicates can be
//! composed together.
//!
//! ```
//! use std::sync::Arc;
//!
//! use nowauth_reqwest::{AuthSession, AuthorizationMiddleware};
//! use nowauth_tokens::{
//!     identity, BackendIdentity, CredentialConfig, CredentialContext, CredentialResolver,
//!     RefreshCoordinator, ResolverOptions, TokenCache,
//! };
//! use predicates::prelude::*;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # fn main() -> Result<(), nowauth_tokens::BrokerError> {
//! let url = "https://dev12345.service-now.com";
//! let coordinator = RefreshCoordinator::new(
//!     TokenCache::in_memory(),
//!     CredentialResolver::new(ResolverOptions::default())?,
//! );
//! let session = AuthSession::new(
//!     BackendIdentity::from_url(url)?,
//!     identity::base_url(url)?,
//!     coordinator,
//!     CredentialContext::new(CredentialConfig::new(url).with_basic_auth("admin", "secret")),
//! );
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(
//!         AuthorizationMiddleware::new(session)
//!             .with_predicate(predicate::function(|req: &reqwest::Request| {
//!                 req.url().scheme() == "https"
//!             })),
//!     )
//!     .build();
//! # let _ = client;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod broker;
mod client;
mod middleware;
pub mod response;

pub use broker::SessionBroker;
pub use client::InstanceClient;
pub use middleware::{authorization_value, AuthSession, AuthorizationMiddleware, BackendHostMatch};
