use std::{fmt, sync::Arc};

use thiserror::Error;

/// A failure surfaced by the broker to its callers
///
/// The error is cheaply cloneable so that a single refresh outcome can be
/// handed to every caller that was waiting on it.
#[derive(Clone, Debug, Error)]
pub enum BrokerError {
    /// No usable credential inputs were configured, or the backend URL is invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every applicable strategy failed, or a retried request was rejected again
    #[error("authentication failed: {message}{}", TriedList(.tried))]
    Authentication {
        /// A description of the final failure
        message: String,
        /// The strategies that were attempted, in order
        tried: Vec<StrategyKind>,
    },

    /// The backend refused the request (HTTP 403)
    #[error("permission denied: {0}")]
    Permission(String),

    /// The backend reported an error of its own
    #[error("{}", UpstreamMessage::new(.status, .message, .detail))]
    Upstream {
        /// The HTTP status, if one was received
        status: Option<u16>,
        /// The backend's error message
        message: String,
        /// Additional detail supplied by the backend
        detail: Option<String>,
    },

    /// The request could not be delivered
    #[error("network error: {0}")]
    Network(#[source] Arc<reqwest::Error>),
}

impl BrokerError {
    /// Constructs an authentication error with no recorded strategies
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            tried: Vec::new(),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(Arc::new(err))
    }
}

/// One of the closed set of authentication strategies, in precedence order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// An access token supplied out-of-band
    PreloadedToken,
    /// An OAuth `refresh_token` grant
    RefreshTokenGrant,
    /// An OAuth `client_credentials` grant
    ClientCredentialsGrant,
    /// HTTP basic authentication verified against a probe endpoint
    BasicAuth,
}

impl StrategyKind {
    /// A short human-readable name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreloadedToken => "preloaded token",
            Self::RefreshTokenGrant => "refresh token grant",
            Self::ClientCredentialsGrant => "client credentials grant",
            Self::BasicAuth => "basic auth",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TriedList<'a>(&'a [StrategyKind]);

impl fmt::Display for TriedList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.0.iter();
        if let Some(first) = iter.next() {
            write!(f, " (tried: {first}")?;
            for kind in iter {
                write!(f, ", {kind}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

struct UpstreamMessage<'a> {
    status: Option<u16>,
    message: &'a str,
    detail: Option<&'a str>,
}

impl<'a> UpstreamMessage<'a> {
    fn new(status: &Option<u16>, message: &'a str, detail: &'a Option<String>) -> Self {
        Self {
            status: *status,
            message,
            detail: detail.as_deref(),
        }
    }
}

impl fmt::Display for UpstreamMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "backend error ({status}): {}", self.message)?,
            None => write!(f, "backend error: {}", self.message)?,
        }
        if let Some(detail) = self.detail.filter(|d| !d.is_empty()) {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}
