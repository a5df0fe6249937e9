//! Backend identities
//!
//! Every cache in the broker is keyed by a [`BackendIdentity`]. This module is
//! the only place where a backend URL is turned into a key.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{config::is_placeholder, BrokerError};

/// A normalized key identifying a remote backend instance
///
/// Two URLs that differ only by protocol, letter case, or trailing slashes map
/// to the same identity.
///
/// ```
/// use nowauth_tokens::BackendIdentity;
///
/// let a = BackendIdentity::from_url("HTTPS://Foo.com/").unwrap();
/// let b = BackendIdentity::from_url("foo.com").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "foo.com");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendIdentity(String);

impl BackendIdentity {
    /// Derives the identity of the backend at `url`
    ///
    /// Fails with a configuration error if the URL is empty or is an obvious
    /// placeholder such as `https://your-instance.service-now.com`.
    pub fn from_url(url: &str) -> Result<Self, BrokerError> {
        if is_placeholder(url) {
            return Err(BrokerError::Configuration(
                "backend URL is missing or is still a placeholder; set SERVICENOW_INSTANCE_URL"
                    .into(),
            ));
        }

        let key = normalize(url);
        if key.is_empty() {
            return Err(BrokerError::Configuration(format!(
                "backend URL `{url}` does not name a host"
            )));
        }

        Ok(Self(key))
    }

    /// The normalized key
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-cases `url` and strips any `http://`/`https://` prefix and trailing slashes
///
/// Normalization is idempotent.
pub fn normalize(url: &str) -> String {
    let mut rest = url.trim();
    while let Some(stripped) = strip_scheme(rest) {
        rest = stripped.trim_start();
    }

    rest.trim_end_matches(|c: char| c == '/' || c.is_whitespace())
        .to_ascii_lowercase()
}

/// Parses the base URL requests to the backend are made against
///
/// A URL without a scheme is assumed to be HTTPS. The result never ends in a
/// slash unless it is the root path.
pub fn base_url(url: &str) -> Result<Url, BrokerError> {
    let trimmed = url.trim().trim_end_matches('/');
    let with_scheme = if strip_scheme(trimmed).is_some() {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    Url::parse(&with_scheme).map_err(|error| {
        BrokerError::Configuration(format!("backend URL `{url}` is not valid: {error}"))
    })
}

/// Appends `path_and_query` to `base`, preserving any path already on `base`
pub fn endpoint(base: &Url, path_and_query: &str) -> Url {
    let mut url = base.clone();
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query);
    url
}

fn strip_scheme(s: &str) -> Option<&str> {
    ["https://", "http://"].iter().find_map(|scheme| {
        s.get(..scheme.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .map(|_| &s[scheme.len()..])
    })
}
