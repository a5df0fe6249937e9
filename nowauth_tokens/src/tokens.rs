use nowauth_clock::{Clock, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef, BackendIdentity, RefreshToken, RefreshTokenRef};

/// The authentication material cached for one backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    access_token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
    expires_at: UnixTime,
    #[serde(rename = "instanceUrl")]
    backend: BackendIdentity,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token may be used
    Valid,
    /// The token is no longer valid
    Expired,
}

impl TokenRecord {
    /// Constructs a new record
    pub fn new(
        backend: BackendIdentity,
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
        expires_at: UnixTime,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
            backend,
        }
    }

    /// Gets the access token
    ///
    /// For basic-auth credentials this is the complete `Basic ...` value.
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token, if one was issued
    #[inline]
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// Gets the time at which the record stops being valid
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Gets the backend this record authenticates against
    #[inline]
    pub fn backend(&self) -> &BackendIdentity {
        &self.backend
    }

    /// Gets the record's lifecycle status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.expires_at {
            TokenStatus::Valid
        } else {
            TokenStatus::Expired
        }
    }

    /// Whether the record is valid according to `clock`
    #[inline]
    pub fn is_valid_with_clock<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        self.token_status_at(clock.now()) == TokenStatus::Valid
    }
}
