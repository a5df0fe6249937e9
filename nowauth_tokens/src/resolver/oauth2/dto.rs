//! DTOs for interacting with the backend's OAuth token endpoint

use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, ClientId, ClientIdRef, ClientSecret, RefreshToken};

/// Credentials for the `client_credentials` grant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredentialsGrant {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

impl Serialize for ClientCredentialsGrant {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ClientCredentialsGrant", 3)?;
        ser.serialize_field("grant_type", "client_credentials")?;
        ser.serialize_field("client_id", &self.client_id)?;
        ser.serialize_field("client_secret", &self.client_secret)?;
        ser.end()
    }
}

impl super::GrantRequest for ClientCredentialsGrant {
    fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }
    fn grant_type() -> &'static str {
        "client_credentials"
    }
}

/// Credentials for the `refresh_token` grant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshTokenGrant {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,

    /// The refresh token
    pub refresh_token: RefreshToken,
}

impl Serialize for RefreshTokenGrant {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("RefreshTokenGrant", 4)?;
        ser.serialize_field("grant_type", "refresh_token")?;
        ser.serialize_field("client_id", &self.client_id)?;
        ser.serialize_field("client_secret", &self.client_secret)?;
        ser.serialize_field("refresh_token", &self.refresh_token)?;
        ser.end()
    }
}

impl super::GrantRequest for RefreshTokenGrant {
    fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }
    fn grant_type() -> &'static str {
        "refresh_token"
    }
}

fn default_expires_in() -> u64 {
    1800
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}
