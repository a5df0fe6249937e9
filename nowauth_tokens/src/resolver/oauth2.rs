//! Requests against the backend's OAuth token endpoint

use thiserror::Error;

use crate::ClientIdRef;

pub mod dto;

/// A grant that can be posted to the token endpoint as form data
pub trait GrantRequest: serde::Serialize {
    /// The client ID of the client making the request
    fn client_id(&self) -> &ClientIdRef;
    /// The grant type or flow to be performed
    fn grant_type() -> &'static str;
}

/// An error while attempting to request a new token from the token endpoint
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the token endpoint with an error body
    #[error("error requesting token from token endpoint: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from token endpoint")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the token endpoint
    #[error("error sending request to token endpoint")]
    RequestSend(#[source] reqwest::Error),
}

#[tracing::instrument(
    err,
    skip(client, token_url, grant),
    fields(
        token_url = %token_url,
        grant_type = R::grant_type(),
        client_id = %grant.client_id(),
    ),
)]
pub(crate) async fn request_token<R: GrantRequest>(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    grant: &R,
) -> Result<dto::TokenResponse, TokenRequestError> {
    tracing::trace!("requesting token from token endpoint");

    let resp = client
        .post(token_url)
        .form(grant)
        .send()
        .await
        .map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from token endpoint"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

    tracing::info!(
        has_refresh_token = resp.refresh_token.is_some(),
        expires_in = resp.expires_in,
        "received new tokens"
    );

    Ok(resp)
}
