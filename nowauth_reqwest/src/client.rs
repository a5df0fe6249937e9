//! A JSON client bound to one backend

use std::fmt;

use nowauth_tokens::{identity, BackendIdentity, BrokerError};
use reqwest::{Method, Url};
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use serde_json::Value;

use crate::response::normalize_response;

/// An authenticated client for one backend
///
/// Every call returns the normalized `{"result": ...}` body or a
/// [`BrokerError`]. Paths are resolved against the backend's base URL.
#[derive(Clone)]
pub struct InstanceClient {
    http: ClientWithMiddleware,
    base_url: Url,
    identity: BackendIdentity,
}

impl InstanceClient {
    /// Wraps a middleware-equipped client for the backend at `base_url`
    pub fn new(http: ClientWithMiddleware, base_url: Url, identity: BackendIdentity) -> Self {
        Self {
            http,
            base_url,
            identity,
        }
    }

    /// The backend this client talks to
    pub fn identity(&self) -> &BackendIdentity {
        &self.identity
    }

    /// The base URL paths are resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The underlying HTTP client, for requests that need more control
    pub fn http(&self) -> &ClientWithMiddleware {
        &self.http
    }

    /// Sends a `GET` with the given query parameters
    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, BrokerError> {
        self.send(Method::GET, path, query, None).await
    }

    /// Sends a `POST` with a JSON body
    pub async fn post<B>(&self, path: &str, body: &B) -> Result<Value, BrokerError>
    where
        B: Serialize + ?Sized,
    {
        self.send(Method::POST, path, &[], Some(encode(body)?)).await
    }

    /// Sends a `PUT` with a JSON body
    pub async fn put<B>(&self, path: &str, body: &B) -> Result<Value, BrokerError>
    where
        B: Serialize + ?Sized,
    {
        self.send(Method::PUT, path, &[], Some(encode(body)?)).await
    }

    /// Sends a `PATCH` with a JSON body
    pub async fn patch<B>(&self, path: &str, body: &B) -> Result<Value, BrokerError>
    where
        B: Serialize + ?Sized,
    {
        self.send(Method::PATCH, path, &[], Some(encode(body)?)).await
    }

    /// Sends a `DELETE`
    pub async fn delete(&self, path: &str) -> Result<Value, BrokerError> {
        self.send(Method::DELETE, path, &[], None).await
    }

    #[tracing::instrument(
        err,
        skip(self, query, body),
        fields(backend = %self.identity, response.status = tracing::field::Empty)
    )]
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Value, BrokerError> {
        let url = identity::endpoint(&self.base_url, path);

        let mut req = self.http.request(method, url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(from_middleware_error)?;
        let status = resp.status();
        tracing::Span::current().record("response.status", status.as_u16());

        let body = resp.bytes().await?;
        normalize_response(status, &body)
    }
}

impl fmt::Debug for InstanceClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InstanceClient")
            .field("base_url", &self.base_url.as_str())
            .field("identity", &self.identity)
            .finish()
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(body).map_err(|err| {
        BrokerError::Configuration(format!("request body could not be serialized: {err}"))
    })
}

/// Recovers the broker error carried through the middleware stack
fn from_middleware_error(err: reqwest_middleware::Error) -> BrokerError {
    match err {
        reqwest_middleware::Error::Reqwest(err) => err.into(),
        reqwest_middleware::Error::Middleware(err) => match err.downcast::<BrokerError>() {
            Ok(err) => err,
            Err(err) => BrokerError::Upstream {
                status: None,
                message: format!("{err:#}"),
                detail: None,
            },
        },
    }
}
