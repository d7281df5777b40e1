//! HTTP transport backed by `reqwest`.
//!
//! Attaches correlation headers to every request and turns failed responses
//! into [`TransportError`]s that carry the peer's problem-details body, ready
//! for an [`ErrorClassifier`](conduit_core::error::ErrorClassifier).
//!
//! Combine with [`ResilientClient`](crate::client::ResilientClient):
//!
//! ```rust,no_run
//! use conduit_core::CorrelationContext;
//! use conduit_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use conduit_runtime::client::ResilientClient;
//! use conduit_runtime::transport::ReqwestTransport;
//! use conduit_runtime::retry::RetryPolicy;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let users = ReqwestTransport::new("http://user-service:8000")?;
//! let client = ResilientClient::new(
//!     CircuitBreaker::new("user-service", CircuitBreakerConfig::default()),
//!     RetryPolicy::default(),
//! );
//!
//! let ctx = CorrelationContext::new_root();
//! let user: serde_json::Value = client
//!     .call(&ctx, |child| {
//!         let users = users.clone();
//!         async move { users.get_json("/users/42", &child).await }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use conduit_core::correlation::CorrelationContext;
use conduit_core::error::TransportError;
use conduit_core::problem::ProblemDetails;
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Response body of a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// Status code (2xx)
    pub status: u16,
    /// Raw body
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::Other(format!("invalid response body: {e}")))
    }
}

/// `reqwest`-based transport for one base URL.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Transport with a default `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] if the client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Transport sharing an existing client (and its connection pool).
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one request.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Status`] for non-2xx responses, otherwise the
    /// mapped connection or timeout failure.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        context: &CorrelationContext,
    ) -> Result<TransportResponse, TransportError> {
        let mut headers = HeaderMap::new();
        context.inject(&mut headers);

        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.client.request(method, &url).headers(headers);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        if (200..300).contains(&status) {
            Ok(TransportResponse {
                status,
                body: bytes.to_vec(),
            })
        } else {
            Err(TransportError::Status {
                status,
                problem: ProblemDetails::from_slice(&bytes),
            })
        }
    }

    /// `GET path` and decode a JSON response.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`TransportError::Other`] on decode failure.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        context: &CorrelationContext,
    ) -> Result<T, TransportError> {
        self.send(Method::GET, path, None, context).await?.json()
    }

    /// `POST path` with a JSON body and decode a JSON response.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), plus [`TransportError::Other`] on encode or decode failure.
    pub async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        context: &CorrelationContext,
    ) -> Result<T, TransportError> {
        let body = serde_json::to_value(body)
            .map_err(|e| TransportError::Other(format!("invalid request body: {e}")))?;
        self.send(Method::POST, path, Some(&body), context)
            .await?
            .json()
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::ConnectionRefused(err.to_string())
    } else if err.is_request() || err.is_body() {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use conduit_core::error::{ErrorClassifier, ErrorKind, HttpErrorClassifier};

    #[test]
    fn base_url_is_normalized() {
        let transport = ReqwestTransport::new("http://tasks:8000/").unwrap();
        assert_eq!(transport.base_url(), "http://tasks:8000");
    }

    #[test]
    fn response_json_decode_errors_are_unknown() {
        let response = TransportResponse {
            status: 200,
            body: b"not json".to_vec(),
        };
        let err = response.json::<serde_json::Value>().unwrap_err();
        assert_eq!(HttpErrorClassifier.classify(&err), ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        // Free port, released again so the connect is refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new(format!("http://{addr}")).unwrap();
        let err = transport
            .get_json::<serde_json::Value>("/health", &CorrelationContext::new_root())
            .await
            .unwrap_err();

        assert_eq!(HttpErrorClassifier.classify(&err), ErrorKind::Unavailable);
    }
}
