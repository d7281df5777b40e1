//! Correlation tracking for inbound requests.
//!
//! The layer:
//! 1. **Extracts** a [`CorrelationContext`] from `X-Request-ID` / `X-Correlation-ID`
//!    (a request without them roots a new chain)
//! 2. **Stores** it in request extensions for the [`Correlation`](crate::Correlation)
//!    extractor
//! 3. **Creates a tracing span** carrying both ids
//! 4. **Echoes** both headers on the response
//!
//! # Example
//!
//! ```
//! use axum::{Router, routing::get};
//! use conduit_web::{Correlation, correlation_layer};
//!
//! async fn whoami(Correlation(ctx): Correlation) -> String {
//!     ctx.correlation_id().to_string()
//! }
//!
//! let app: Router = Router::new()
//!     .route("/whoami", get(whoami))
//!     .layer(correlation_layer());
//! ```

use axum::{extract::Request, response::Response};
use conduit_core::CorrelationContext;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// Create a layer that attaches a [`CorrelationContext`] to every request.
#[must_use]
pub const fn correlation_layer() -> CorrelationLayer {
    CorrelationLayer
}

/// Layer for correlation tracking.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationMiddleware { inner }
    }
}

/// Middleware service for correlation tracking.
#[derive(Clone, Debug)]
pub struct CorrelationMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let context = CorrelationContext::extract(req.headers());
        req.extensions_mut().insert(context.clone());

        let span = tracing::info_span!(
            "http_request",
            request_id = %context.request_id(),
            correlation_id = %context.correlation_id(),
            method = %req.method(),
            uri = %req.uri(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.instrument(span).await?;
            context.inject(response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, routing::get};
    use conduit_core::correlation::{CORRELATION_ID_HEADER, REQUEST_ID_HEADER};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(correlation_layer())
    }

    fn header<'a>(response: &'a Response, name: &str) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn request_without_headers_roots_a_chain() {
        let request = http::Request::builder()
            .uri("/ping")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        let request_id = header(&response, REQUEST_ID_HEADER);
        let correlation_id = header(&response, CORRELATION_ID_HEADER);
        assert!(!request_id.is_empty());
        assert_eq!(request_id, correlation_id);
    }

    #[tokio::test]
    async fn inbound_ids_are_echoed() {
        let request = http::Request::builder()
            .uri("/ping")
            .header(REQUEST_ID_HEADER, "req-7")
            .header(CORRELATION_ID_HEADER, "chain-1")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(header(&response, REQUEST_ID_HEADER), "req-7");
        assert_eq!(header(&response, CORRELATION_ID_HEADER), "chain-1");
    }

    #[tokio::test]
    async fn correlation_only_keeps_chain_and_mints_request_id() {
        let request = http::Request::builder()
            .uri("/ping")
            .header(CORRELATION_ID_HEADER, "chain-2")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(header(&response, CORRELATION_ID_HEADER), "chain-2");
        assert_ne!(header(&response, REQUEST_ID_HEADER), "chain-2");
    }

    #[tokio::test]
    async fn context_is_stored_in_extensions() {
        async fn handler(req: Request) -> String {
            req.extensions()
                .get::<CorrelationContext>()
                .map(|ctx| ctx.correlation_id().to_string())
                .unwrap_or_default()
        }

        let app = Router::new()
            .route("/ctx", get(handler))
            .layer(correlation_layer());
        let request = http::Request::builder()
            .uri("/ctx")
            .header(CORRELATION_ID_HEADER, "chain-3")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"chain-3");
    }
}
