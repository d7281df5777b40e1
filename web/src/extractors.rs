//! Axum extractors.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};
use conduit_core::CorrelationContext;

/// The request's [`CorrelationContext`].
///
/// Read from request extensions when [`correlation_layer`](crate::correlation_layer)
/// is installed, otherwise extracted from the headers directly. Never rejects.
///
/// Handlers call `ctx.derive()` before making downstream calls.
///
/// ```ignore
/// async fn create_task(
///     Correlation(ctx): Correlation,
///     State(users): State<Arc<UserClient>>,
/// ) -> Result<Json<Task>, ApiError> {
///     let owner = users.fetch(&ctx.derive(), owner_id).await?;
///     // ...
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation(pub CorrelationContext);

#[async_trait]
impl<S> FromRequestParts<S> for Correlation
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = parts
            .extensions
            .get::<CorrelationContext>()
            .cloned()
            .unwrap_or_else(|| CorrelationContext::extract(&parts.headers));

        Ok(Self(context))
    }
}
