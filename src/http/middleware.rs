//! Axum middleware that puts a [`Limiter`] in front of a route.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/login", post(login))
//!     .layer(axum::middleware::from_fn_with_state(profiles.auth().clone(), enforce));
//! ```

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::context::HttpContext;
use crate::ratelimit::{Decision, Limiter, Rejection};

/// Admit or reject the request with `limiter`.
///
/// The caller key is the peer IP from `ConnectInfo`; without it every
/// request lands in the shared fallback bucket.
pub async fn enforce(
    State(limiter): State<Arc<Limiter>>,
    request: Request,
    next: Next,
) -> Response {
    let address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let mut ctx = HttpContext::new(address);

    match limiter.evaluate(&mut ctx) {
        Decision::Rejected(rejection) => {
            info!(
                limiter = %limiter.name(),
                path = %request.uri().path(),
                retry_after = rejection.retry_after(),
                "Request rate limited"
            );
            rejection_response(&rejection, ctx.into_headers())
        }
        Decision::Allowed(admission) => {
            let mut response = next.run(request).await;
            admission.finish(response.status().as_u16());
            response.headers_mut().extend(ctx.into_headers());
            response
        }
    }
}

/// The 429 response for a rejection, with quota and `Retry-After` headers.
pub fn rejection_response(rejection: &Rejection, quota_headers: HeaderMap) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        quota_headers,
        [(header::RETRY_AFTER, rejection.retry_after().to_string())],
        Json(&rejection.body),
    )
        .into_response()
}
