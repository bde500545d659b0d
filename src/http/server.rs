//! Admission server: lets an external proxy ask for a decision.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::context::HttpContext;
use super::middleware::rejection_response;
use crate::error::Result;
use crate::ratelimit::{Decision, Profile, Profiles};

/// Body of `POST /check`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    /// Profile name, e.g. `auth`
    pub profile: String,
    /// Caller address as seen by the proxy
    #[serde(default)]
    pub address: Option<String>,
}

/// Body of an admitted `POST /check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// HTTP server for the admission check endpoint.
pub struct AdmissionServer {
    /// Address to bind to
    addr: SocketAddr,
    profiles: Arc<Profiles>,
}

impl AdmissionServer {
    pub fn new(addr: SocketAddr, profiles: Arc<Profiles>) -> Self {
        Self { addr, profiles }
    }

    /// The server's routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/check", post(check))
            .layer(TraceLayer::new_for_http())
            .with_state(self.profiles.clone())
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Admission server listening");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "Admission server failed");
            e.into()
        })
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "warden",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn check(State(profiles): State<Arc<Profiles>>, Json(req): Json<CheckRequest>) -> Response {
    let profile: Profile = match req.profile.parse() {
        Ok(profile) => profile,
        Err(err) => {
            warn!(profile = %req.profile, "Check for unknown profile");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": { "code": "UNKNOWN_PROFILE", "message": err.to_string() }
                })),
            )
                .into_response();
        }
    };

    debug!(profile = %profile, address = ?req.address, "Processing admission check");

    let mut ctx = HttpContext::new(req.address);
    match profiles.get(profile).evaluate(&mut ctx) {
        Decision::Allowed(admission) => {
            let remaining = admission.quota.map(|quota| quota.remaining);
            (
                StatusCode::OK,
                ctx.into_headers(),
                Json(CheckResponse {
                    allowed: true,
                    remaining,
                }),
            )
                .into_response()
        }
        Decision::Rejected(rejection) => {
            info!(profile = %profile, retry_after = rejection.retry_after(), "Admission denied");
            rejection_response(&rejection, ctx.into_headers())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_server(disabled: bool) -> AdmissionServer {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        AdmissionServer::new(addr, Arc::new(Profiles::new(disabled)))
    }

    fn check_request(profile: &str, address: &str) -> Request<Body> {
        let body = serde_json::json!({ "profile": profile, "address": address });
        Request::builder()
            .method("POST")
            .uri("/check")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let server = create_server(false);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let response = server.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_check_allows_then_rejects() {
        let server = create_server(false);

        for expected in (0..5).rev() {
            let response = server
                .router()
                .oneshot(check_request("auth", "10.1.1.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-limit"], "5");
            let json = body_json(response).await;
            assert_eq!(json["allowed"], true);
            assert_eq!(json["remaining"], expected);
        }

        let response = server
            .router()
            .oneshot(check_request("auth", "10.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            json["error"]["message"],
            "Too many authentication attempts, please try again later."
        );
    }

    #[tokio::test]
    async fn test_check_unknown_profile() {
        let server = create_server(false);

        let response = server
            .router()
            .oneshot(check_request("admin", "10.1.1.1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "UNKNOWN_PROFILE");
    }

    #[tokio::test]
    async fn test_check_when_disabled() {
        let server = create_server(true);

        for _ in 0..10 {
            let response = server
                .router()
                .oneshot(check_request("password_reset", "10.1.1.2"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-limit"));
            let json = body_json(response).await;
            assert_eq!(json["allowed"], true);
            assert!(json.get("remaining").is_none());
        }
    }
}
