//! Pipeline-stage adapter for axum routers.
//!
//! Install with `axum::middleware::from_fn_with_state`:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{middleware, routing::post, Router};
//! use turnstile::http::{enforce, make_http_guard};
//! use turnstile::ratelimit::{Limiter, Policy};
//!
//! let guard = make_http_guard(Arc::new(Limiter::new(Policy::login())));
//! let app: Router = Router::new()
//!     .route("/api/auth/login", post(|| async { "ok" }))
//!     .route_layer(middleware::from_fn_with_state(guard, enforce));
//! ```

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::ratelimit::{
    Admission, AuthenticatedUser, CallContext, Decision, Policy, Verdict, API_KEY_HEADER,
    FORWARDED_FOR_HEADER, REAL_IP_HEADER,
};

/// Quota of the policy that answered.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Calls left in the current window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Unix time in seconds at which the window resets.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// JSON body of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub retry_after: u64,
}

/// Middleware state binding one admission backend to a route or router.
#[derive(Clone)]
pub struct HttpGuard {
    backend: Arc<dyn Admission>,
}

/// Build the middleware state for a policy's backend.
pub fn make_http_guard(backend: Arc<dyn Admission>) -> HttpGuard {
    HttpGuard { backend }
}

impl HttpGuard {
    pub fn policy(&self) -> &Policy {
        self.backend.policy()
    }

    #[instrument(level = "debug", skip(self), fields(policy = %self.policy().name()))]
    fn decide(&self, call: &CallContext) -> Decision {
        self.backend.evaluate(call)
    }

    fn reject(&self, verdict: &Verdict) -> Response {
        let policy = self.policy();
        let retry_after = policy.retry_after_secs(verdict.reset_in);
        let body = RejectionBody {
            error: policy.message().to_string(),
            retry_after,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        apply_headers(headers, verdict);
        response
    }

    fn unavailable(&self) -> Response {
        let policy = self.policy();
        let retry_after = policy.retry_after_secs(std::time::Duration::ZERO);
        let body = RejectionBody {
            error: policy.message().to_string(),
            retry_after,
        };

        let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}

impl std::fmt::Debug for HttpGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGuard")
            .field("policy", &self.policy().name())
            .finish()
    }
}

/// Middleware function: admit and forward, or short-circuit with 429.
pub async fn enforce(State(guard): State<HttpGuard>, req: Request, next: Next) -> Response {
    let call = call_context(&req);

    match guard.decide(&call) {
        Decision::Bypassed | Decision::FailedOpen => next.run(req).await,
        Decision::Admitted(verdict) => {
            let mut response = next.run(req).await;
            apply_headers(response.headers_mut(), &verdict);
            response
        }
        Decision::Rejected(verdict) => {
            debug!(policy = %guard.policy().name(), path = ?call.path, "Rejecting request");
            guard.reject(&verdict)
        }
        Decision::FailedClosed => guard.unavailable(),
    }
}

/// Collect identity metadata from an HTTP request.
///
/// The peer address is only known when the server was started with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn call_context(req: &Request) -> CallContext {
    let headers = req.headers();
    let mut call = CallContext::new().with_path(req.uri().path());

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        call = call.with_peer_addr(addr.ip());
    }
    if let Some(value) = header_str(headers, FORWARDED_FOR_HEADER) {
        call = call.with_forwarded_for(value);
    }
    if let Some(value) = header_str(headers, REAL_IP_HEADER) {
        call = call.with_real_ip(value);
    }
    if let Some(value) = header_str(headers, API_KEY_HEADER) {
        call = call.with_api_key(value);
    }
    if let Some(AuthenticatedUser(id)) = req.extensions().get::<AuthenticatedUser>() {
        call = call.with_user_id(id.clone());
    }

    call
}

// Headers already present were set by a more specific guard closer to the
// handler; they are left alone.
fn apply_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers
        .entry(LIMIT_HEADER)
        .or_insert_with(|| HeaderValue::from(verdict.limit));
    headers
        .entry(REMAINING_HEADER)
        .or_insert_with(|| HeaderValue::from(verdict.remaining));
    headers
        .entry(RESET_HEADER)
        .or_insert_with(|| HeaderValue::from(verdict.reset_at_epoch_secs()));
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TurnstileError};
    use crate::ratelimit::{FailureMode, KeyStrategy, Limiter};
    use axum::body::Body;
    use axum::middleware;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(backend: Arc<dyn Admission>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/health", get(|| async { "healthy" }))
            .layer(middleware::from_fn_with_state(make_http_guard(backend), enforce))
    }

    fn limited(max: u64) -> Arc<Limiter> {
        let policy = Policy::new("test", Duration::from_secs(60), max, KeyStrategy::ClientIp)
            .unwrap()
            .with_message("slow down");
        Arc::new(Limiter::new(policy))
    }

    fn request(path: &str, ip: &str) -> Request {
        axum::http::Request::builder()
            .uri(path)
            .header(FORWARDED_FOR_HEADER, ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_carries_headers() {
        let app = app(limited(3));

        let response = app.oneshot(request("/", "1.1.1.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[LIMIT_HEADER], "3");
        assert_eq!(response.headers()[REMAINING_HEADER], "2");
        assert!(response.headers().contains_key(RESET_HEADER));
    }

    #[tokio::test]
    async fn test_rejected_request_gets_429_with_body() {
        let limiter = limited(2);
        let app = app(limiter.clone());

        for _ in 0..2 {
            let response = app.clone().oneshot(request("/", "1.1.1.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request("/", "1.1.1.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[REMAINING_HEADER], "0");

        let retry_after: u64 = response.headers()[RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry_after));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: RejectionBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "slow down");
        assert_eq!(body.retry_after, retry_after);

        // A different client is unaffected
        let response = app.oneshot(request("/", "2.2.2.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(limiter.count_of("ip:1.1.1.1"), Some(2));
    }

    #[test]
    fn test_rejection_body_uses_camel_case() {
        let body = RejectionBody {
            error: "nope".to_string(),
            retry_after: 5,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"error": "nope", "retryAfter": 5}));
    }

    #[tokio::test]
    async fn test_bypassed_path_is_not_counted() {
        let policy = Policy::new("test", Duration::from_secs(60), 1, KeyStrategy::ClientIp)
            .unwrap()
            .with_bypass(crate::ratelimit::BypassRule::Paths(vec!["/health".to_string()]));
        let limiter = Arc::new(Limiter::new(policy));
        let app = app(limiter.clone());

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/health", "1.1.1.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(LIMIT_HEADER));
        }

        assert!(limiter.store().is_empty());
    }

    #[test]
    fn test_call_context_reads_headers_and_extensions() {
        let mut req = axum::http::Request::builder()
            .uri("/api/v1/contacts?page=2")
            .header(FORWARDED_FOR_HEADER, "203.0.113.5, 10.0.0.2")
            .header(API_KEY_HEADER, "key-1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 9], 5000))));
        req.extensions_mut()
            .insert(AuthenticatedUser("user-7".to_string()));

        let call = call_context(&req);

        assert_eq!(call.path.as_deref(), Some("/api/v1/contacts"));
        assert_eq!(call.client_ip(), "203.0.113.5");
        assert_eq!(call.peer_addr.map(|a| a.to_string()).as_deref(), Some("10.0.0.9"));
        assert_eq!(call.api_key.as_deref(), Some("key-1"));
        assert_eq!(call.user_id.as_deref(), Some("user-7"));
    }

    struct Unreachable(Policy);

    impl Admission for Unreachable {
        fn policy(&self) -> &Policy {
            &self.0
        }

        fn check(&self, _key: &str) -> Result<Verdict> {
            Err(TurnstileError::Backend("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fail_open_forwards_without_headers() {
        let policy = Policy::new("test", Duration::from_secs(60), 1, KeyStrategy::ClientIp).unwrap();
        let app = app(Arc::new(Unreachable(policy)));

        let response = app.oneshot(request("/", "1.1.1.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(LIMIT_HEADER));
    }

    #[tokio::test]
    async fn test_fail_closed_returns_503() {
        let policy = Policy::new("test", Duration::from_secs(60), 1, KeyStrategy::ClientIp)
            .unwrap()
            .with_failure_mode(FailureMode::Closed);
        let app = app(Arc::new(Unreachable(policy)));

        let response = app.oneshot(request("/", "1.1.1.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
    }
}
