//! Tower layer running an [`RpcGuard`] around a tonic server.
//!
//! Unlike the interceptor form, the layer sees both the request path and the
//! response, so admitted calls get `x-ratelimit-*` in their initial metadata
//! without any handler involvement.

use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::codegen::http::{HeaderMap, HeaderValue, Request, Response};
use tonic::codegen::BoxFuture;
use tonic::transport::server::TcpConnectInfo;
use tower::{Layer, Service};
use tracing::debug;

use super::guard::{RpcGuard, LIMIT_METADATA, REMAINING_METADATA, RESET_METADATA};
use crate::ratelimit::{
    AuthenticatedUser, CallContext, Decision, Verdict, API_KEY_HEADER, FORWARDED_FOR_HEADER,
    REAL_IP_HEADER,
};

/// Layer for `tonic::transport::Server::builder().layer(..)`.
#[derive(Debug, Clone)]
pub struct RpcLimitLayer {
    guard: RpcGuard,
}

impl RpcLimitLayer {
    pub fn new(guard: RpcGuard) -> Self {
        Self { guard }
    }
}

impl<S> Layer<S> for RpcLimitLayer {
    type Service = RpcLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcLimitService {
            inner,
            guard: self.guard.clone(),
        }
    }
}

/// Service produced by [`RpcLimitLayer`].
#[derive(Debug, Clone)]
pub struct RpcLimitService<S> {
    inner: S,
    guard: RpcGuard,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RpcLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<BoxBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let call = call_context(&request);

        match self.guard.decide(&call) {
            Decision::Bypassed | Decision::FailedOpen => Box::pin(self.inner.call(request)),
            Decision::Admitted(verdict) => {
                let response = self.inner.call(request);
                Box::pin(async move {
                    let mut response = response.await?;
                    apply_headers(response.headers_mut(), &verdict);
                    Ok::<_, S::Error>(response)
                })
            }
            Decision::Rejected(verdict) => {
                debug!(policy = %self.guard.policy().name(), procedure = ?call.path, "Rejecting call");
                let status = self.guard.reject(&verdict);
                Box::pin(std::future::ready(Ok(status.into_http())))
            }
            Decision::FailedClosed => {
                let status = self.guard.unavailable();
                Box::pin(std::future::ready(Ok(status.into_http())))
            }
        }
    }
}

/// Collect identity metadata from a gRPC request at the HTTP/2 level.
///
/// The path is the fully-qualified procedure, e.g. `/pkg.Service/Method`.
pub(crate) fn call_context<B>(request: &Request<B>) -> CallContext {
    let headers = request.headers();
    let mut call = CallContext::new().with_path(request.uri().path());

    if let Some(addr) = request
        .extensions()
        .get::<TcpConnectInfo>()
        .and_then(|info| info.remote_addr())
    {
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
    if let Some(AuthenticatedUser(id)) = request.extensions().get::<AuthenticatedUser>() {
        call = call.with_user_id(id.clone());
    }

    call
}

// A guard closer to the handler has already answered for these.
fn apply_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers
        .entry(LIMIT_METADATA)
        .or_insert_with(|| HeaderValue::from(verdict.limit));
    headers
        .entry(REMAINING_METADATA)
        .or_insert_with(|| HeaderValue::from(verdict.remaining));
    headers
        .entry(RESET_METADATA)
        .or_insert_with(|| HeaderValue::from(verdict.reset_at_epoch_secs()));
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
