//! RPC procedure adapter for tonic services.
//!
//! [`RpcGuard`] is a tonic [`Interceptor`]. Attach it to a generated server
//! with `FooServer::with_interceptor(service, guard)`. Interceptors cannot
//! touch the response; to have admitted calls answered with `x-ratelimit-*`
//! metadata, install the guard as a layer instead with
//! `Server::builder().layer(guard.into_layer())`.

use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::{debug, instrument};

use super::layer::RpcLimitLayer;
use crate::ratelimit::{
    Admission, AuthenticatedUser, CallContext, Decision, Policy, Verdict, API_KEY_HEADER,
    FORWARDED_FOR_HEADER, REAL_IP_HEADER,
};

/// Metadata key for the policy quota.
pub const LIMIT_METADATA: &str = "x-ratelimit-limit";
/// Metadata key for calls left in the window.
pub const REMAINING_METADATA: &str = "x-ratelimit-remaining";
/// Metadata key for the reset time (Unix seconds).
pub const RESET_METADATA: &str = "x-ratelimit-reset";
/// Metadata key for the retry-after hint on rejections.
pub const RETRY_AFTER_METADATA: &str = "retry-after";

/// Rate-limit state of an admitted RPC, placed in the request extensions.
///
/// Interceptors cannot touch the response, so handlers behind an interceptor
/// copy it across with [`RateLimitInfo::apply_to`]. [`RpcLimitLayer`] writes
/// the same entries itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo(pub Verdict);

impl RateLimitInfo {
    /// Write the `x-ratelimit-*` entries into outgoing metadata.
    pub fn apply_to(&self, metadata: &mut MetadataMap) {
        let verdict = &self.0;
        metadata.insert(LIMIT_METADATA, MetadataValue::from(verdict.limit));
        metadata.insert(REMAINING_METADATA, MetadataValue::from(verdict.remaining));
        metadata.insert(RESET_METADATA, MetadataValue::from(verdict.reset_at_epoch_secs()));
    }
}

/// Interceptor enforcing one policy on RPC calls.
#[derive(Clone)]
pub struct RpcGuard {
    backend: Arc<dyn Admission>,
    procedure: Option<String>,
}

/// Build an interceptor for a policy's backend.
pub fn make_rpc_guard(backend: Arc<dyn Admission>) -> RpcGuard {
    RpcGuard {
        backend,
        procedure: None,
    }
}

impl RpcGuard {
    /// Name the procedure this guard is installed on.
    ///
    /// Interceptors do not see the request path, so path-based bypass rules
    /// match against this name instead.
    pub fn for_procedure(mut self, procedure: impl Into<String>) -> Self {
        self.procedure = Some(procedure.into());
        self
    }

    pub fn policy(&self) -> &Policy {
        self.backend.policy()
    }

    /// Wrap this guard in a tower layer for `tonic::transport::Server`.
    pub fn into_layer(self) -> RpcLimitLayer {
        RpcLimitLayer::new(self)
    }

    /// Collect identity metadata from an RPC request.
    pub fn call_context<T>(&self, request: &Request<T>) -> CallContext {
        let metadata = request.metadata();
        let mut call = CallContext::new();

        if let Some(procedure) = &self.procedure {
            call = call.with_path(procedure.clone());
        }
        if let Some(addr) = request.remote_addr() {
            call = call.with_peer_addr(addr.ip());
        }
        if let Some(value) = metadata_str(metadata, FORWARDED_FOR_HEADER) {
            call = call.with_forwarded_for(value);
        }
        if let Some(value) = metadata_str(metadata, REAL_IP_HEADER) {
            call = call.with_real_ip(value);
        }
        if let Some(value) = metadata_str(metadata, API_KEY_HEADER) {
            call = call.with_api_key(value);
        }
        if let Some(AuthenticatedUser(id)) = request.extensions().get::<AuthenticatedUser>() {
            call = call.with_user_id(id.clone());
        }

        call
    }

    #[instrument(level = "debug", skip(self), fields(policy = %self.policy().name()))]
    pub(crate) fn decide(&self, call: &CallContext) -> Decision {
        self.backend.evaluate(call)
    }

    pub(crate) fn reject(&self, verdict: &Verdict) -> Status {
        let policy = self.policy();
        let retry_after = policy.retry_after_secs(verdict.reset_in);

        let mut status = Status::resource_exhausted(policy.message());
        let metadata = status.metadata_mut();
        metadata.insert(RETRY_AFTER_METADATA, MetadataValue::from(retry_after));
        RateLimitInfo(*verdict).apply_to(metadata);
        status
    }

    pub(crate) fn unavailable(&self) -> Status {
        let policy = self.policy();
        let retry_after = policy.retry_after_secs(Duration::ZERO);

        let mut status = Status::unavailable(policy.message());
        status
            .metadata_mut()
            .insert(RETRY_AFTER_METADATA, MetadataValue::from(retry_after));
        status
    }
}

impl Interceptor for RpcGuard {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let call = self.call_context(&request);

        match self.decide(&call) {
            Decision::Bypassed | Decision::FailedOpen => Ok(request),
            Decision::Admitted(verdict) => {
                request.extensions_mut().insert(RateLimitInfo(verdict));
                Ok(request)
            }
            Decision::Rejected(verdict) => {
                debug!(policy = %self.policy().name(), procedure = ?call.path, "Rejecting call");
                Err(self.reject(&verdict))
            }
            Decision::FailedClosed => Err(self.unavailable()),
        }
    }
}

impl std::fmt::Debug for RpcGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGuard")
            .field("policy", &self.policy().name())
            .field("procedure", &self.procedure)
            .finish()
    }
}

fn metadata_str<'a>(metadata: &'a MetadataMap, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.to_str().ok())
}
