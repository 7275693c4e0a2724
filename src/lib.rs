//! Turnstile - Request Admission and Throttling
//!
//! This crate decides, per incoming request, whether a caller identified by a
//! key has exceeded a quota of calls within a fixed time window. It ships five
//! named policies, an axum middleware for HTTP routers and a tonic interceptor
//! for RPC services.
//!
//! Window state lives in process memory. When several replicas run behind a
//! load balancer, each enforces its own copy of every quota, so the effective
//! fleet-wide limit is the per-policy quota multiplied by the replica count.

pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod ratelimit;
