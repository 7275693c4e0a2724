//! Admission policies.
//!
//! A [`Policy`] is an immutable value built once at startup: how long a window
//! lasts, how many calls a key may make in it, how the key is derived from a
//! call, which calls skip accounting entirely, and what a rejected caller is
//! told.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::call::{CallContext, FALLBACK_KEY};
use super::store::MAX_WINDOW;
use crate::error::{Result, TurnstileError};

/// Caller-supplied key derivation. Must be pure and must not fail.
pub type KeyFn = Arc<dyn Fn(&CallContext) -> String + Send + Sync>;

/// Caller-supplied bypass predicate. Must be pure.
pub type BypassFn = Arc<dyn Fn(&CallContext) -> bool + Send + Sync>;

/// How an identity key is derived from a call.
///
/// Keys are prefixed with their source so that, for example, an IP address
/// and a user id with the same text never share a counter.
#[derive(Clone)]
pub enum KeyStrategy {
    /// Client address (`ip:<addr>`), falling back to `ip:unknown`
    ClientIp,
    /// API-key header (`apikey:<key>`), falling back to `apikey:unknown`
    ApiKey,
    /// Authenticated user (`user:<id>`), else the client address
    UserOrIp,
    /// One shared key for every caller
    Fixed(String),
    /// Any other derivation, such as a tenant header
    Custom(KeyFn),
}

impl KeyStrategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&CallContext) -> String + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(f))
    }

    /// Derive the identity key for a call. Never fails.
    pub fn key_of(&self, call: &CallContext) -> String {
        match self {
            KeyStrategy::ClientIp => format!("ip:{}", call.client_ip()),
            KeyStrategy::ApiKey => match call.api_key.as_deref() {
                Some(key) => format!("apikey:{}", key),
                None => format!("apikey:{}", FALLBACK_KEY),
            },
            KeyStrategy::UserOrIp => match call.user_id.as_deref() {
                Some(user) => format!("user:{}", user),
                None => format!("ip:{}", call.client_ip()),
            },
            KeyStrategy::Fixed(key) => key.clone(),
            KeyStrategy::Custom(f) => f(call),
        }
    }
}

impl std::fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyStrategy::ClientIp => f.write_str("ClientIp"),
            KeyStrategy::ApiKey => f.write_str("ApiKey"),
            KeyStrategy::UserOrIp => f.write_str("UserOrIp"),
            KeyStrategy::Fixed(key) => f.debug_tuple("Fixed").field(key).finish(),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Calls that are admitted without consulting or touching the store.
#[derive(Clone)]
pub enum BypassRule {
    /// Every call is accounted
    Never,
    /// Calls whose path equals one of these are skipped
    Paths(Vec<String>),
    /// Calls without an API-key header are skipped
    MissingApiKey,
    /// Calls for which the predicate returns true are skipped
    Custom(BypassFn),
}

impl BypassRule {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&CallContext) -> bool + Send + Sync + 'static,
    {
        BypassRule::Custom(Arc::new(f))
    }

    pub fn matches(&self, call: &CallContext) -> bool {
        match self {
            BypassRule::Never => false,
            BypassRule::Paths(paths) => call
                .path
                .as_deref()
                .map(|path| paths.iter().any(|p| p == path))
                .unwrap_or(false),
            BypassRule::MissingApiKey => call.api_key.is_none(),
            BypassRule::Custom(f) => f(call),
        }
    }
}

impl std::fmt::Debug for BypassRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BypassRule::Never => f.write_str("Never"),
            BypassRule::Paths(paths) => f.debug_tuple("Paths").field(paths).finish(),
            BypassRule::MissingApiKey => f.write_str("MissingApiKey"),
            BypassRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What adapters do when the admission backend cannot produce a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the call
    #[default]
    Open,
    /// Reject the call
    Closed,
}

/// An immutable admission policy.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    window: Duration,
    max: u64,
    key: KeyStrategy,
    bypass: BypassRule,
    message: String,
    retry_after: Option<Duration>,
    failure_mode: FailureMode,
}

/// Paths the global policy never counts.
pub const HEALTH_CHECK_PATHS: &[&str] = &["/health", "/healthz", "/api/health"];

/// Shared key used by the webhook policy.
pub const WEBHOOK_KEY: &str = "webhook:shared";

impl Policy {
    /// Create a policy admitting `max` calls per key per `window`.
    ///
    /// Both `window` and `max` must be non-zero, and `window` may not
    /// exceed [`MAX_WINDOW`].
    pub fn new(
        name: impl Into<String>,
        window: Duration,
        max: u64,
        key: KeyStrategy,
    ) -> Result<Self> {
        let name = name.into();
        validate_limits(&name, window, max)?;

        Ok(Self {
            name,
            window,
            max,
            key,
            bypass: BypassRule::Never,
            message: "Too many requests, please try again later.".to_string(),
            retry_after: None,
            failure_mode: FailureMode::Open,
        })
    }

    /// Replace the window and quota, keeping everything else.
    pub fn with_limits(mut self, window: Duration, max: u64) -> Result<Self> {
        validate_limits(&self.name, window, max)?;
        self.window = window;
        self.max = max;
        Ok(self)
    }

    pub fn with_bypass(mut self, bypass: BypassRule) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Advertise a fixed retry-after to rejected callers instead of the
    /// time remaining in their window.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key
    }

    pub fn bypass_rule(&self) -> &BypassRule {
        &self.bypass
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Identity key for a call under this policy.
    pub fn key_of(&self, call: &CallContext) -> String {
        self.key.key_of(call)
    }

    /// Whether a call skips accounting under this policy.
    pub fn bypasses(&self, call: &CallContext) -> bool {
        self.bypass.matches(call)
    }

    /// Whole seconds a rejected caller should wait, never less than one.
    pub fn retry_after_secs(&self, reset_in: Duration) -> u64 {
        let wait = self.retry_after.unwrap_or(reset_in);
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        secs.max(1)
    }

    /// 1000 calls per 15 minutes per client address; health checks skipped.
    pub fn global() -> Self {
        Self::preset("global", Duration::from_secs(15 * 60), 1000, KeyStrategy::ClientIp)
            .with_bypass(BypassRule::Paths(
                HEALTH_CHECK_PATHS.iter().map(|p| p.to_string()).collect(),
            ))
            .with_message("Too many requests from this IP, please try again later.")
    }

    /// 60 calls per minute per API key; calls without a key are skipped.
    pub fn api_key() -> Self {
        Self::preset("api_key", Duration::from_secs(60), 60, KeyStrategy::ApiKey)
            .with_bypass(BypassRule::MissingApiKey)
            .with_message("API rate limit exceeded, please slow down.")
    }

    /// 30 sends per minute per user, or per address when unauthenticated.
    pub fn message_send() -> Self {
        Self::preset("message_send", Duration::from_secs(60), 30, KeyStrategy::UserOrIp)
            .with_message("Message sending limit reached, please wait before sending more messages.")
    }

    /// 5 attempts per 15 minutes per client address.
    pub fn login() -> Self {
        Self::preset("login", Duration::from_secs(15 * 60), 5, KeyStrategy::ClientIp)
            .with_message("Too many login attempts, please try again after 15 minutes.")
    }

    /// 100 deliveries per minute shared by all senders.
    pub fn webhook() -> Self {
        Self::preset(
            "webhook",
            Duration::from_secs(60),
            100,
            KeyStrategy::Fixed(WEBHOOK_KEY.to_string()),
        )
        .with_message("Webhook rate limit exceeded.")
    }

    // Preset parameters are constants known to be in range.
    fn preset(name: &str, window: Duration, max: u64, key: KeyStrategy) -> Self {
        Self {
            name: name.to_string(),
            window,
            max,
            key,
            bypass: BypassRule::Never,
            message: String::new(),
            retry_after: None,
            failure_mode: FailureMode::Open,
        }
    }
}

fn validate_limits(name: &str, window: Duration, max: u64) -> Result<()> {
    if window.is_zero() {
        return Err(TurnstileError::InvalidPolicy {
            name: name.to_string(),
            reason: "window must be greater than zero".to_string(),
        });
    }
    if window > MAX_WINDOW {
        return Err(TurnstileError::InvalidPolicy {
            name: name.to_string(),
            reason: format!("window must be at most {} seconds", MAX_WINDOW.as_secs()),
        });
    }
    if max == 0 {
        return Err(TurnstileError::InvalidPolicy {
            name: name.to_string(),
            reason: "max must be greater than zero".to_string(),
        });
    }
    Ok(())
}
