//! Transport-agnostic view of an inbound call.
//!
//! Adapters fill a [`CallContext`] from whatever the HTTP or RPC layer exposes;
//! policies derive identity keys and bypass decisions from it alone.

use std::net::IpAddr;

/// Key used when a call carries no usable identity metadata.
pub const FALLBACK_KEY: &str = "unknown";

/// Header carrying the proxy chain of client addresses.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header set by some proxies to the original client address.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Header carrying a caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Identity of an authenticated caller.
///
/// Upstream authentication layers insert this into the request extensions;
/// the limiter only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Identity metadata of one inbound HTTP request or RPC invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Request path or fully-qualified RPC procedure name
    pub path: Option<String>,
    /// Transport-level peer address
    pub peer_addr: Option<IpAddr>,
    /// Raw `X-Forwarded-For` value
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` value
    pub real_ip: Option<String>,
    /// Raw `X-API-Key` value
    pub api_key: Option<String>,
    /// Authenticated user id, if an auth layer ran first
    pub user_id: Option<String>,
}

impl CallContext {
    /// Create an empty call context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = non_empty(value.into());
        self
    }

    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = non_empty(value.into());
        self
    }

    pub fn with_api_key(mut self, value: impl Into<String>) -> Self {
        self.api_key = non_empty(value.into());
        self
    }

    pub fn with_user_id(mut self, value: impl Into<String>) -> Self {
        self.user_id = non_empty(value.into());
        self
    }

    /// Best-effort client address.
    ///
    /// Resolution order: first `X-Forwarded-For` hop, `X-Real-IP`, the peer
    /// address, then [`FALLBACK_KEY`].
    pub fn client_ip(&self) -> String {
        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());

        if let Some(hop) = forwarded {
            return hop.to_string();
        }

        if let Some(real_ip) = self.real_ip.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            return real_ip.to_string();
        }

        self.peer_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| FALLBACK_KEY.to_string())
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_client_ip_prefers_first_forwarded_hop() {
        let call = CallContext::new()
            .with_forwarded_for("203.0.113.7, 10.0.0.1")
            .with_real_ip("198.51.100.2")
            .with_peer_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));

        assert_eq!(call.client_ip(), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_through_real_ip_and_peer() {
        let call = CallContext::new()
            .with_real_ip(" 198.51.100.2 ")
            .with_peer_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(call.client_ip(), "198.51.100.2");

        let call = CallContext::new().with_peer_addr(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(call.client_ip(), "10.1.2.3");
    }

    #[test]
    fn test_client_ip_unknown_without_metadata() {
        assert_eq!(CallContext::new().client_ip(), FALLBACK_KEY);
        // A malformed chain with an empty first hop is ignored
        let call = CallContext::new().with_forwarded_for(" , 10.0.0.1");
        assert_eq!(call.client_ip(), FALLBACK_KEY);
    }

    #[test]
    fn test_blank_values_are_absent() {
        let call = CallContext::new().with_api_key("   ").with_user_id("");
        assert!(call.api_key.is_none());
        assert!(call.user_id.is_none());
    }
}
