//! The named policies a service enforces.
//!
//! Each policy owns its own [`WindowStore`](super::WindowStore); quotas never
//! share state. Every adapter installed for a given policy must share that
//! policy's limiter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::clock::{Clock, SystemClock};
use super::limiter::Limiter;
use super::sweeper::{Sweeper, SweeperHandle};
use crate::config::NamedPolicies;

/// Limiters for the global, api-key, message-send, login and webhook policies.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    global: Arc<Limiter>,
    api_key: Arc<Limiter>,
    message_send: Arc<Limiter>,
    login: Arc<Limiter>,
    webhook: Arc<Limiter>,
    clock: Arc<dyn Clock>,
}

impl PolicyRegistry {
    /// Build one limiter per named policy using the system clock.
    pub fn new(policies: NamedPolicies) -> Self {
        Self::with_clock(policies, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(policies: NamedPolicies, clock: Arc<dyn Clock>) -> Self {
        let build = |policy| Arc::new(Limiter::with_clock(policy, clock.clone()));

        let registry = Self {
            global: build(policies.global),
            api_key: build(policies.api_key),
            message_send: build(policies.message_send),
            login: build(policies.login),
            webhook: build(policies.webhook),
            clock: clock.clone(),
        };

        for limiter in registry.limiters() {
            let policy = limiter.policy();
            info!(
                policy = %policy.name(),
                window_secs = policy.window().as_secs(),
                max = policy.max(),
                "Registered rate limit policy"
            );
        }

        registry
    }

    pub fn global(&self) -> Arc<Limiter> {
        self.global.clone()
    }

    pub fn api_key(&self) -> Arc<Limiter> {
        self.api_key.clone()
    }

    pub fn message_send(&self) -> Arc<Limiter> {
        self.message_send.clone()
    }

    pub fn login(&self) -> Arc<Limiter> {
        self.login.clone()
    }

    pub fn webhook(&self) -> Arc<Limiter> {
        self.webhook.clone()
    }

    /// Look up a limiter by policy name.
    pub fn get(&self, name: &str) -> Option<Arc<Limiter>> {
        self.limiters()
            .into_iter()
            .find(|l| l.policy().name() == name)
            .cloned()
    }

    /// Number of live records in each policy's store, by policy name.
    ///
    /// Records past their reset but not yet swept are not counted.
    pub fn record_counts(&self) -> BTreeMap<String, usize> {
        let now = self.clock.now();
        self.limiters()
            .into_iter()
            .map(|l| (l.policy().name().to_string(), l.store().live_len(now)))
            .collect()
    }

    /// Start one sweeper covering every policy's store.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        self.limiters()
            .into_iter()
            .fold(Sweeper::with_clock(interval, self.clock.clone()), |sweeper, l| {
                sweeper.watch(l.policy().name(), l.store().clone())
            })
            .spawn()
    }

    fn limiters(&self) -> [&Arc<Limiter>; 5] {
        [
            &self.global,
            &self.api_key,
            &self.message_send,
            &self.login,
            &self.webhook,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoliciesConfig;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::WEBHOOK_KEY;
    use std::time::Instant;

    fn registry(clock: &ManualClock) -> PolicyRegistry {
        let policies = PoliciesConfig::default().resolve().unwrap();
        PolicyRegistry::with_clock(policies, Arc::new(clock.clone()))
    }

    #[test]
    fn test_policies_have_independent_stores() {
        let registry = registry(&ManualClock::default());

        for _ in 0..5 {
            assert!(registry.login().admit("ip:1.2.3.4").allowed);
        }
        assert!(!registry.login().admit("ip:1.2.3.4").allowed);

        let global = registry.global().admit("ip:1.2.3.4");
        assert!(global.allowed);
        assert_eq!(global.remaining, 999);

        let counts = registry.record_counts();
        assert_eq!(counts["login"], 1);
        assert_eq!(counts["global"], 1);
        assert_eq!(counts["webhook"], 0);
    }

    #[test]
    fn test_get_by_name() {
        let registry = registry(&ManualClock::default());

        assert!(Arc::ptr_eq(&registry.get("login").unwrap(), &registry.login()));
        assert!(Arc::ptr_eq(&registry.get("message_send").unwrap(), &registry.message_send()));
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_spawned_sweeper_covers_every_store() {
        let clock = ManualClock::new(Instant::now());
        let registry = registry(&clock);

        registry.webhook().admit("webhook:shared");
        registry.login().admit("ip:1.2.3.4");
        clock.advance(Duration::from_secs(16 * 60));

        let handle = registry.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await.unwrap();

        assert!(registry.webhook().store().is_empty());
        assert!(registry.login().store().is_empty());
    }

    #[test]
    fn test_record_counts_skip_expired_records() {
        let clock = ManualClock::new(Instant::now());
        let registry = registry(&clock);

        registry.webhook().admit(WEBHOOK_KEY);
        registry.login().admit("ip:1.2.3.4");
        assert_eq!(registry.record_counts()["webhook"], 1);

        clock.advance(Duration::from_secs(120));

        let counts = registry.record_counts();
        assert_eq!(counts["webhook"], 0);
        assert_eq!(counts["login"], 1);
        // Still held until the sweeper runs
        assert_eq!(registry.webhook().store().len(), 1);
    }
}
