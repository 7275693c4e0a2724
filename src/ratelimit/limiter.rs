//! Core admission decision.
//!
//! The algorithm is a fixed-window counter: each key gets a window that opens
//! on its first call and lasts `policy.window()`. Memory and time per check
//! are O(1). The known cost is that a client can land up to twice the quota
//! across a window boundary (a full quota at the end of one window and a full
//! quota at the start of the next). That is acceptable for abuse mitigation;
//! a sliding-log or token-bucket variant can replace [`check`] without
//! changing any caller.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::call::CallContext;
use super::clock::{Clock, SystemClock};
use super::policy::{FailureMode, Policy};
use super::store::{WindowRecord, WindowStore};
use crate::error::Result;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Quota of the policy that produced this verdict
    pub limit: u64,
    /// Calls left in the current window after this one
    pub remaining: u64,
    /// Time until the current window resets
    pub reset_in: Duration,
}

impl Verdict {
    /// Time until reset in whole milliseconds.
    pub fn reset_in_ms(&self) -> u64 {
        self.reset_in.as_millis() as u64
    }

    /// Unix time, in seconds, at which the window resets (rounded up).
    ///
    /// Computed from the system wall clock plus `reset_in`, not from the
    /// limiter's [`Clock`]. Under a [`ManualClock`](super::ManualClock) only
    /// `reset_in` follows simulated time.
    pub fn reset_at_epoch_secs(&self) -> i64 {
        let secs = self.reset_in.as_secs() + u64::from(self.reset_in.subsec_nanos() > 0);
        Utc::now().timestamp() + secs as i64
    }
}

/// Decide whether the call identified by `key` is admitted at `now`.
///
/// The lookup, the decision and the write happen under the store's lock for
/// `key`, so concurrent checks for one key never both see spare quota that
/// only one of them may use. Rejected calls do not increment the counter.
pub fn check(policy: &Policy, store: &WindowStore, key: &str, now: Instant) -> Verdict {
    let limit = policy.max();

    store.update(key, |slot| {
        if let Some(record) = slot.as_mut().filter(|r| r.is_live(now)) {
            if record.count >= limit {
                return Verdict {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_in: record.reset_in(now),
                };
            }

            record.count += 1;
            return Verdict {
                allowed: true,
                limit,
                remaining: limit - record.count,
                reset_in: record.reset_in(now),
            };
        }

        // Absent or stale: this call opens a fresh window
        *slot = Some(WindowRecord::open(now, policy.window()));
        Verdict {
            allowed: true,
            limit,
            remaining: limit - 1,
            reset_in: policy.window(),
        }
    })
}

/// A source of admission verdicts for one policy.
///
/// [`Limiter`] is the in-process implementation. A shared networked counter
/// would implement this trait too; its failures surface as `Err` and are
/// resolved by the policy's [`FailureMode`].
pub trait Admission: Send + Sync {
    /// The policy this backend enforces.
    fn policy(&self) -> &Policy;

    /// Account one call for `key` and return the verdict.
    fn check(&self, key: &str) -> Result<Verdict>;

    /// Run the full admission flow for a call: bypass, keying, check and
    /// failure handling.
    fn evaluate(&self, call: &CallContext) -> Decision {
        let policy = self.policy();

        if policy.bypasses(call) {
            trace!(policy = %policy.name(), path = ?call.path, "Call bypasses rate limit");
            return Decision::Bypassed;
        }

        let key = policy.key_of(call);
        match self.check(&key) {
            Ok(verdict) if verdict.allowed => Decision::Admitted(verdict),
            Ok(verdict) => Decision::Rejected(verdict),
            Err(e) => match policy.failure_mode() {
                FailureMode::Open => {
                    warn!(policy = %policy.name(), key = %key, error = %e, "Admission backend failed, admitting call");
                    Decision::FailedOpen
                }
                FailureMode::Closed => {
                    warn!(policy = %policy.name(), key = %key, error = %e, "Admission backend failed, rejecting call");
                    Decision::FailedClosed
                }
            },
        }
    }
}

/// What an adapter should do with a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The policy exempts this call; forward it without metadata
    Bypassed,
    /// Forward the call and report the verdict
    Admitted(Verdict),
    /// Short-circuit the call with the policy's rejection
    Rejected(Verdict),
    /// The backend failed under a fail-open policy; forward without metadata
    FailedOpen,
    /// The backend failed under a fail-closed policy; refuse the call
    FailedClosed,
}

/// In-process limiter: one policy, one store, one clock.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct Limiter {
    policy: Policy,
    store: Arc<WindowStore>,
    clock: Arc<dyn Clock>,
}

impl Limiter {
    /// Create a limiter with its own empty store and the system clock.
    pub fn new(policy: Policy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock::new()))
    }

    /// Create a limiter with its own empty store and the given clock.
    pub fn with_clock(policy: Policy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            store: Arc::new(WindowStore::new()),
            clock,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The store holding this limiter's window records.
    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    /// Account one call for `key` at the clock's current time.
    pub fn admit(&self, key: &str) -> Verdict {
        let now = self.clock.now();
        let verdict = check(&self.policy, &self.store, key, now);

        trace!(
            policy = %self.policy.name(),
            key = %key,
            allowed = verdict.allowed,
            remaining = verdict.remaining,
            "Checked rate limit"
        );

        if !verdict.allowed {
            debug!(
                policy = %self.policy.name(),
                key = %key,
                reset_in_ms = verdict.reset_in_ms(),
                "Rate limit exceeded"
            );
        }

        verdict
    }

    /// Current count for a key, ignoring stale records.
    pub fn count_of(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.store
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.count)
    }

    /// Clear all records.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.clear();
    }
}

impl Admission for Limiter {
    fn policy(&self) -> &Policy {
        &self.policy
    }

    fn check(&self, key: &str) -> Result<Verdict> {
        Ok(self.admit(key))
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("policy", &self.policy)
            .field("records", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::policy::{BypassRule, KeyStrategy};
    use std::sync::Barrier;

    fn policy(max: u64) -> Policy {
        Policy::new("test", Duration::from_secs(60), max, KeyStrategy::ClientIp).unwrap()
    }

    fn limiter(max: u64) -> (Limiter, ManualClock) {
        let clock = ManualClock::default();
        (Limiter::with_clock(policy(max), Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_quota_enforcement() {
        let store = WindowStore::new();
        let policy = policy(3);
        let now = Instant::now();

        let remaining: Vec<u64> = (0..3)
            .map(|_| check(&policy, &store, "k", now))
            .inspect(|v| assert!(v.allowed))
            .map(|v| v.remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let fourth = check(&policy, &store, "k", now + Duration::from_secs(1));
        assert!(!fourth.allowed);
        assert_eq!(fourth.remaining, 0);
        assert_eq!(fourth.reset_in, Duration::from_secs(59));
        assert!(fourth.reset_in_ms() <= 60_000);
    }

    #[test]
    fn test_first_call_reports_full_window() {
        let store = WindowStore::new();
        let verdict = check(&policy(3), &store, "k", Instant::now());
        assert_eq!(verdict.reset_in_ms(), 60_000);
        assert_eq!(verdict.limit, 3);
    }

    #[test]
    fn test_reset_epoch_rounds_up() {
        let verdict = Verdict {
            allowed: true,
            limit: 3,
            remaining: 2,
            reset_in: Duration::from_millis(1500),
        };
        let now = Utc::now().timestamp();
        let reset = verdict.reset_at_epoch_secs();
        assert!(reset >= now + 2 && reset <= now + 3);
    }

    #[test]
    fn test_rejection_does_not_increment() {
        let (limiter, _clock) = limiter(2);

        limiter.admit("k");
        limiter.admit("k");
        for _ in 0..5 {
            assert!(!limiter.admit("k").allowed);
        }

        assert_eq!(limiter.count_of("k"), Some(2));
    }

    #[test]
    fn test_window_rollover() {
        let (limiter, clock) = limiter(3);

        for _ in 0..10 {
            limiter.admit("k");
        }
        assert!(!limiter.admit("k").allowed);

        clock.advance(Duration::from_secs(60));

        let verdict = limiter.admit("k");
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 2);
        assert_eq!(verdict.reset_in, Duration::from_secs(60));
        assert_eq!(limiter.count_of("k"), Some(1));
    }

    #[test]
    fn test_stale_record_is_never_used() {
        let store = WindowStore::new();
        let policy = policy(3);
        let now = Instant::now();

        store.put(
            "k",
            WindowRecord {
                count: 3,
                reset_at: now,
            },
        );

        let verdict = check(&policy, &store, "k", now);
        assert!(verdict.allowed);
        assert_eq!(store.get("k").map(|r| r.count), Some(1));
    }

    #[test]
    fn test_key_isolation() {
        let (limiter, _clock) = limiter(2);

        limiter.admit("a");
        limiter.admit("a");
        assert!(!limiter.admit("a").allowed);

        let other = limiter.admit("b");
        assert!(other.allowed);
        assert_eq!(other.remaining, 1);
    }

    #[test]
    fn test_bypass_does_not_touch_store() {
        let policy = policy(1).with_bypass(BypassRule::Paths(vec!["/health".to_string()]));
        let limiter = Limiter::new(policy);
        let call = CallContext::new().with_path("/health").with_forwarded_for("9.9.9.9");

        for _ in 0..5 {
            assert_eq!(limiter.evaluate(&call), Decision::Bypassed);
        }

        assert!(limiter.store().get("ip:9.9.9.9").is_none());
        assert!(limiter.store().is_empty());
    }

    #[test]
    fn test_evaluate_admits_then_rejects() {
        let limiter = Limiter::new(policy(1));
        let call = CallContext::new().with_forwarded_for("9.9.9.9");

        assert!(matches!(limiter.evaluate(&call), Decision::Admitted(v) if v.remaining == 0));
        assert!(matches!(limiter.evaluate(&call), Decision::Rejected(v) if !v.allowed));
        assert_eq!(limiter.count_of("ip:9.9.9.9"), Some(1));
    }

    struct BrokenBackend(Policy);

    impl Admission for BrokenBackend {
        fn policy(&self) -> &Policy {
            &self.0
        }

        fn check(&self, _key: &str) -> Result<Verdict> {
            Err(TurnstileError::Backend("counter store unreachable".to_string()))
        }
    }

    #[test]
    fn test_backend_failure_fails_open_by_default() {
        let backend = BrokenBackend(policy(1));
        assert_eq!(backend.evaluate(&CallContext::new()), Decision::FailedOpen);
    }

    #[test]
    fn test_backend_failure_fails_closed_when_configured() {
        let backend = BrokenBackend(policy(1).with_failure_mode(FailureMode::Closed));
        assert_eq!(backend.evaluate(&CallContext::new()), Decision::FailedClosed);
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_quota() {
        const QUOTA: u64 = 25;
        const EXTRA: usize = 15;
        let threads = QUOTA as usize + EXTRA;

        let limiter = Limiter::new(policy(QUOTA));
        let barrier = Barrier::new(threads);

        let admitted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        limiter.admit("hot-key").allowed
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });

        assert_eq!(admitted, QUOTA as usize);
        assert_eq!(limiter.count_of("hot-key"), Some(QUOTA));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_admit_exactly_quota() {
        let limiter = Arc::new(Limiter::new(policy(10)));

        let tasks = (0..30).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit("k").allowed })
        });

        let results = futures::future::join_all(tasks).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(admitted, 10);
    }
}
