//! Rate limiting logic and state management.
//!
//! State is process-local. When a service runs as several instances, each
//! one enforces its own quota; sharing a quota across instances needs a
//! networked counter behind the [`Admission`] trait.

mod call;
mod clock;
mod limiter;
mod policy;
mod registry;
mod store;
mod sweeper;

pub use call::{
    AuthenticatedUser, CallContext, API_KEY_HEADER, FALLBACK_KEY, FORWARDED_FOR_HEADER,
    REAL_IP_HEADER,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{check, Admission, Decision, Limiter, Verdict};
pub use policy::{
    BypassFn, BypassRule, FailureMode, KeyFn, KeyStrategy, Policy, HEALTH_CHECK_PATHS, WEBHOOK_KEY,
};
pub use registry::PolicyRegistry;
pub use store::{WindowRecord, WindowStore, MAX_WINDOW};
pub use sweeper::{Sweeper, SweeperHandle, DEFAULT_SWEEP_INTERVAL};
