//! RPC procedure adapter for tonic services.

mod guard;
mod layer;

pub use guard::{
    make_rpc_guard, RateLimitInfo, RpcGuard, LIMIT_METADATA, REMAINING_METADATA, RESET_METADATA,
    RETRY_AFTER_METADATA,
};
pub use layer::{RpcLimitLayer, RpcLimitService};
