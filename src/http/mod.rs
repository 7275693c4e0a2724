//! HTTP pipeline adapter and server.

mod guard;
mod server;

pub use guard::{
    call_context, enforce, make_http_guard, HttpGuard, RejectionBody, LIMIT_HEADER,
    REMAINING_HEADER, RESET_HEADER,
};
pub use server::{build_router, HttpServer};
