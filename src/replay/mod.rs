//! Replay pipeline for show sessions

mod interceptor;
mod snapshot;

pub use interceptor::{
    not_found, InterceptorState, ReplayHandle, ReplayInterceptor, ReplayOutcome, NOT_FOUND_BODY,
};
pub use snapshot::{ReplaySnapshot, ReplayStats};
