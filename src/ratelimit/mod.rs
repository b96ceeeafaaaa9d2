//! Admission control: watermark classification, counter and token bucket backends.

mod backend;
mod bucket;
mod core;
mod counter;
mod limiter;

pub use self::backend::{Admission, AdmissionControl};
pub use self::bucket::TokenBucketLimiter;
pub use self::core::{Hook, HookEvent, HookKind, HookMode, Hooks, Level, LimiterCore, Watermarks};
pub use self::counter::{
    CompensationFailure, CompensationHook, CounterLimiter, CounterMode, TimeWindow,
};
pub use self::limiter::{Backend, Limiter, LimiterBuilder, LimiterConfig};
