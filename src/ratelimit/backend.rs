//! Admission control trait for abstracting the counter and token bucket backends.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the caller may proceed.
    pub admitted: bool,
    /// The level observed by the check (counter value, or tokens in use).
    pub level: i64,
    /// Capacity left after the check, never negative.
    pub remaining: i64,
    /// When a retry may succeed, if the backend knows.
    pub retry_after: Option<Duration>,
}

/// Trait for limiter implementations.
///
/// This trait abstracts over both the `CounterLimiter` and the
/// `TokenBucketLimiter` so callers can hold either behind one type.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Try to consume `amount` units of capacity.
    async fn admit(&self, amount: i64) -> Result<Admission>;

    /// Drop all store-side state for this limiter.
    async fn reset(&self) -> Result<()>;

    /// The store key this limiter uses.
    fn key(&self) -> &str;
}
