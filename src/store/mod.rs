//! Store adapter abstraction.
//!
//! Every primitive in this crate talks to a shared key-value store through the
//! [`KeyValueStore`] trait. The store is responsible for linearizable
//! single-key atomics and for executing pipelines as one all-or-nothing
//! batch; nothing above this layer adds ordering of its own.

mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The value stored at the key cannot be used by the requested command.
    #[error("Wrong value type at key '{key}'")]
    WrongType { key: String },

    /// An increment would overflow a signed 64-bit integer.
    #[error("Increment overflow at key '{key}'")]
    Overflow { key: String },

    /// A command in a pipeline failed and the batch was rolled back.
    #[error("Pipeline aborted at command {index}: {source}")]
    PipelineAborted {
        index: usize,
        #[source]
        source: Box<StoreError>,
    },

    /// A command argument was rejected by the store.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A reply did not have the expected shape.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The store could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// When an `expire` call is allowed to set the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireCondition {
    /// Always set the TTL.
    Always,
    /// Only set the TTL when the key currently has none (`EXPIRE ... NX`).
    IfNoTtl,
}

/// Parameters of a server-side token bucket (`CL.THROTTLE key burst count period`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    /// Tokens available beyond the steady-state one.
    pub burst: i64,
    /// Tokens refilled per period.
    pub refill_count: i64,
    /// Length of a refill period.
    pub refill_period: Duration,
}

impl BucketParams {
    /// Total number of tokens the bucket can hold. Saturates at `i64::MAX`.
    pub fn capacity(&self) -> i64 {
        self.burst.saturating_add(1)
    }

    /// Time between two refilled tokens, in nanoseconds, never below one.
    ///
    /// `None` when the refill count is not positive.
    pub fn emission_nanos(&self) -> Option<i128> {
        if self.refill_count <= 0 {
            return None;
        }
        Some((self.refill_period.as_nanos() as i128 / self.refill_count as i128).max(1))
    }

    /// Time a full bucket takes to refill from empty, in nanoseconds.
    ///
    /// `None` when the parameters are unusable: a negative burst, a
    /// non-positive refill count or period, a burst with no room for the
    /// steady-state token, or a refill time beyond `u64` nanoseconds.
    pub fn tolerance_nanos(&self) -> Option<i128> {
        if self.burst < 0 || self.refill_period.is_zero() {
            return None;
        }
        let capacity = self.burst.checked_add(1)?;
        let tolerance = self.emission_nanos()?.checked_mul(capacity as i128)?;
        (tolerance <= u64::MAX as i128).then_some(tolerance)
    }
}

/// State of a token bucket as returned by one atomic evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whether the request was refused.
    pub blocked: bool,
    /// Maximum capacity of the bucket.
    pub limit: i64,
    /// Tokens left after this evaluation.
    pub remaining: i64,
    /// How long to wait before retrying, if a retry can ever succeed.
    pub retry_after: Option<Duration>,
    /// How long until the bucket is full again.
    pub reset_after: Duration,
}

impl BucketState {
    /// Decode the five-element `CL.THROTTLE` reply
    /// `[blocked, limit, remaining, retry_after_secs, reset_after_secs]`.
    pub fn from_reply(reply: &[i64]) -> StoreResult<Self> {
        let [blocked, limit, remaining, retry_after, reset_after] = reply else {
            return Err(StoreError::UnexpectedReply(format!(
                "expected 5 integers from throttle, got {}",
                reply.len()
            )));
        };

        let retry_after = match *retry_after {
            r if r < 0 => None,
            r => Some(Duration::from_secs(r as u64)),
        };

        Ok(Self {
            blocked: *blocked != 0,
            limit: *limit,
            remaining: *remaining,
            retry_after,
            reset_after: Duration::from_secs((*reset_after).max(0) as u64),
        })
    }
}

/// A single command inside a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetIfAbsent {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
    Exists {
        key: String,
    },
    IncrementBy {
        key: String,
        delta: i64,
    },
    Expire {
        key: String,
        ttl: Duration,
        condition: ExpireCondition,
    },
    Throttle {
        key: String,
        params: BucketParams,
        cost: i64,
    },
}

impl Command {
    /// The key this command operates on.
    pub fn key(&self) -> &str {
        match self {
            Command::SetIfAbsent { key, .. }
            | Command::Get { key }
            | Command::Delete { key }
            | Command::Exists { key }
            | Command::IncrementBy { key, .. }
            | Command::Expire { key, .. }
            | Command::Throttle { key, .. } => key,
        }
    }
}

/// Reply to a single pipelined command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Bool(bool),
    Int(i64),
    Value(Option<String>),
    Bucket(BucketState),
}

impl Reply {
    pub fn into_bool(self) -> StoreResult<bool> {
        match self {
            Reply::Bool(b) => Ok(b),
            other => Err(StoreError::UnexpectedReply(format!("expected bool, got {other:?}"))),
        }
    }

    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            Reply::Int(i) => Ok(i),
            other => Err(StoreError::UnexpectedReply(format!("expected integer, got {other:?}"))),
        }
    }

    pub fn into_bucket(self) -> StoreResult<BucketState> {
        match self {
            Reply::Bucket(state) => Ok(state),
            other => Err(StoreError::UnexpectedReply(format!("expected bucket state, got {other:?}"))),
        }
    }
}

/// Atomic primitives exposed by a shared key-value store.
///
/// Implementations must make every single-key command linearizable and must
/// apply [`KeyValueStore::pipeline`] as one batch that no other client can
/// interleave with, rolling back entirely if any command fails.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value` only if it does not exist. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool>;

    /// Read the value at `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete `key`, returning the number of keys removed.
    async fn delete(&self, key: &str) -> StoreResult<u64>;

    /// Whether `key` exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Add a signed `delta` to the integer at `key`, creating it at zero first.
    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Set a TTL on `key`. Returns whether the TTL was applied.
    async fn expire(&self, key: &str, ttl: Duration, condition: ExpireCondition) -> StoreResult<bool>;

    /// Execute `commands` as one all-or-nothing batch.
    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>>;

    /// Atomically evaluate the token bucket at `key` for a request of `cost` tokens.
    async fn throttle(&self, key: &str, params: &BucketParams, cost: i64) -> StoreResult<BucketState>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        (**self).exists(key).await
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        (**self).increment_by(key, delta).await
    }

    async fn expire(&self, key: &str, ttl: Duration, condition: ExpireCondition) -> StoreResult<bool> {
        (**self).expire(key, ttl, condition).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        (**self).pipeline(commands).await
    }

    async fn throttle(&self, key: &str, params: &BucketParams, cost: i64) -> StoreResult<BucketState> {
        (**self).throttle(key, params, cost).await
    }
}
