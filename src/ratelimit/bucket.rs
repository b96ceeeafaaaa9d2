//! Token bucket admission control evaluated by the store.
//!
//! Refill math runs inside the store's atomic throttle command, so there is
//! no read-then-write race on the client and nothing to compensate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{Admission, AdmissionControl};
use super::core::{LimiterCore, Watermarks};
use crate::error::{KvGuardError, Result};
use crate::store::{BucketParams, BucketState, Command, ExpireCondition, KeyValueStore, StoreError};

/// Admission control backed by a server-side token bucket.
pub struct TokenBucketLimiter<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    core: LimiterCore,
    params: BucketParams,
    lease_ttl: Option<Duration>,
}

impl<S: KeyValueStore + ?Sized> std::fmt::Debug for TokenBucketLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("core", &self.core)
            .field("params", &self.params)
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

impl<S: KeyValueStore + ?Sized> TokenBucketLimiter<S> {
    /// Create a token bucket limiter. No store I/O happens here.
    pub fn new(
        store: Arc<S>,
        core: LimiterCore,
        params: BucketParams,
        lease_ttl: Option<Duration>,
    ) -> Result<Self> {
        validate_params(&params)?;
        if lease_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(KvGuardError::MissingTtl {
                key: core.key().to_string(),
            });
        }

        Ok(Self {
            store,
            core,
            params,
            lease_ttl,
        })
    }

    pub fn key(&self) -> &str {
        self.core.key()
    }

    pub fn params(&self) -> BucketParams {
        self.params
    }

    pub fn watermarks(&self) -> Watermarks {
        self.core.watermarks()
    }

    /// Number of tokens the bucket holds when full: one more than the burst.
    pub fn capacity(&self) -> i64 {
        self.params.capacity()
    }

    /// Evaluate the bucket for a request of `cost` tokens.
    ///
    /// With a lease TTL configured, the evaluation and the key's expire are
    /// sent as one pipeline so the bucket cannot outlive the lease.
    pub async fn throttle(&self, cost: i64) -> Result<BucketState> {
        let key = self.core.key();
        let state = match self.lease_ttl {
            None => self.store.throttle(key, &self.params, cost).await?,
            Some(ttl) => {
                let replies = self
                    .store
                    .pipeline(vec![
                        Command::Throttle {
                            key: key.to_string(),
                            params: self.params,
                            cost,
                        },
                        Command::Expire {
                            key: key.to_string(),
                            ttl,
                            condition: ExpireCondition::Always,
                        },
                    ])
                    .await?;
                replies
                    .into_iter()
                    .next()
                    .ok_or_else(|| StoreError::UnexpectedReply("empty pipeline reply".to_string()))?
                    .into_bucket()?
            }
        };

        let used = state.limit - state.remaining;
        let level = self.core.classify(used, state.blocked).await;

        trace!(
            key = %key,
            cost = cost,
            blocked = state.blocked,
            remaining = state.remaining,
            level = ?level,
            "Bucket evaluated"
        );

        Ok(state)
    }

    /// Tokens currently available, read with a zero-cost evaluation.
    pub async fn remaining(&self) -> Result<i64> {
        let state = self.store.throttle(self.core.key(), &self.params, 0).await?;
        Ok(state.remaining)
    }

    /// Delete the bucket so it starts full again.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete(self.core.key()).await?;
        debug!(key = %self.core.key(), "Bucket reset");
        Ok(())
    }
}

pub(crate) fn validate_params(params: &BucketParams) -> Result<()> {
    if params.burst < 0 {
        return Err(KvGuardError::InvalidBucket(format!(
            "burst must not be negative, got {}",
            params.burst
        )));
    }
    if params.refill_count <= 0 {
        return Err(KvGuardError::InvalidBucket(format!(
            "refill count must be positive, got {}",
            params.refill_count
        )));
    }
    if params.refill_period.is_zero() {
        return Err(KvGuardError::InvalidBucket(
            "refill period must be positive".to_string(),
        ));
    }
    if params.tolerance_nanos().is_none() {
        return Err(KvGuardError::InvalidBucket(format!(
            "burst {} refilled at {} per {:?} is out of range",
            params.burst, params.refill_count, params.refill_period
        )));
    }
    Ok(())
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> AdmissionControl for TokenBucketLimiter<S> {
    async fn admit(&self, amount: i64) -> Result<Admission> {
        let state = self.throttle(amount).await?;
        Ok(Admission {
            admitted: !state.blocked,
            level: state.limit - state.remaining,
            remaining: state.remaining.max(0),
            retry_after: state.retry_after,
        })
    }

    async fn reset(&self) -> Result<()> {
        TokenBucketLimiter::reset(self).await
    }

    fn key(&self) -> &str {
        self.core.key()
    }
}
