//! Lease-based mutual exclusion.
//!
//! A [`Lock`] is a stateless handle: constructing one does no I/O, and it
//! caches nothing about the store between calls. The store-side lease is
//! created by [`Lock::lock`] with a TTL and removed by [`Lock::unlock`] or by
//! expiry. There is no heartbeat, so the lease TTL is the only recovery path
//! for a holder that crashes while holding the lock.
//!
//! A holder that stalls past its lease still believes it holds the lock.
//! Every successful acquisition therefore carries a generation number from a
//! companion counter; resources that must reject stale holders check it with
//! a [`FencingGate`].

mod fencing;

pub use fencing::FencingGate;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::error::{KvGuardError, Result};
use crate::store::{Command, KeyValueStore, Reply, StoreError};

/// Suffix of the companion key that issues lease generations.
const FENCE_SUFFIX: &str = "fence";

/// Poll interval used by [`Lock::wait_for_release`] unless configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A successfully acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The locked resource key.
    pub key: String,
    /// Identity the lease was acquired with.
    pub holder: String,
    /// Generation of this acquisition, strictly greater than any earlier one.
    pub generation: u64,
    /// Local wall-clock time of acquisition.
    pub acquired_at: DateTime<Utc>,
    /// Lease duration requested from the store.
    pub ttl: Duration,
}

impl Lease {
    /// Local estimate of when the store will drop the lease.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
    }

    /// Whether the lease has expired by the local clock.
    ///
    /// The store's clock is authoritative; use a [`FencingGate`] to reject
    /// stale holders reliably.
    pub fn is_expired(&self) -> bool {
        self.expires_at().map_or(false, |at| Utc::now() >= at)
    }
}

/// A distributed lock on one resource key, held under one holder identity.
pub struct Lock<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    key: String,
    fence_key: String,
    holder: String,
    lease_ttl: Duration,
    poll_interval: Duration,
}

impl<S: KeyValueStore + ?Sized> Clone for Lock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            fence_key: self.fence_key.clone(),
            holder: self.holder.clone(),
            lease_ttl: self.lease_ttl,
            poll_interval: self.poll_interval,
        }
    }
}

impl<S: KeyValueStore + ?Sized> std::fmt::Debug for Lock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("lease_ttl", &self.lease_ttl)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<S: KeyValueStore + ?Sized> Lock<S> {
    /// Create a lock handle. No store I/O happens here.
    ///
    /// A zero lease TTL is rejected: without it a crashed holder would keep
    /// the lock forever.
    pub fn new(
        store: Arc<S>,
        key: impl Into<String>,
        holder: impl Into<String>,
        lease_ttl: Duration,
    ) -> Result<Self> {
        let key = key.into();
        if lease_ttl.is_zero() {
            return Err(KvGuardError::MissingTtl { key });
        }

        Ok(Self {
            store,
            fence_key: format!("{key}:{FENCE_SUFFIX}"),
            key,
            holder: holder.into(),
            lease_ttl,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Set the interval [`Lock::wait_for_release`] polls at.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(KvGuardError::Config(
                "lock poll interval must be positive".to_string(),
            ));
        }
        self.poll_interval = poll_interval;
        Ok(self)
    }

    /// Create a lock handle with a random UUID v4 holder identity.
    pub fn with_random_holder(store: Arc<S>, key: impl Into<String>, lease_ttl: Duration) -> Result<Self> {
        Self::new(store, key, uuid::Uuid::new_v4().to_string(), lease_ttl)
    }

    /// The resource key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The identity this handle locks and unlocks with.
    pub fn holder_id(&self) -> &str {
        &self.holder
    }

    /// The lease TTL requested on each acquisition.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Try to acquire the lock once.
    ///
    /// Returns [`KvGuardError::AlreadyLocked`] when another lease exists; that
    /// is a normal contention outcome and the caller decides whether to retry.
    pub async fn lock(&self) -> Result<Lease> {
        trace!(key = %self.key, holder = %self.holder, "Attempting to acquire lock");

        // The generation bump rides in the same batch as the acquisition, so a
        // winner's generation is greater than every generation issued before it.
        let replies = self
            .store
            .pipeline(vec![
                Command::SetIfAbsent {
                    key: self.key.clone(),
                    value: self.holder.clone(),
                    ttl: Some(self.lease_ttl),
                },
                Command::IncrementBy {
                    key: self.fence_key.clone(),
                    delta: 1,
                },
            ])
            .await?;

        let mut replies = replies.into_iter();
        let acquired = next_reply(&mut replies)?.into_bool()?;
        let generation = next_reply(&mut replies)?.into_int()?;

        if !acquired {
            debug!(key = %self.key, holder = %self.holder, "Lock is already held");
            return Err(KvGuardError::AlreadyLocked {
                key: self.key.clone(),
            });
        }

        debug!(
            key = %self.key,
            holder = %self.holder,
            generation = generation,
            ttl_ms = self.lease_ttl.as_millis() as u64,
            "Lock acquired"
        );

        Ok(Lease {
            key: self.key.clone(),
            holder: self.holder.clone(),
            generation: generation.max(0) as u64,
            acquired_at: Utc::now(),
            ttl: self.lease_ttl,
        })
    }

    /// Release the lock if, and only if, this handle's identity holds it.
    ///
    /// A lease held by someone else is left in place and
    /// [`KvGuardError::NoRightToUnlock`] is returned. Releasing a lock that no
    /// longer exists returns [`KvGuardError::AlreadyUnlocked`].
    ///
    /// The ownership read and the delete are separate commands. If the lease
    /// expires and is re-acquired between them, the new holder's lease is
    /// deleted; resources that must survive this use a [`FencingGate`].
    pub async fn unlock(&self) -> Result<()> {
        match self.store.get(&self.key).await? {
            None => {
                debug!(key = %self.key, holder = %self.holder, "Lock already released");
                Err(KvGuardError::AlreadyUnlocked {
                    key: self.key.clone(),
                })
            }
            Some(current) if current != self.holder => {
                warn!(
                    key = %self.key,
                    holder = %self.holder,
                    current = %current,
                    "Refusing to unlock a lock held by another holder"
                );
                Err(KvGuardError::NoRightToUnlock {
                    key: self.key.clone(),
                    holder: self.holder.clone(),
                    current,
                })
            }
            Some(_) => {
                if self.store.delete(&self.key).await? == 0 {
                    debug!(key = %self.key, holder = %self.holder, "Lease expired before release");
                    return Err(KvGuardError::AlreadyUnlocked {
                        key: self.key.clone(),
                    });
                }
                debug!(key = %self.key, holder = %self.holder, "Lock released");
                Ok(())
            }
        }
    }

    /// Whether any holder currently has the lock.
    pub async fn check(&self) -> Result<bool> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// The identity of the current holder, if any.
    pub async fn holder(&self) -> Result<Option<String>> {
        Ok(self.store.get(&self.key).await?)
    }

    /// Poll every `poll_interval` until the lock is free.
    ///
    /// Polling uses a fixed interval with no backoff or jitter, so many
    /// waiters on a hot key wake together. Drop the future to stop waiting.
    pub async fn wait(&self, poll_interval: Duration) -> Result<()> {
        if poll_interval.is_zero() {
            return Err(KvGuardError::Config(
                "lock poll interval must be positive".to_string(),
            ));
        }

        while self.check().await? {
            trace!(key = %self.key, "Lock still held, waiting");
            tokio::time::sleep(poll_interval).await;
        }
        Ok(())
    }

    /// [`Lock::wait`] at this handle's poll interval.
    pub async fn wait_for_release(&self) -> Result<()> {
        self.wait(self.poll_interval).await
    }

    /// Like [`Lock::wait`], giving up after `timeout`.
    pub async fn wait_timeout(&self, poll_interval: Duration, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.wait(poll_interval)).await {
            Ok(result) => result,
            Err(_) => Err(KvGuardError::WaitTimeout {
                key: self.key.clone(),
                waited: timeout,
            }),
        }
    }
}

fn next_reply(replies: &mut impl Iterator<Item = Reply>) -> Result<Reply> {
    replies
        .next()
        .ok_or_else(|| StoreError::UnexpectedReply("pipeline returned too few replies".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BucketParams, BucketState, ExpireCondition, MemoryStore, StoreResult};
    use futures::future::join_all;
    use tokio_test::assert_ok;

    fn lock(store: &Arc<MemoryStore>, holder: &str) -> Lock<MemoryStore> {
        Lock::new(store.clone(), "locks:reindex", holder, Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = Lock::new(store, "locks:reindex", "a", Duration::ZERO).unwrap_err();
        assert!(matches!(err, KvGuardError::MissingTtl { .. }));
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");

        let lease = a.lock().await.unwrap();
        assert_eq!(lease.holder, "a");
        assert_eq!(lease.key, "locks:reindex");
        assert!(a.check().await.unwrap());
        assert_eq!(a.holder().await.unwrap(), Some("a".to_string()));

        assert_ok!(a.unlock().await);
        assert!(!a.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_lock_is_contention() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");
        let b = lock(&store, "b");

        a.lock().await.unwrap();
        let err = b.lock().await.unwrap_err();

        assert!(matches!(err, KvGuardError::AlreadyLocked { .. }));
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let locks: Vec<_> = (0..32).map(|i| lock(&store, &format!("holder-{i}"))).collect();

        let results = join_all(locks.iter().map(|l| l.lock())).await;

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, KvGuardError::AlreadyLocked { .. })));
    }

    #[tokio::test]
    async fn test_non_holder_cannot_unlock() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");
        let b = lock(&store, "b");

        a.lock().await.unwrap();
        let err = b.unlock().await.unwrap_err();

        assert!(matches!(
            err,
            KvGuardError::NoRightToUnlock { ref current, .. } if current == "a"
        ));
        assert_eq!(a.holder().await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_double_unlock_reports_already_unlocked() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");

        a.lock().await.unwrap();
        assert_ok!(a.unlock().await);

        let err = a.unlock().await.unwrap_err();
        assert!(matches!(err, KvGuardError::AlreadyUnlocked { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_unlock() {
        let store = Arc::new(MemoryStore::new());
        let a = Lock::new(store.clone(), "locks:job", "a", Duration::from_secs(1)).unwrap();
        let b = Lock::new(store.clone(), "locks:job", "b", Duration::from_secs(1)).unwrap();

        a.lock().await.unwrap();
        assert!(a.check().await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(!a.check().await.unwrap());
        assert_ok!(b.lock().await);
    }

    #[tokio::test]
    async fn test_generations_increase() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");
        let b = lock(&store, "b");

        let first = a.lock().await.unwrap();
        let _ = b.lock().await;
        a.unlock().await.unwrap();
        let second = b.lock().await.unwrap();

        assert!(second.generation > first.generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_holder_is_fenced() {
        let store = Arc::new(MemoryStore::new());
        let a = Lock::new(store.clone(), "locks:job", "a", Duration::from_secs(1)).unwrap();
        let b = Lock::new(store.clone(), "locks:job", "b", Duration::from_secs(1)).unwrap();
        let gate = FencingGate::new("locks:job");

        let stale = a.lock().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = b.lock().await.unwrap();

        assert_ok!(gate.admit(&fresh));
        let err = gate.admit(&stale).unwrap_err();
        assert!(matches!(err, KvGuardError::StaleLease { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_after_release() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");
        let b = lock(&store, "b");
        a.lock().await.unwrap();

        let releaser = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            releaser.unlock().await.unwrap();
        });

        assert_ok!(b.wait(Duration::from_millis(50)).await);
        assert!(!b.check().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");
        let b = lock(&store, "b");
        a.lock().await.unwrap();

        let err = b
            .wait_timeout(Duration::from_millis(50), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, KvGuardError::WaitTimeout { .. }));
        assert!(a.check().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_release_uses_configured_interval() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");
        let b = lock(&store, "b")
            .with_poll_interval(Duration::from_secs(1))
            .unwrap();
        assert_eq!(a.poll_interval(), DEFAULT_POLL_INTERVAL);
        a.lock().await.unwrap();

        let releaser = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            releaser.unlock().await.unwrap();
        });

        let started = tokio::time::Instant::now();
        assert_ok!(b.wait_for_release().await);
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        assert!(matches!(
            b.clone().with_poll_interval(Duration::ZERO),
            Err(KvGuardError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unlock_after_lease_vanished_reports_already_unlocked() {
        let store = Arc::new(ExpiresAfterRead(MemoryStore::new()));
        let a = Lock::new(store.clone(), "locks:reindex", "a", Duration::from_secs(10)).unwrap();
        a.lock().await.unwrap();

        let err = a.unlock().await.unwrap_err();
        assert!(matches!(err, KvGuardError::AlreadyUnlocked { .. }));
    }

    /// A store where every key disappears right after it is read, as if its
    /// TTL ran out between a `get` and the next command.
    struct ExpiresAfterRead(MemoryStore);

    #[async_trait::async_trait]
    impl KeyValueStore for ExpiresAfterRead {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
            self.0.set_if_absent(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            let value = self.0.get(key).await?;
            self.0.delete(key).await?;
            Ok(value)
        }
        async fn delete(&self, key: &str) -> StoreResult<u64> {
            self.0.delete(key).await
        }
        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.0.exists(key).await
        }
        async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
            self.0.increment_by(key, delta).await
        }
        async fn expire(&self, key: &str, ttl: Duration, condition: ExpireCondition) -> StoreResult<bool> {
            self.0.expire(key, ttl, condition).await
        }
        async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
            self.0.pipeline(commands).await
        }
        async fn throttle(&self, key: &str, params: &BucketParams, cost: i64) -> StoreResult<BucketState> {
            self.0.throttle(key, params, cost).await
        }
    }

    #[tokio::test]
    async fn test_wait_rejects_zero_interval() {
        let store = Arc::new(MemoryStore::new());
        let a = lock(&store, "a");

        assert!(matches!(
            a.wait(Duration::ZERO).await,
            Err(KvGuardError::Config(_))
        ));
    }

    #[test]
    fn test_lease_expiry_estimate() {
        let lease = Lease {
            key: "k".to_string(),
            holder: "a".to_string(),
            generation: 1,
            acquired_at: Utc::now() - chrono::Duration::seconds(5),
            ttl: Duration::from_secs(1),
        };
        assert!(lease.is_expired());
        assert!(lease.expires_at().is_some());
    }
}
