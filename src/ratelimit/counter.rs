//! Counter-based admission control.
//!
//! The store holds a single integer per key. Each [`CounterLimiter::flood`]
//! adds to it atomically, the first write of a window attaches the window TTL,
//! and an overshoot past the max watermark is corrected afterwards by a
//! detached compensating increment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::{Admission, AdmissionControl};
use super::core::{LimiterCore, Watermarks};
use crate::error::{KvGuardError, Result};
use crate::store::{Command, ExpireCondition, KeyValueStore, StoreError};

/// Named time window for counter resets and bucket refills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// One second
    Second,
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One day
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// How the increment and the window TTL reach the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterMode {
    /// Exists, increment, then expire on first write, as three calls.
    ///
    /// Two first writers can race the existence check; the loser's expire is
    /// skipped, which is harmless, but a crash between the increment and the
    /// expire leaves a key without a window.
    #[default]
    Sequential,
    /// Increment and expire-if-no-TTL in one pipeline.
    Atomic,
}

/// Report of a compensating write that did not reach the store.
#[derive(Debug)]
pub struct CompensationFailure {
    pub key: String,
    pub delta: i64,
    pub error: StoreError,
}

/// Observability callback for failed compensation.
pub type CompensationHook = Arc<dyn Fn(&CompensationFailure) + Send + Sync>;

/// Admission control over a store-side counter.
pub struct CounterLimiter<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    core: LimiterCore,
    window: Option<Duration>,
    mode: CounterMode,
    on_compensation_error: Option<CompensationHook>,
}

impl<S: KeyValueStore + ?Sized> std::fmt::Debug for CounterLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterLimiter")
            .field("core", &self.core)
            .field("window", &self.window)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<S: KeyValueStore + ?Sized + 'static> CounterLimiter<S> {
    /// Create a counter limiter. No store I/O happens here.
    ///
    /// The atomic mode needs a window, and a zero window is never valid.
    pub fn new(
        store: Arc<S>,
        core: LimiterCore,
        window: Option<Duration>,
        mode: CounterMode,
    ) -> Result<Self> {
        validate_window(core.key(), window, mode)?;

        Ok(Self {
            store,
            core,
            window,
            mode,
            on_compensation_error: None,
        })
    }

    /// Report failed compensating writes to `hook`.
    pub fn with_compensation_hook(mut self, hook: CompensationHook) -> Self {
        self.on_compensation_error = Some(hook);
        self
    }

    pub fn key(&self) -> &str {
        self.core.key()
    }

    pub fn watermarks(&self) -> Watermarks {
        self.core.watermarks()
    }

    pub fn window(&self) -> Option<Duration> {
        self.window
    }

    /// Add `amount` to the counter and decide admission.
    ///
    /// A negative `amount` gives capacity back. Returns whether the caller
    /// was admitted.
    pub async fn flood(&self, amount: i64) -> Result<bool> {
        Ok(self.consume(amount).await?.admitted)
    }

    /// Like [`CounterLimiter::flood`], returning the observed level as well.
    pub async fn consume(&self, amount: i64) -> Result<Admission> {
        let key = self.core.key();
        let value = match self.mode {
            CounterMode::Sequential => self.increment_sequential(amount).await?,
            CounterMode::Atomic => self.increment_atomic(amount).await?,
        };

        let level = self.core.classify(value, false).await;
        let max = self.core.watermarks().max;

        if value > max {
            self.compensate(max - value).await;
        } else if value < 0 {
            self.compensate(-value).await;
        }

        trace!(key = %key, amount = amount, value = value, level = ?level, "Flood evaluated");

        Ok(Admission {
            admitted: !level.is_full(),
            level: value,
            remaining: (max - value).max(0),
            retry_after: None,
        })
    }

    async fn increment_sequential(&self, amount: i64) -> Result<i64> {
        let key = self.core.key();
        let first = !self.store.exists(key).await?;
        let value = self.store.increment_by(key, amount).await?;

        if first {
            if let Some(window) = self.window {
                self.store
                    .expire(key, window, ExpireCondition::Always)
                    .await?;
                trace!(key = %key, window_ms = window.as_millis() as u64, "Started counter window");
            }
        }
        Ok(value)
    }

    async fn increment_atomic(&self, amount: i64) -> Result<i64> {
        let key = self.core.key();
        let mut commands = vec![Command::IncrementBy {
            key: key.to_string(),
            delta: amount,
        }];
        if let Some(window) = self.window {
            commands.push(Command::Expire {
                key: key.to_string(),
                ttl: window,
                condition: ExpireCondition::IfNoTtl,
            });
        }

        let replies = self.store.pipeline(commands).await?;
        let value = replies
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::UnexpectedReply("empty pipeline reply".to_string()))?
            .into_int()?;
        Ok(value)
    }

    /// Issue a detached `delta` increment that settles the counter in bounds.
    async fn compensate(&self, delta: i64) {
        let store = Arc::clone(&self.store);
        let key = self.core.key().to_string();
        let hook = self.on_compensation_error.clone();

        debug!(key = %key, delta = delta, "Compensating counter overshoot");

        self.core
            .run_detached(async move {
                match store.increment_by(&key, delta).await {
                    Ok(settled) => {
                        trace!(key = %key, settled = settled, "Counter compensated");
                    }
                    Err(error) => {
                        warn!(key = %key, delta = delta, error = %error, "Counter compensation failed");
                        if let Some(hook) = hook {
                            hook(&CompensationFailure { key, delta, error });
                        }
                    }
                }
            })
            .await;
    }

    /// Current counter value.
    ///
    /// Reads through a zero increment so the same atomic path as `flood` is
    /// used. With a window configured, a key created by this read gets the
    /// window TTL so it cannot outlive it.
    pub async fn water_level(&self) -> Result<i64> {
        let key = self.core.key();
        let Some(window) = self.window else {
            return Ok(self.store.increment_by(key, 0).await?);
        };

        let replies = self
            .store
            .pipeline(vec![
                Command::IncrementBy {
                    key: key.to_string(),
                    delta: 0,
                },
                Command::Expire {
                    key: key.to_string(),
                    ttl: window,
                    condition: ExpireCondition::IfNoTtl,
                },
            ])
            .await?;
        let value = replies
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::UnexpectedReply("empty pipeline reply".to_string()))?
            .into_int()?;
        Ok(value)
    }

    /// Whether the counter is at or above the max watermark.
    pub async fn is_full(&self) -> Result<bool> {
        Ok(self.water_level().await? >= self.core.watermarks().max)
    }

    /// Capacity left before the max watermark.
    pub async fn remaining(&self) -> Result<i64> {
        Ok((self.core.watermarks().max - self.water_level().await?).max(0))
    }

    /// Delete the counter, starting a fresh window.
    pub async fn reset(&self) -> Result<()> {
        self.store.delete(self.core.key()).await?;
        debug!(key = %self.core.key(), "Counter reset");
        Ok(())
    }
}

pub(crate) fn validate_window(key: &str, window: Option<Duration>, mode: CounterMode) -> Result<()> {
    let missing_ttl = match window {
        Some(window) => window.is_zero(),
        None => mode == CounterMode::Atomic,
    };
    if missing_ttl {
        return Err(KvGuardError::MissingTtl {
            key: key.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl<S: KeyValueStore + ?Sized + 'static> AdmissionControl for CounterLimiter<S> {
    async fn admit(&self, amount: i64) -> Result<Admission> {
        self.consume(amount).await
    }

    async fn reset(&self) -> Result<()> {
        CounterLimiter::reset(self).await
    }

    fn key(&self) -> &str {
        self.core.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::core::{Hook, HookEvent, HookKind, HookMode, Hooks};
    use crate::store::{BucketParams, BucketState, MemoryStore, Reply, StoreResult};
    use parking_lot::Mutex;

    type Events = Arc<Mutex<Vec<HookEvent>>>;

    fn recorder() -> (Events, Hook) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let hook: Hook = Arc::new(move |event: &HookEvent| sink.lock().push(event.clone()));
        (events, hook)
    }

    fn limiter<S: KeyValueStore + ?Sized + 'static>(
        store: Arc<S>,
        hooks: Hooks,
        window: Option<Duration>,
        mode: CounterMode,
    ) -> CounterLimiter<S> {
        let core = LimiterCore::new(
            "limits:export",
            Watermarks::new(120, 80).unwrap(),
            hooks,
            HookMode::Sync,
            None,
        )
        .unwrap();
        CounterLimiter::new(store, core, window, mode).unwrap()
    }

    async fn settle<S: KeyValueStore + ?Sized + 'static>(limiter: &CounterLimiter<S>, expected: i64) -> i64 {
        let mut level = limiter.water_level().await.unwrap();
        for _ in 0..100 {
            if level == expected {
                break;
            }
            tokio::task::yield_now().await;
            level = limiter.water_level().await.unwrap();
        }
        level
    }

    /// Delegates to a `MemoryStore`, failing the selected commands.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryStore,
        fail_negative_increments: bool,
        fail_expire: bool,
    }

    #[async_trait]
    impl KeyValueStore for FaultyStore {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> StoreResult<u64> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }
        async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
            if delta < 0 && self.fail_negative_increments {
                return Err(StoreError::Connection("connection reset".to_string()));
            }
            self.inner.increment_by(key, delta).await
        }
        async fn expire(&self, key: &str, ttl: Duration, condition: ExpireCondition) -> StoreResult<bool> {
            if self.fail_expire {
                return Err(StoreError::Connection("connection reset".to_string()));
            }
            self.inner.expire(key, ttl, condition).await
        }
        async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
            self.inner.pipeline(commands).await
        }
        async fn throttle(&self, key: &str, params: &BucketParams, cost: i64) -> StoreResult<BucketState> {
            self.inner.throttle(key, params, cost).await
        }
    }

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_atomic_mode_requires_window() {
        let store = Arc::new(MemoryStore::new());
        let core = LimiterCore::new(
            "limits:export",
            Watermarks::new(120, 80).unwrap(),
            Hooks::default(),
            HookMode::Sync,
            None,
        )
        .unwrap();

        let err = CounterLimiter::new(store.clone(), core.clone(), None, CounterMode::Atomic).unwrap_err();
        assert!(matches!(err, KvGuardError::MissingTtl { .. }));

        let err = CounterLimiter::new(store, core, Some(Duration::ZERO), CounterMode::Sequential).unwrap_err();
        assert!(matches!(err, KvGuardError::MissingTtl { .. }));
    }

    #[tokio::test]
    async fn test_admission_boundary_and_compensation() {
        let store = Arc::new(MemoryStore::new());
        let (warnings, on_warning) = recorder();
        let (fulls, on_full) = recorder();
        let mut hooks = Hooks::default();
        hooks.set(HookKind::Warning, on_warning).unwrap();
        hooks.set(HookKind::Full, on_full).unwrap();
        let limiter = limiter(store, hooks, Some(Duration::from_secs(60)), CounterMode::Sequential);

        for _ in 0..9 {
            assert!(limiter.flood(11).await.unwrap());
        }
        assert_eq!(warnings.lock()[0].value, 88);

        assert!(limiter.flood(11).await.unwrap());
        assert_eq!(warnings.lock().len(), 3);
        assert_eq!(warnings.lock()[2].value, 110);
        assert!(fulls.lock().is_empty());

        assert!(!limiter.flood(120).await.unwrap());
        assert_eq!(fulls.lock().len(), 1);
        assert_eq!(fulls.lock()[0].value, 230);

        assert_eq!(settle(&limiter, 120).await, 120);
        assert!(limiter.is_full().await.unwrap());
        assert_eq!(limiter.remaining().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reaching_max_exactly_is_full_without_compensation() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, Hooks::default(), None, CounterMode::Sequential);

        assert!(limiter.flood(119).await.unwrap());
        assert!(!limiter.flood(1).await.unwrap());
        assert_eq!(limiter.water_level().await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_negative_amount_releases_capacity() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, Hooks::default(), None, CounterMode::Sequential);

        limiter.flood(100).await.unwrap();
        assert!(limiter.flood(-40).await.unwrap());
        assert_eq!(limiter.water_level().await.unwrap(), 60);

        let admission = limiter.consume(-100).await.unwrap();
        assert_eq!(admission.level, -40);
        assert_eq!(settle(&limiter, 0).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_ttl() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), Hooks::default(), Some(Duration::from_secs(1)), CounterMode::Sequential);

        limiter.flood(50).await.unwrap();
        assert!(store.ttl("limits:export").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(limiter.water_level().await.unwrap(), 0);
        limiter.flood(5).await.unwrap();
        assert_eq!(limiter.water_level().await.unwrap(), 5);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.water_level().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_mode_sets_window_once() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), Hooks::default(), Some(Duration::from_secs(10)), CounterMode::Atomic);

        assert!(limiter.flood(10).await.unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.flood(10).await.unwrap());

        let ttl = store.ttl("limits:export").unwrap();
        assert_eq!(ttl, Duration::from_secs(6));
        assert_eq!(limiter.water_level().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_without_window_counter_has_no_ttl() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), Hooks::default(), None, CounterMode::Sequential);

        limiter.flood(1).await.unwrap();
        assert!(store.ttl("limits:export").is_none());
    }

    #[tokio::test]
    async fn test_reset_deletes_counter() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), Hooks::default(), None, CounterMode::Sequential);

        limiter.flood(70).await.unwrap();
        limiter.reset().await.unwrap();

        assert!(!store.exists("limits:export").await.unwrap());
        assert_eq!(limiter.remaining().await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_compensation_failure_is_reported() {
        let store = Arc::new(FaultyStore {
            fail_negative_increments: true,
            ..FaultyStore::default()
        });
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let limiter = limiter(store, Hooks::default(), None, CounterMode::Sequential)
            .with_compensation_hook(Arc::new(move |failure: &CompensationFailure| {
                sink.lock().push((failure.key.clone(), failure.delta));
            }));

        assert!(!limiter.flood(150).await.unwrap());

        for _ in 0..100 {
            if !failures.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            failures.lock().as_slice(),
            &[("limits:export".to_string(), -30)]
        );
        assert_eq!(limiter.water_level().await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_sequential_expire_failure_is_propagated() {
        let store = Arc::new(FaultyStore {
            fail_expire: true,
            ..FaultyStore::default()
        });
        let limiter = limiter(store.clone(), Hooks::default(), Some(Duration::from_secs(60)), CounterMode::Sequential);

        let err = limiter.flood(10).await.unwrap_err();
        assert!(matches!(
            err,
            KvGuardError::Store(StoreError::Connection(_))
        ));

        // The increment landed before the expire failed.
        assert_eq!(store.inner.get("limits:export").await.unwrap(), Some("10".to_string()));
        assert!(store.inner.ttl("limits:export").is_none());
    }

    #[tokio::test]
    async fn test_admission_trait_reports_remaining() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, Hooks::default(), None, CounterMode::Sequential);

        let admission = AdmissionControl::admit(&limiter, 30).await.unwrap();
        assert!(admission.admitted);
        assert_eq!(admission.level, 30);
        assert_eq!(admission.remaining, 90);
        assert_eq!(AdmissionControl::key(&limiter), "limits:export");
    }
}
