//! Limiter configuration, construction and the backend-agnostic `Limiter`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::debug;

use super::backend::{Admission, AdmissionControl};
use super::bucket::{self, TokenBucketLimiter};
use super::core::{HookEvent, HookKind, HookMode, Hooks, LimiterCore, Watermarks};
use super::counter::{self, CompensationFailure, CompensationHook, CounterLimiter, CounterMode};
use crate::error::{KvGuardError, Result};
use crate::store::{BucketParams, KeyValueStore};

/// Which store-side structure backs a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// A counter reset by its window TTL.
    Counter {
        window: Option<Duration>,
        mode: CounterMode,
    },
    /// A token bucket evaluated atomically by the store.
    TokenBucket {
        params: BucketParams,
        lease_ttl: Option<Duration>,
    },
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Counter {
            window: None,
            mode: CounterMode::Sequential,
        }
    }
}

/// Immutable, validated description of a limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Store key of the counter or bucket
    pub key: String,
    /// Level at which admission stops
    pub max_watermark: i64,
    /// Level at which the warning hook fires
    pub warning_watermark: i64,
    /// Backend and its parameters
    pub backend: Backend,
}

impl LimiterConfig {
    /// Check every construction-time invariant. Performs no I/O.
    pub fn validate(&self) -> Result<()> {
        Watermarks::new(self.max_watermark, self.warning_watermark)?;
        match self.backend {
            Backend::Counter { window, mode } => counter::validate_window(&self.key, window, mode),
            Backend::TokenBucket { params, lease_ttl } => {
                bucket::validate_params(&params)?;
                if lease_ttl.is_some_and(|ttl| ttl.is_zero()) {
                    return Err(KvGuardError::MissingTtl {
                        key: self.key.clone(),
                    });
                }
                Ok(())
            }
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            max: self.max_watermark,
            warning: self.warning_watermark,
        }
    }
}

/// Builder for [`Limiter`], collecting hooks alongside the configuration.
///
/// Every error, including a second hook for the same slot, is reported by
/// [`LimiterBuilder::build`] before anything touches the store.
pub struct LimiterBuilder {
    key: String,
    max_watermark: Option<i64>,
    warning_watermark: Option<i64>,
    backend: Backend,
    lease_ttl: Option<Duration>,
    hooks: Hooks,
    hook_error: Option<KvGuardError>,
    hook_mode: HookMode,
    executor: Option<Handle>,
    on_compensation_error: Option<CompensationHook>,
}

impl LimiterBuilder {
    /// Start building a counter limiter on `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            max_watermark: None,
            warning_watermark: None,
            backend: Backend::default(),
            lease_ttl: None,
            hooks: Hooks::default(),
            hook_error: None,
            hook_mode: HookMode::default(),
            executor: None,
            on_compensation_error: None,
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: LimiterConfig) -> Self {
        Self::new(config.key)
            .max_watermark(config.max_watermark)
            .warning_watermark(config.warning_watermark)
            .backend(config.backend)
    }

    pub fn max_watermark(mut self, max: i64) -> Self {
        self.max_watermark = Some(max);
        self
    }

    pub fn warning_watermark(mut self, warning: i64) -> Self {
        self.warning_watermark = Some(warning);
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Use a counter reset every `window`.
    pub fn counter(self, window: Option<Duration>, mode: CounterMode) -> Self {
        self.backend(Backend::Counter { window, mode })
    }

    /// Use a server-side token bucket.
    pub fn token_bucket(self, burst: i64, refill_count: i64, refill_period: Duration) -> Self {
        self.backend(Backend::TokenBucket {
            params: BucketParams {
                burst,
                refill_count,
                refill_period,
            },
            lease_ttl: None,
        })
    }

    /// Bound the lifetime of a token bucket key.
    ///
    /// May be called before or after the backend is chosen. It overrides the
    /// backend's own lease TTL, and is a configuration error on a counter.
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn on_warning<F>(self, hook: F) -> Self
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hook(HookKind::Warning, hook)
    }

    pub fn on_full<F>(self, hook: F) -> Self
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hook(HookKind::Full, hook)
    }

    fn hook<F>(mut self, kind: HookKind, hook: F) -> Self
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        if let Err(err) = self.hooks.set(kind, Arc::new(hook)) {
            self.hook_error.get_or_insert(err);
        }
        self
    }

    /// Observe compensating writes that fail. Counter limiters only.
    pub fn on_compensation_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CompensationFailure) + Send + Sync + 'static,
    {
        self.on_compensation_error = Some(Arc::new(hook));
        self
    }

    pub fn hook_mode(mut self, mode: HookMode) -> Self {
        self.hook_mode = mode;
        self
    }

    /// Runtime that asynchronous hooks and compensation are spawned on.
    pub fn executor(mut self, handle: Handle) -> Self {
        self.executor = Some(handle);
        self
    }

    /// Resolve defaults and validate, producing the immutable configuration.
    ///
    /// A token bucket's max watermark defaults to its capacity.
    pub fn config(&self) -> Result<LimiterConfig> {
        let max_watermark = match (self.max_watermark, &self.backend) {
            (Some(max), _) => max,
            (None, Backend::TokenBucket { params, .. }) => params.capacity(),
            (None, Backend::Counter { .. }) => {
                return Err(KvGuardError::Config(format!(
                    "limiter '{}' needs a max watermark",
                    self.key
                )))
            }
        };
        let warning_watermark = self.warning_watermark.ok_or_else(|| {
            KvGuardError::Config(format!("limiter '{}' needs a warning watermark", self.key))
        })?;

        let backend = match (self.backend, self.lease_ttl) {
            (backend, None) => backend,
            (Backend::TokenBucket { params, .. }, Some(ttl)) => Backend::TokenBucket {
                params,
                lease_ttl: Some(ttl),
            },
            (Backend::Counter { .. }, Some(_)) => {
                return Err(KvGuardError::Config(format!(
                    "limiter '{}' is a counter; lease_ttl applies to token buckets",
                    self.key
                )))
            }
        };

        let config = LimiterConfig {
            key: self.key.clone(),
            max_watermark,
            warning_watermark,
            backend,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate everything and build the limiter. No store I/O happens here.
    pub fn build<S: KeyValueStore + ?Sized + 'static>(self, store: Arc<S>) -> Result<Limiter<S>> {
        if let Some(err) = self.hook_error {
            return Err(err);
        }
        let config = self.config()?;

        let core = LimiterCore::new(
            config.key.clone(),
            config.watermarks(),
            self.hooks,
            self.hook_mode,
            self.executor,
        )?;

        debug!(
            key = %config.key,
            max = config.max_watermark,
            warning = config.warning_watermark,
            backend = ?config.backend,
            "Limiter built"
        );

        let limiter = match config.backend {
            Backend::Counter { window, mode } => {
                let mut limiter = CounterLimiter::new(store, core, window, mode)?;
                if let Some(hook) = self.on_compensation_error {
                    limiter = limiter.with_compensation_hook(hook);
                }
                Limiter::Counter(limiter)
            }
            Backend::TokenBucket { params, lease_ttl } => {
                Limiter::TokenBucket(TokenBucketLimiter::new(store, core, params, lease_ttl)?)
            }
        };
        Ok(limiter)
    }
}

/// A limiter with either backend.
pub enum Limiter<S: KeyValueStore + ?Sized> {
    Counter(CounterLimiter<S>),
    TokenBucket(TokenBucketLimiter<S>),
}

impl<S: KeyValueStore + ?Sized> std::fmt::Debug for Limiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limiter::Counter(limiter) => f.debug_tuple("Counter").field(limiter).finish(),
            Limiter::TokenBucket(limiter) => f.debug_tuple("TokenBucket").field(limiter).finish(),
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Limiter<S> {
    /// Build a limiter without hooks.
    pub fn new(store: Arc<S>, config: LimiterConfig) -> Result<Self> {
        LimiterBuilder::from_config(config).build(store)
    }

    pub fn as_counter(&self) -> Option<&CounterLimiter<S>> {
        match self {
            Limiter::Counter(limiter) => Some(limiter),
            Limiter::TokenBucket(_) => None,
        }
    }

    pub fn as_token_bucket(&self) -> Option<&TokenBucketLimiter<S>> {
        match self {
            Limiter::TokenBucket(limiter) => Some(limiter),
            Limiter::Counter(_) => None,
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        match self {
            Limiter::Counter(limiter) => limiter.watermarks(),
            Limiter::TokenBucket(limiter) => limiter.watermarks(),
        }
    }
}

#[async_trait]
impl<S: KeyValueStore + ?Sized + 'static> AdmissionControl for Limiter<S> {
    async fn admit(&self, amount: i64) -> Result<Admission> {
        match self {
            Limiter::Counter(limiter) => limiter.admit(amount).await,
            Limiter::TokenBucket(limiter) => limiter.admit(amount).await,
        }
    }

    async fn reset(&self) -> Result<()> {
        match self {
            Limiter::Counter(limiter) => AdmissionControl::reset(limiter).await,
            Limiter::TokenBucket(limiter) => AdmissionControl::reset(limiter).await,
        }
    }

    fn key(&self) -> &str {
        match self {
            Limiter::Counter(limiter) => AdmissionControl::key(limiter),
            Limiter::TokenBucket(limiter) => AdmissionControl::key(limiter),
        }
    }
}
