//! Configuration management for kvguard.
//!
//! A configuration names the locks and limiters an application uses. Names
//! are turned into store keys below the configured namespace.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{KvGuardError, Result};
use crate::key::ResourceKey;
use crate::lock::Lock;
use crate::ratelimit::{Backend, CounterMode, LimiterBuilder, LimiterConfig, TimeWindow};
use crate::store::{BucketParams, KeyValueStore};

/// Environment variable prefix for overrides, e.g. `KVGUARD__NAMESPACE`.
pub const ENV_PREFIX: &str = "KVGUARD";

/// Main configuration for kvguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvGuardConfig {
    /// Prefix for every store key
    #[serde(default)]
    pub namespace: String,

    /// Named locks
    #[serde(default)]
    pub locks: HashMap<String, LockSettings>,

    /// Named limiters
    #[serde(default)]
    pub limiters: HashMap<String, LimiterSettings>,
}

/// Settings for one lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lease TTL in milliseconds
    pub ttl_ms: u64,

    /// Poll interval used when waiting for release
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Settings for one limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Defaults to the bucket capacity for token buckets
    #[serde(default)]
    pub max_watermark: Option<i64>,

    pub warning_watermark: i64,

    #[serde(default)]
    pub backend: BackendSettings,
}

/// Backend selection, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSettings {
    Counter {
        /// Named reset window
        #[serde(default)]
        window: Option<TimeWindow>,
        /// Reset window in milliseconds
        #[serde(default)]
        window_ms: Option<u64>,
        #[serde(default)]
        mode: CounterMode,
    },
    TokenBucket {
        burst: i64,
        refill_count: i64,
        /// Named refill period
        #[serde(default)]
        refill_period: Option<TimeWindow>,
        /// Refill period in milliseconds
        #[serde(default)]
        refill_period_ms: Option<u64>,
        /// Lifetime of the bucket key in milliseconds
        #[serde(default)]
        lease_ttl_ms: Option<u64>,
    },
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::Counter {
            window: None,
            window_ms: None,
            mode: CounterMode::default(),
        }
    }
}

impl BackendSettings {
    fn resolve(&self, name: &str) -> Result<Backend> {
        match *self {
            BackendSettings::Counter {
                window,
                window_ms,
                mode,
            } => Ok(Backend::Counter {
                window: pick_duration(name, "window", window, window_ms)?,
                mode,
            }),
            BackendSettings::TokenBucket {
                burst,
                refill_count,
                refill_period,
                refill_period_ms,
                lease_ttl_ms,
            } => {
                let refill_period = pick_duration(name, "refill_period", refill_period, refill_period_ms)?
                    .ok_or_else(|| {
                        KvGuardError::Config(format!("limiter '{name}' needs a refill_period"))
                    })?;
                Ok(Backend::TokenBucket {
                    params: BucketParams {
                        burst,
                        refill_count,
                        refill_period,
                    },
                    lease_ttl: lease_ttl_ms.map(Duration::from_millis),
                })
            }
        }
    }
}

/// A period may be given as a named unit or in milliseconds, not both.
fn pick_duration(
    name: &str,
    field: &str,
    unit: Option<TimeWindow>,
    millis: Option<u64>,
) -> Result<Option<Duration>> {
    match (unit, millis) {
        (Some(_), Some(_)) => Err(KvGuardError::Config(format!(
            "limiter '{name}' sets both {field} and {field}_ms"
        ))),
        (Some(unit), None) => Ok(Some(unit.duration())),
        (None, Some(ms)) => Ok(Some(Duration::from_millis(ms))),
        (None, None) => Ok(None),
    }
}

impl KvGuardConfig {
    /// Load configuration from a file, with `KVGUARD__*` environment overrides.
    ///
    /// The file format is taken from the extension. Note that keys are
    /// case-insensitive, so lock and limiter names are read in lower case.
    /// Environment values are parsed, so numeric fields can be overridden.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: KvGuardConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| KvGuardError::Config(e.to_string()))?;

        info!(
            path = %path.display(),
            locks = config.locks.len(),
            limiters = config.limiters.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| KvGuardError::Config(e.to_string()))
    }

    /// Store key for a configured name.
    pub fn store_key(&self, name: &str) -> String {
        ResourceKey::new(self.namespace.as_str())
            .with_part(name)
            .to_store_key()
    }

    pub fn lock_settings(&self, name: &str) -> Result<&LockSettings> {
        self.locks
            .get(name)
            .ok_or_else(|| KvGuardError::Config(format!("no lock named '{name}'")))
    }

    /// Build the named lock with a random holder identity and its configured
    /// poll interval.
    pub fn lock<S: KeyValueStore + ?Sized>(&self, store: Arc<S>, name: &str) -> Result<Lock<S>> {
        let settings = self.lock_settings(name)?;
        if settings.poll_interval_ms == 0 {
            return Err(KvGuardError::Config(format!(
                "lock '{name}' needs a positive poll_interval_ms"
            )));
        }
        Lock::with_random_holder(store, self.store_key(name), settings.ttl())?
            .with_poll_interval(settings.poll_interval())
    }

    /// The validated limiter configuration for `name`.
    pub fn limiter_config(&self, name: &str) -> Result<LimiterConfig> {
        self.limiter_builder(name)?.config()
    }

    /// A builder preloaded with the named limiter's settings, ready for hooks.
    pub fn limiter_builder(&self, name: &str) -> Result<LimiterBuilder> {
        let settings = self
            .limiters
            .get(name)
            .ok_or_else(|| KvGuardError::Config(format!("no limiter named '{name}'")))?;

        let mut builder = LimiterBuilder::new(self.store_key(name))
            .warning_watermark(settings.warning_watermark)
            .backend(settings.backend.resolve(name)?);
        if let Some(max) = settings.max_watermark {
            builder = builder.max_watermark(max);
        }
        Ok(builder)
    }

    /// Validate every lock and limiter, in name order.
    pub fn validate(&self) -> Result<()> {
        let mut locks: Vec<&String> = self.locks.keys().collect();
        locks.sort();
        for name in locks {
            let settings = self.lock_settings(name)?;
            if settings.ttl_ms == 0 {
                return Err(KvGuardError::MissingTtl {
                    key: self.store_key(name),
                });
            }
            if settings.poll_interval_ms == 0 {
                return Err(KvGuardError::Config(format!(
                    "lock '{name}' needs a positive poll_interval_ms"
                )));
            }
        }

        let mut limiters: Vec<&String> = self.limiters.keys().collect();
        limiters.sort();
        for name in limiters {
            self.limiter_config(name)?;
        }
        Ok(())
    }
}
