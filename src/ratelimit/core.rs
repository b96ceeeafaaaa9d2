//! Watermark classification and hook dispatch shared by every limiter backend.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::error::{KvGuardError, Result};

/// Callback fired when a limiter crosses a watermark.
///
/// Hooks are hints: they never influence the admission decision.
pub type Hook = Arc<dyn Fn(&HookEvent) + Send + Sync>;

/// The two hook slots a limiter has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Warning,
    Full,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Warning => write!(f, "warning"),
            HookKind::Full => write!(f, "full"),
        }
    }
}

/// Payload handed to a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    /// The limiter key.
    pub key: String,
    /// Which watermark was crossed.
    pub kind: HookKind,
    /// The observed level that triggered the hook.
    pub value: i64,
    /// The watermark that was crossed.
    pub watermark: i64,
}

/// Whether hooks run inline or on the limiter's executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookMode {
    #[default]
    Sync,
    Async,
}

/// Classification of an observed level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Below the warning watermark.
    Normal,
    /// At or above the warning watermark, still admitting.
    Warning,
    /// At or above the max watermark, or already blocked by the backend.
    Full,
}

impl Level {
    pub fn is_full(&self) -> bool {
        matches!(self, Level::Full)
    }
}

/// Admission thresholds. Valid only when `max > warning > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub max: i64,
    pub warning: i64,
}

impl Watermarks {
    pub fn new(max: i64, warning: i64) -> Result<Self> {
        let watermarks = Self { max, warning };
        watermarks.validate()?;
        Ok(watermarks)
    }

    pub fn validate(&self) -> Result<()> {
        if self.warning <= 0 || self.max <= self.warning {
            return Err(KvGuardError::InvalidWatermarks {
                max: self.max,
                warning: self.warning,
            });
        }
        Ok(())
    }

    /// Classify `value` without firing anything.
    pub fn level(&self, value: i64, already_blocked: bool) -> Level {
        if already_blocked || value >= self.max {
            Level::Full
        } else if value >= self.warning {
            Level::Warning
        } else {
            Level::Normal
        }
    }
}

/// One optional hook per class.
#[derive(Clone, Default)]
pub struct Hooks {
    on_warning: Option<Hook>,
    on_full: Option<Hook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_warning", &self.on_warning.is_some())
            .field("on_full", &self.on_full.is_some())
            .finish()
    }
}

impl Hooks {
    /// Fill the slot for `kind`. A second registration for the same slot fails.
    pub fn set(&mut self, kind: HookKind, hook: Hook) -> Result<()> {
        let slot = match kind {
            HookKind::Warning => &mut self.on_warning,
            HookKind::Full => &mut self.on_full,
        };
        if slot.is_some() {
            return Err(KvGuardError::AlreadyHasHook(kind));
        }
        *slot = Some(hook);
        Ok(())
    }

    fn get(&self, kind: HookKind) -> Option<&Hook> {
        match kind {
            HookKind::Warning => self.on_warning.as_ref(),
            HookKind::Full => self.on_full.as_ref(),
        }
    }
}

/// Logic shared by the counter and token bucket limiters.
#[derive(Debug, Clone)]
pub struct LimiterCore {
    key: String,
    watermarks: Watermarks,
    hooks: Hooks,
    mode: HookMode,
    executor: Option<Handle>,
}

impl LimiterCore {
    pub fn new(
        key: impl Into<String>,
        watermarks: Watermarks,
        hooks: Hooks,
        mode: HookMode,
        executor: Option<Handle>,
    ) -> Result<Self> {
        watermarks.validate()?;
        Ok(Self {
            key: key.into(),
            watermarks,
            hooks,
            mode,
            executor,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    /// Classify `value` and fire the matching hook.
    ///
    /// `already_blocked` is set by backends that learned the request was
    /// refused before a level could be compared.
    pub async fn classify(&self, value: i64, already_blocked: bool) -> Level {
        let level = self.watermarks.level(value, already_blocked);
        trace!(
            key = %self.key,
            value = value,
            already_blocked = already_blocked,
            level = ?level,
            "Classified limiter level"
        );

        match level {
            Level::Full => self.fire(HookKind::Full, value, self.watermarks.max).await,
            Level::Warning => {
                self.fire(HookKind::Warning, value, self.watermarks.warning)
                    .await
            }
            Level::Normal => {}
        }
        level
    }

    async fn fire(&self, kind: HookKind, value: i64, watermark: i64) {
        let Some(hook) = self.hooks.get(kind) else {
            return;
        };
        debug!(key = %self.key, kind = %kind, value = value, "Firing limiter hook");

        let event = HookEvent {
            key: self.key.clone(),
            kind,
            value,
            watermark,
        };
        match self.mode {
            HookMode::Sync => hook(&event),
            HookMode::Async => {
                let hook = Arc::clone(hook);
                self.run_detached(async move { hook(&event) }).await;
            }
        }
    }

    /// Run `task` without waiting for it.
    ///
    /// The configured executor is used first, then the ambient tokio runtime.
    /// Outside any tokio runtime the task is awaited in place.
    pub async fn run_detached<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.executor.clone().or_else(|| Handle::try_current().ok());
        match handle {
            Some(handle) => {
                handle.spawn(task);
            }
            None => task.await,
        }
    }
}
