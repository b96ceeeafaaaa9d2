//! Stale-holder rejection for resources protected by a [`Lock`](super::Lock).

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use super::Lease;
use crate::error::{KvGuardError, Result};

/// Tracks the highest lease generation a protected resource has accepted.
///
/// A holder that was paused past its lease presents a generation lower than
/// the one its successor already used, and is rejected.
#[derive(Debug)]
pub struct FencingGate {
    key: String,
    highest: AtomicU64,
}

impl FencingGate {
    /// Create a gate for the resource guarded by `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            highest: AtomicU64::new(0),
        }
    }

    /// Admit an operation performed under `lease`.
    pub fn admit(&self, lease: &Lease) -> Result<()> {
        self.admit_generation(lease.generation)
    }

    /// Admit an operation carrying `generation`, raising the high-water mark.
    pub fn admit_generation(&self, generation: u64) -> Result<()> {
        let previous = self.highest.fetch_max(generation, Ordering::SeqCst);
        if generation < previous {
            warn!(
                key = %self.key,
                generation = generation,
                highest = previous,
                "Rejecting stale lease generation"
            );
            return Err(KvGuardError::StaleLease {
                key: self.key.clone(),
                generation,
                highest: previous,
            });
        }
        Ok(())
    }

    /// The highest generation admitted so far.
    pub fn highest(&self) -> u64 {
        self.highest.load(Ordering::SeqCst)
    }
}
