//! Error types for kvguard.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::HookKind;
use crate::store::StoreError;

/// Main error type for kvguard operations.
///
/// Contention outcomes (`AlreadyLocked`, `AlreadyUnlocked`) are expected
/// results of a busy system and are never retried by the library.
#[derive(Error, Debug)]
pub enum KvGuardError {
    /// The lock is currently held by some holder.
    #[error("Lock '{key}' is already held")]
    AlreadyLocked { key: String },

    /// Unlock was called but no lease exists for the key.
    #[error("Lock '{key}' is already released")]
    AlreadyUnlocked { key: String },

    /// Unlock was called by a caller that does not hold the lease.
    #[error("Holder '{holder}' has no right to unlock '{key}' (held by '{current}')")]
    NoRightToUnlock {
        key: String,
        holder: String,
        current: String,
    },

    /// A lease generation older than one already observed was presented.
    #[error("Stale lease generation {generation} for '{key}' (highest seen {highest})")]
    StaleLease {
        key: String,
        generation: u64,
        highest: u64,
    },

    /// Waiting for a lock to be released exceeded the caller's deadline.
    #[error("Timed out after {waited:?} waiting for '{key}' to be released")]
    WaitTimeout { key: String, waited: Duration },

    /// A hook slot was registered twice.
    #[error("Limiter already has a {0} hook")]
    AlreadyHasHook(HookKind),

    /// Watermarks violate `max > warning > 0`.
    #[error("Invalid watermarks: max {max} must be greater than warning {warning}, which must be positive")]
    InvalidWatermarks { max: i64, warning: i64 },

    /// A TTL is required for this configuration but none was given.
    #[error("A TTL is required for '{key}'")]
    MissingTtl { key: String },

    /// Token bucket parameters are unusable.
    #[error("Invalid token bucket: {0}")]
    InvalidBucket(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store adapter errors, propagated unchanged
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvGuardError {
    /// Whether this error is an expected contention outcome rather than a failure.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            KvGuardError::AlreadyLocked { .. }
                | KvGuardError::AlreadyUnlocked { .. }
                | KvGuardError::WaitTimeout { .. }
        )
    }

    /// Whether this error was raised while validating construction-time configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            KvGuardError::AlreadyHasHook(_)
                | KvGuardError::InvalidWatermarks { .. }
                | KvGuardError::MissingTtl { .. }
                | KvGuardError::InvalidBucket(_)
                | KvGuardError::Config(_)
        )
    }
}

/// Result type alias for kvguard operations.
pub type Result<T> = std::result::Result<T, KvGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_classification() {
        let err = KvGuardError::AlreadyLocked {
            key: "jobs".to_string(),
        };
        assert!(err.is_contention());
        assert!(!err.is_configuration());

        let err = KvGuardError::NoRightToUnlock {
            key: "jobs".to_string(),
            holder: "b".to_string(),
            current: "a".to_string(),
        };
        assert!(!err.is_contention());
    }

    #[test]
    fn test_configuration_classification() {
        let err = KvGuardError::InvalidWatermarks { max: 10, warning: 10 };
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "Invalid watermarks: max 10 must be greater than warning 10, which must be positive"
        );

        assert!(KvGuardError::AlreadyHasHook(HookKind::Full).is_configuration());
    }

    #[test]
    fn test_store_error_converts() {
        let err: KvGuardError = StoreError::Connection("refused".to_string()).into();
        assert!(matches!(err, KvGuardError::Store(_)));
        assert!(!err.is_contention());
    }
}
