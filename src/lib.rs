//! kvguard - Distributed locks and admission control
//!
//! This crate coordinates independent processes through a shared key-value
//! store with atomic primitives: lease-based mutual exclusion with fencing
//! generations, counter-based admission with watermark hooks, and token
//! bucket admission evaluated atomically by the store.

pub mod config;
pub mod error;
pub mod key;
pub mod lock;
pub mod ratelimit;
pub mod store;

pub use error::{KvGuardError, Result};
pub use lock::{FencingGate, Lease, Lock};
pub use ratelimit::{Admission, AdmissionControl, Limiter, LimiterBuilder, LimiterConfig};
pub use store::{KeyValueStore, MemoryStore};
