//! In-process [`KeyValueStore`] implementation.
//!
//! `MemoryStore` keeps every key behind a single mutex, which makes each
//! command linearizable and lets a pipeline run as one uninterrupted batch.
//! Expiry is lazy and measured with `tokio::time::Instant`, so tests can drive
//! lease and window expiry with a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    BucketParams, BucketState, Command, ExpireCondition, KeyValueStore, Reply, StoreError,
    StoreResult,
};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// Theoretical arrival time of the next request for a GCRA bucket.
    Bucket(Instant),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Thread-safe in-memory store for tests, demos and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn execute(&self, command: &Command) -> StoreResult<Reply> {
        let mut entries = self.entries.lock();
        Keyspace::new(&mut entries).apply(command)
    }
}

/// A view of the map pinned to one instant, used for a command or a whole pipeline.
struct Keyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: Instant,
}

impl<'a> Keyspace<'a> {
    fn new(entries: &'a mut HashMap<String, Entry>) -> Self {
        Self {
            entries,
            now: Instant::now(),
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now;
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            trace!(key = %key, "Purging expired key");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn apply(&mut self, command: &Command) -> StoreResult<Reply> {
        match command {
            Command::SetIfAbsent { key, value, ttl } => {
                self.set_if_absent(key, value, *ttl).map(Reply::Bool)
            }
            Command::Get { key } => self.get(key).map(Reply::Value),
            Command::Delete { key } => Ok(Reply::Int(self.delete(key) as i64)),
            Command::Exists { key } => Ok(Reply::Bool(self.live(key).is_some())),
            Command::IncrementBy { key, delta } => self.increment_by(key, *delta).map(Reply::Int),
            Command::Expire {
                key,
                ttl,
                condition,
            } => Ok(Reply::Bool(self.expire(key, *ttl, *condition))),
            Command::Throttle { key, params, cost } => {
                self.throttle(key, params, *cost).map(Reply::Bucket)
            }
        }
    }

    fn set_if_absent(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        if self.live(key).is_some() {
            return Ok(false);
        }
        let expires_at = ttl.map(|ttl| self.now + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn delete(&mut self, key: &str) -> u64 {
        match self.live(key) {
            Some(_) => {
                self.entries.remove(key);
                1
            }
            None => 0,
        }
    }

    fn increment_by(&mut self, key: &str, delta: i64) -> StoreResult<i64> {
        let Some(entry) = self.live(key) else {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(delta.to_string()),
                    expires_at: None,
                },
            );
            return Ok(delta);
        };

        let current = match &entry.value {
            Value::Text(text) => text.parse::<i64>().map_err(|_| StoreError::WrongType {
                key: key.to_string(),
            })?,
            Value::Bucket(_) => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                })
            }
        };
        let updated = current.checked_add(delta).ok_or_else(|| StoreError::Overflow {
            key: key.to_string(),
        })?;

        // The existing TTL is kept, as INCRBY does.
        entry.value = Value::Text(updated.to_string());
        Ok(updated)
    }

    fn expire(&mut self, key: &str, ttl: Duration, condition: ExpireCondition) -> bool {
        let now = self.now;
        match self.live(key) {
            Some(entry) => {
                if condition == ExpireCondition::IfNoTtl && entry.expires_at.is_some() {
                    return false;
                }
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    /// Generic cell rate algorithm, replying like `CL.THROTTLE`.
    fn throttle(&mut self, key: &str, params: &BucketParams, cost: i64) -> StoreResult<BucketState> {
        let (Some(emission), Some(tolerance)) = (params.emission_nanos(), params.tolerance_nanos())
        else {
            return Err(StoreError::InvalidArgument(format!(
                "bucket {key}: burst must be >= 0, refill count/period positive and refill time bounded"
            )));
        };
        if cost < 0 {
            return Err(StoreError::InvalidArgument(format!(
                "bucket {key}: cost must not be negative"
            )));
        }

        let now = self.now;

        // All times below are nanoseconds relative to `now`.
        let tat = match self.live(key) {
            None => 0,
            Some(Entry {
                value: Value::Bucket(tat),
                ..
            }) => tat.saturating_duration_since(now).as_nanos() as i128,
            Some(_) => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                })
            }
        };

        let increment = emission.saturating_mul(cost as i128);
        let new_tat = tat.saturating_add(increment);
        let allow_at = new_tat - tolerance;

        let (blocked, ttl, retry_after) = if allow_at > 0 {
            let retry_after = (increment <= tolerance).then(|| nanos(allow_at));
            (true, tat, retry_after)
        } else {
            if new_tat > 0 {
                let at = now + nanos(new_tat);
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Bucket(at),
                        expires_at: Some(at),
                    },
                );
            }
            (false, new_tat, None)
        };

        let next = tolerance - ttl;
        let remaining = if next > -emission {
            (next / emission).max(0) as i64
        } else {
            0
        };

        Ok(BucketState {
            blocked,
            limit: params.capacity(),
            remaining,
            retry_after,
            reset_after: nanos(ttl),
        })
    }
}

fn nanos(value: i128) -> Duration {
    Duration::from_nanos(value.clamp(0, u64::MAX as i128) as u64)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        self.execute(&Command::SetIfAbsent {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        })?
        .into_bool()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock();
        Keyspace::new(&mut entries).get(key)
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut entries = self.entries.lock();
        Ok(Keyspace::new(&mut entries).delete(key))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.execute(&Command::Exists {
            key: key.to_string(),
        })?
        .into_bool()
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut entries = self.entries.lock();
        Keyspace::new(&mut entries).increment_by(key, delta)
    }

    async fn expire(&self, key: &str, ttl: Duration, condition: ExpireCondition) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        Ok(Keyspace::new(&mut entries).expire(key, ttl, condition))
    }

    async fn pipeline(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        let mut entries = self.entries.lock();

        // Snapshot every touched key so a failing command can roll the batch back.
        let mut saved: Vec<(String, Option<Entry>)> = Vec::new();
        for command in &commands {
            let key = command.key();
            if !saved.iter().any(|(k, _)| k == key) {
                saved.push((key.to_string(), entries.get(key).cloned()));
            }
        }

        let mut keyspace = Keyspace::new(&mut entries);
        let mut replies = Vec::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            match keyspace.apply(command) {
                Ok(reply) => replies.push(reply),
                Err(source) => {
                    debug!(index = index, error = %source, "Pipeline aborted, rolling back");
                    for (key, entry) in saved {
                        match entry {
                            Some(entry) => {
                                entries.insert(key, entry);
                            }
                            None => {
                                entries.remove(&key);
                            }
                        }
                    }
                    return Err(StoreError::PipelineAborted {
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }

        Ok(replies)
    }

    async fn throttle(&self, key: &str, params: &BucketParams, cost: i64) -> StoreResult<BucketState> {
        self.execute(&Command::Throttle {
            key: key.to_string(),
            params: *params,
            cost,
        })?
        .into_bucket()
    }
}
