//! Key-value service behind presence tracking.
//!
//! [`KeyValueStore`] is the contract the relay needs from its external
//! store: hashes, sets, capped lists and expiries. [`MemoryStore`] is an
//! in-process implementation; the `redis` feature adds a Redis-backed one.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service failed or is unreachable.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Key holds a value of a different type.
    #[error("Wrong value type for key: {0}")]
    WrongType(String),

    /// A stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Operations the relay needs from its key-value service.
///
/// List indices follow Redis conventions: negative indices count from the
/// tail, ranges are inclusive.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set fields on a hash, creating it if needed.
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// Get all fields of a hash. Missing keys yield an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Add a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Whether a member is in a set.
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Push a value onto the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Keep only the given inclusive range of a list.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;

    /// Read the given inclusive range of a list.
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Delete a key of any type.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Set a key's time to live. No-op for missing keys.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`KeyValueStore`] honouring expiries.
///
/// Expired keys are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Check if the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn purge_if_expired(&self, key: &str) {
        let now = Instant::now();
        if self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
            trace!(key = %key, "Expired key removed");
        }
    }

    /// Run `f` on the live value at `key`, creating it with `init` if missing.
    fn with_value<T>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.purge_if_expired(key);
        let mut entry = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(o) => o.into_ref(),
            MapEntry::Vacant(v) => v.insert(Entry::new(init())),
        };
        f(&mut entry.value)
    }

    /// Run `f` on the live value at `key`, if any.
    fn read_value<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Value) -> Result<T, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => f(&entry.value).map(Some),
            None => Ok(None),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

/// Resolve a Redis-style inclusive range against a list length.
fn resolve_range(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.with_value(
            key,
            || Value::Hash(HashMap::new()),
            |value| match value {
                Value::Hash(map) => {
                    for (field, v) in fields {
                        map.insert((*field).to_string(), v.clone());
                    }
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let map = self.read_value(key, |value| match value {
            Value::Hash(map) => Ok(map.clone()),
            _ => Err(wrong_type(key)),
        })?;
        Ok(map.unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_value(
            key,
            || Value::Set(BTreeSet::new()),
            |value| match value {
                Value::Set(set) => {
                    set.insert(member.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let emptied = self.read_value(key, |value| match value {
            Value::Set(_) => Ok(()),
            _ => Err(wrong_type(key)),
        })?;
        if emptied.is_none() {
            return Ok(());
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let Value::Set(set) = &mut entry.value {
                set.remove(member);
            }
        }
        // Redis deletes sets that become empty.
        self.entries
            .remove_if(key, |_, e| matches!(&e.value, Value::Set(s) if s.is_empty()));
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let members = self.read_value(key, |value| match value {
            Value::Set(set) => Ok(set.iter().cloned().collect()),
            _ => Err(wrong_type(key)),
        })?;
        Ok(members.unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let found = self.read_value(key, |value| match value {
            Value::Set(set) => Ok(set.contains(member)),
            _ => Err(wrong_type(key)),
        })?;
        Ok(found.unwrap_or(false))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_value(
            key,
            || Value::List(VecDeque::new()),
            |v| match v {
                Value::List(list) => {
                    list.push_front(value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let kept = self.read_value(key, |value| match value {
            Value::List(list) => Ok(resolve_range(start, stop, list.len())),
            _ => Err(wrong_type(key)),
        })?;
        match kept {
            None => Ok(()),
            Some(None) => {
                self.entries.remove(key);
                Ok(())
            }
            Some(Some((from, to))) => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if let Value::List(list) = &mut entry.value {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                }
                Ok(())
            }
        }
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let items = self.read_value(key, |value| match value {
            Value::List(list) => Ok(match resolve_range(start, stop, list.len()) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            _ => Err(wrong_type(key)),
        })?;
        Ok(items.unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.purge_if_expired(key);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}
