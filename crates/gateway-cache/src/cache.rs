//! `IdempotencyCache`: per-trace bounded LRU+TTL cache keyed by
//! `(tool_name, canonical_json(args))`.
//!
//! A narrow `get`/`set`/`has` surface over `lru::LruCache`. Deliberately
//! volatile — a process restart losing its idempotency memory is acceptable,
//! the ledger's own journal is what's durable.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};

use gateway_core::constants::{IDEMPOTENCY_CACHE_CAPACITY, IDEMPOTENCY_CACHE_TTL_SECS};
use gateway_core::types::TimestampMs;

use crate::canonical::canonical_json_string;

struct Entry {
    value: Value,
    inserted_at: TimestampMs,
}

pub struct IdempotencyCache {
    inner: Mutex<LruCache<String, Entry>>,
    ttl_ms: i64,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(IDEMPOTENCY_CACHE_CAPACITY, IDEMPOTENCY_CACHE_TTL_SECS * 1_000)
    }
}

impl IdempotencyCache {
    pub fn new(capacity: usize, ttl_ms: i64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl_ms,
        }
    }

    /// `trace_id || sha256(tool_name || canonical_json(args))[:16]`.
    fn key(trace_id: &str, tool_name: &str, args: &Value) -> String {
        let canonical = canonical_json_string(args);
        let mut hasher = Sha256::new();
        hasher.update(tool_name.as_bytes());
        hasher.update(canonical.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{trace_id}{}", &digest[..16])
    }

    fn is_live(&self, entry: &Entry, now: TimestampMs) -> bool {
        now - entry.inserted_at < self.ttl_ms
    }

    pub fn get(&self, trace_id: &str, tool_name: &str, args: &Value, now: TimestampMs) -> Option<Value> {
        let key = Self::key(trace_id, tool_name, args);
        let mut inner = self.inner.lock().expect("idempotency cache mutex poisoned");
        match inner.get(&key) {
            Some(entry) if self.is_live(entry, now) => Some(entry.value.clone()),
            Some(_) => {
                inner.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn has(&self, trace_id: &str, tool_name: &str, args: &Value, now: TimestampMs) -> bool {
        self.get(trace_id, tool_name, args, now).is_some()
    }

    pub fn set(&self, trace_id: &str, tool_name: &str, args: &Value, result: Value, now: TimestampMs) {
        let key = Self::key(trace_id, tool_name, args);
        let mut inner = self.inner.lock().expect("idempotency cache mutex poisoned");
        inner.put(
            key,
            Entry {
                value: result,
                inserted_at: now,
            },
        );
    }

    /// Drops every entry. Used on shutdown and in tests; not part of normal
    /// per-request traffic.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock().expect("idempotency cache mutex poisoned");
        inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
