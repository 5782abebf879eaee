//! `NonceRegistry`: TTL-bounded replay-protection set.
//!
//! Uses the same `compare_and_swap` idiom as `gateway-leader::lock`, generalized
//! from "one fixed key, many holders over time" to "many keys, each claimed
//! at most once per TTL window". A sled CAS loop gives atomic insert-if-absent
//! without needing a `sled::Transaction` — there's only ever one key involved.

use std::path::Path;

use gateway_core::error::GatewayError;
use gateway_core::types::TimestampMs;

pub struct NonceRegistry {
    tree: sled::Tree,
    ttl_ms: i64,
}

impl NonceRegistry {
    pub fn open<P: AsRef<Path>>(path: P, ttl_ms: i64) -> Result<Self, GatewayError> {
        let db = sled::open(path)?;
        Ok(Self {
            tree: db.open_tree("nonces")?,
            ttl_ms,
        })
    }

    pub fn open_temporary(ttl_ms: i64) -> Result<Self, GatewayError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            tree: db.open_tree("nonces")?,
            ttl_ms,
        })
    }

    /// Atomically inserts `key`. Returns `true` iff `key` was absent or its
    /// prior reservation had already expired — i.e. iff this caller is the
    /// first to present it within the current TTL window.
    pub fn reserve(&self, key: &[u8], now: TimestampMs) -> Result<bool, GatewayError> {
        let new_expiry = (now + self.ttl_ms).to_be_bytes();
        loop {
            let current = self.tree.get(key)?;
            let expired = match &current {
                Some(bytes) => be_i64(bytes) <= now,
                None => true,
            };
            if !expired {
                return Ok(false);
            }
            match self.tree.compare_and_swap(key, current, Some(&new_expiry[..]))? {
                Ok(()) => return Ok(true),
                Err(_) => continue, // lost the CAS race, retry against fresh state
            }
        }
    }

    /// Drops entries whose TTL has lapsed. Maintenance only — `reserve`
    /// already treats an expired entry as absent, so this just bounds the
    /// tree's size.
    pub fn sweep_expired(&self, now: TimestampMs) -> Result<usize, GatewayError> {
        let mut removed = 0;
        for item in self.tree.iter() {
            let (key, value) = item?;
            if be_i64(&value) <= now {
                self.tree.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

fn be_i64(ivec: &sled::IVec) -> i64 {
    let mut buf = [0u8; 8];
    let len = ivec.len().min(8);
    buf[8 - len..].copy_from_slice(&ivec[ivec.len() - len..]);
    i64::from_be_bytes(buf)
}
