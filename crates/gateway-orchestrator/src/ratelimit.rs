//! `RateLimiter`: sliding-window rate limiting per (tier, identifier).
//!
//! A bounded timestamp history keyed by an identifier, checked and pruned
//! under one lock. Keeps a per-key map but uses a bounded, pruned timestamp
//! set rather than a fixed-window counter, backed by `DashMap` so the
//! check-and-insert is a single atomic `entry` call rather than a read lock
//! followed by a separate write lock.

use std::collections::VecDeque;

use dashmap::DashMap;

use gateway_core::claims::Tier;
use gateway_core::constants::{RATE_LIMIT_ENTERPRISE_MAX, RATE_LIMIT_FREE_MAX, RATE_LIMIT_PRO_MAX, RATE_LIMIT_WINDOW_SECS};
use gateway_core::types::TimestampMs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Key {
    tier: TierKey,
    identifier_hash: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum TierKey {
    Free,
    Pro,
    Enterprise,
}

impl From<Tier> for TierKey {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Free => TierKey::Free,
            Tier::Pro => TierKey::Pro,
            Tier::Enterprise => TierKey::Enterprise,
        }
    }
}

fn hash_identifier(identifier: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    identifier.hash(&mut hasher);
    hasher.finish()
}

fn default_max_for(tier: Tier) -> u32 {
    match tier {
        Tier::Free => RATE_LIMIT_FREE_MAX,
        Tier::Pro => RATE_LIMIT_PRO_MAX,
        Tier::Enterprise => RATE_LIMIT_ENTERPRISE_MAX,
    }
}

/// Sliding-window limiter: each (tier, identifier) owns a bounded,
/// time-ordered queue of request timestamps. `check_and_insert` is the sole
/// entry point — it drops stale entries and admits the new request in one
/// atomic `DashMap::entry` closure, so no caller can observe a state where
/// the prune happened but the insert (or rejection) didn't.
pub struct RateLimiter {
    windows: DashMap<Key, VecDeque<TimestampMs>>,
    window_ms: i64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_WINDOW_SECS * 1_000)
    }
}

impl RateLimiter {
    pub fn new(window_ms: i64) -> Self {
        Self {
            windows: DashMap::new(),
            window_ms,
        }
    }

    /// Atomic check-and-insert: (1) drop entries older than `now -
    /// window`, (2) if the remaining count is below the tier's max, insert
    /// `now` and return `true`, (3) otherwise return `false` without
    /// mutating the window.
    pub fn check_and_insert(&self, tier: Tier, identifier: &str, now: TimestampMs) -> bool {
        self.check_and_insert_with_max(tier, identifier, now, default_max_for(tier))
    }

    pub fn check_and_insert_with_max(&self, tier: Tier, identifier: &str, now: TimestampMs, max: u32) -> bool {
        let key = Key {
            tier: tier.into(),
            identifier_hash: hash_identifier(identifier),
        };
        let cutoff = now - self.window_ms;
        let mut entry = self.windows.entry(key).or_default();
        while matches!(entry.front(), Some(ts) if *ts <= cutoff) {
            entry.pop_front();
        }
        if entry.len() >= max as usize {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Current in-window count for (tier, identifier), without mutating
    /// anything. Used by the node binary's metrics sweep.
    pub fn current_count(&self, tier: Tier, identifier: &str, now: TimestampMs) -> usize {
        let key = Key {
            tier: tier.into(),
            identifier_hash: hash_identifier(identifier),
        };
        let cutoff = now - self.window_ms;
        self.windows
            .get(&key)
            .map(|entry| entry.iter().filter(|ts| **ts > cutoff).count())
            .unwrap_or(0)
    }

    /// Drops empty per-key queues so long-idle identifiers don't leak
    /// memory forever. Run periodically by the node binary, not per-request.
    pub fn sweep(&self, now: TimestampMs) {
        let cutoff = now - self.window_ms;
        self.windows.retain(|_, entries| {
            while matches!(entries.front(), Some(ts) if *ts <= cutoff) {
                entries.pop_front();
            }
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_requests_under_the_limit() {
        let limiter = RateLimiter::new(60_000);
        for i in 0..5 {
            assert!(limiter.check_and_insert_with_max(Tier::Free, "tenant-a", i, 5));
        }
        assert!(!limiter.check_and_insert_with_max(Tier::Free, "tenant-a", 5, 5));
    }

    #[test]
    fn window_slides_and_readmits_after_expiry() {
        let limiter = RateLimiter::new(1_000);
        assert!(limiter.check_and_insert_with_max(Tier::Free, "tenant-a", 0, 1));
        assert!(!limiter.check_and_insert_with_max(Tier::Free, "tenant-a", 500, 1));
        assert!(limiter.check_and_insert_with_max(Tier::Free, "tenant-a", 1_001, 1));
    }

    #[test]
    fn different_identifiers_do_not_share_a_window() {
        let limiter = RateLimiter::new(60_000);
        assert!(limiter.check_and_insert_with_max(Tier::Free, "tenant-a", 0, 1));
        assert!(limiter.check_and_insert_with_max(Tier::Free, "tenant-b", 0, 1));
    }

    #[test]
    fn different_tiers_for_the_same_identifier_do_not_share_a_window() {
        let limiter = RateLimiter::new(60_000);
        assert!(limiter.check_and_insert_with_max(Tier::Free, "same-key", 0, 1));
        assert!(limiter.check_and_insert_with_max(Tier::Pro, "same-key", 0, 1));
    }

    #[test]
    fn sweep_drops_fully_expired_keys() {
        let limiter = RateLimiter::new(1_000);
        limiter.check_and_insert_with_max(Tier::Free, "tenant-a", 0, 5);
        limiter.sweep(5_000);
        assert_eq!(limiter.current_count(Tier::Free, "tenant-a", 5_000), 0);
    }

    #[test]
    fn tier_defaults_scale_enterprise_above_free() {
        let limiter = RateLimiter::default();
        for i in 0..RATE_LIMIT_FREE_MAX as i64 {
            assert!(limiter.check_and_insert(Tier::Free, "tenant-free", i));
        }
        assert!(!limiter.check_and_insert(Tier::Free, "tenant-free", RATE_LIMIT_FREE_MAX as i64));
        for i in 0..RATE_LIMIT_ENTERPRISE_MAX as i64 {
            assert!(limiter.check_and_insert(Tier::Enterprise, "tenant-ent", i));
        }
    }
}
