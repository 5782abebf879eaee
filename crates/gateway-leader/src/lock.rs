//! `LeaderLock`: single-writer election with a fencing token.
//!
//! A thin wrapper over a handful of sled operations behind a narrow public
//! API, with a background task spawned for the TTL-refresh loop.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use gateway_core::constants::{LEADER_LEASE_SECS, LEADER_REFRESH_DIVISOR};
use gateway_core::error::GatewayError;
use gateway_core::types::{FencingToken, TimestampMs};

#[derive(Clone, Serialize, Deserialize)]
struct HolderEntry {
    holder_id: String,
    fencing_token: FencingToken,
    expires_at: TimestampMs,
}

/// Result of one `acquire` attempt.
#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    pub acquired: bool,
    pub fencing_token: FencingToken,
    pub current_holder: String,
}

/// Invoked from the refresh task when a lease renewal fails — the caller is
/// expected to stop treating itself as leader (e.g. reject further
/// `EventLog::append` calls) the moment this fires.
pub type LossCallback = Arc<dyn Fn() + Send + Sync>;

/// Distributed mutual-exclusion lock with a monotonically increasing fencing
/// token, backed by a single sled key so acquisition and fencing-token bump
/// happen in one atomic write.
pub struct LeaderLock {
    tree: sled::Tree,
    holder_id: String,
    lease: Duration,
    refresh_divisor: i64,
    is_leader: Arc<AtomicBool>,
    current_token: Arc<AtomicU64>,
    lost_at: Arc<AtomicI64>,
    refresh_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

const HOLDER_KEY: &[u8] = b"holder";

impl LeaderLock {
    pub fn new(tree: sled::Tree, holder_id: impl Into<String>) -> Self {
        Self {
            tree,
            holder_id: holder_id.into(),
            lease: Duration::from_secs(LEADER_LEASE_SECS as u64),
            refresh_divisor: LEADER_REFRESH_DIVISOR,
            is_leader: Arc::new(AtomicBool::new(false)),
            current_token: Arc::new(AtomicU64::new(0)),
            lost_at: Arc::new(AtomicI64::new(0)),
            refresh_task: std::sync::Mutex::new(None),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn read_holder(&self) -> Result<Option<HolderEntry>, GatewayError> {
        match self.tree.get(HOLDER_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Attempt to acquire (or re-acquire) leadership. Succeeds if the key is
    /// absent, expired, or already held by this instance; on success the
    /// fencing token strictly increases relative to any prior holder's token.
    pub fn acquire(&self, now: TimestampMs) -> Result<AcquireOutcome, GatewayError> {
        let existing = self.read_holder()?;
        if let Some(ref holder) = existing {
            let still_valid = holder.expires_at > now;
            if still_valid && holder.holder_id != self.holder_id {
                return Ok(AcquireOutcome {
                    acquired: false,
                    fencing_token: holder.fencing_token,
                    current_holder: holder.holder_id.clone(),
                });
            }
        }

        let next_token = existing.as_ref().map(|h| h.fencing_token).unwrap_or(0) + 1;
        let entry = HolderEntry {
            holder_id: self.holder_id.clone(),
            fencing_token: next_token,
            expires_at: now + self.lease.as_millis() as i64,
        };
        let bytes = bincode::serialize(&entry)?;

        let expected = existing
            .as_ref()
            .map(|_| bincode::serialize(existing.as_ref().unwrap()).unwrap());
        let cas = self
            .tree
            .compare_and_swap(HOLDER_KEY, expected.as_deref(), Some(bytes.as_slice()))?;
        if cas.is_err() {
            // Lost the race to another acquirer between read and CAS.
            let now_holder = self.read_holder()?.ok_or(GatewayError::InvalidFencingToken)?;
            return Ok(AcquireOutcome {
                acquired: false,
                fencing_token: now_holder.fencing_token,
                current_holder: now_holder.holder_id,
            });
        }

        self.is_leader.store(true, Ordering::SeqCst);
        self.current_token.store(next_token, Ordering::SeqCst);
        info!(holder = %self.holder_id, fencing_token = next_token, "acquired leader lock");
        Ok(AcquireOutcome {
            acquired: true,
            fencing_token: next_token,
            current_holder: self.holder_id.clone(),
        })
    }

    /// Release the lock, but only if it is still held by this instance.
    pub fn release(&self) -> Result<(), GatewayError> {
        if let Some(holder) = self.read_holder()? {
            if holder.holder_id == self.holder_id {
                let expected = bincode::serialize(&holder)?;
                let _ = self.tree.compare_and_swap(HOLDER_KEY, Some(expected.as_slice()), None)?;
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// True iff this instance believes itself to be leader *and* `token`
    /// equals the fencing value it was granted. `EventLog::append` callers
    /// must check this immediately before every append.
    pub fn validate(&self, token: FencingToken) -> bool {
        self.is_leader.load(Ordering::SeqCst) && self.current_token.load(Ordering::SeqCst) == token
    }

    pub fn current_fencing_token(&self) -> FencingToken {
        self.current_token.load(Ordering::SeqCst)
    }

    pub fn is_leader_now(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Spawn the background TTL-refresh task. Extends the lease every
    /// `lease / refresh_divisor`; on a failed refresh (lost the race, or
    /// storage error) transitions to "lost" and invokes `on_loss` exactly
    /// once. The returned handle is cancel-safe: dropping it (or calling
    /// `stop_refresh`) aborts the task — no timer survives past that point.
    pub fn spawn_refresh(self: &Arc<Self>, on_loss: LossCallback) {
        let lock = Arc::clone(self);
        let period = self.lease / (self.refresh_divisor.max(1) as u32);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if !lock.is_leader.load(Ordering::SeqCst) {
                    continue;
                }
                let now = chrono::Utc::now().timestamp_millis();
                match lock.try_refresh(now) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(holder = %lock.holder_id, "lease refresh lost race, stepping down");
                        lock.is_leader.store(false, Ordering::SeqCst);
                        lock.lost_at.store(now, Ordering::SeqCst);
                        on_loss();
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "lease refresh storage error, stepping down");
                        lock.is_leader.store(false, Ordering::SeqCst);
                        lock.lost_at.store(now, Ordering::SeqCst);
                        on_loss();
                        break;
                    }
                }
            }
        });
        *self.refresh_task.lock().expect("refresh task lock poisoned") = Some(handle);
    }

    pub fn stop_refresh(&self) {
        if let Some(handle) = self.refresh_task.lock().expect("refresh task lock poisoned").take() {
            handle.abort();
        }
    }

    fn try_refresh(&self, now: TimestampMs) -> Result<bool, GatewayError> {
        let Some(holder) = self.read_holder()? else {
            return Ok(false);
        };
        if holder.holder_id != self.holder_id {
            return Ok(false);
        }
        let mut updated = holder.clone();
        updated.expires_at = now + self.lease.as_millis() as i64;
        let expected = bincode::serialize(&holder)?;
        let desired = bincode::serialize(&updated)?;
        let cas = self
            .tree
            .compare_and_swap(HOLDER_KEY, Some(expected.as_slice()), Some(desired.as_slice()))?;
        Ok(cas.is_ok())
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        self.stop_refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> sled::Tree {
        sled::Config::new()
            .temporary(true)
            .open()
            .unwrap()
            .open_tree("lock")
            .unwrap()
    }

    #[test]
    fn first_acquire_succeeds_with_fencing_token_one() {
        let lock = LeaderLock::new(tree(), "node-a");
        let outcome = lock.acquire(1_000).unwrap();
        assert!(outcome.acquired);
        assert_eq!(outcome.fencing_token, 1);
        assert!(lock.validate(1));
    }

    #[test]
    fn second_holder_blocked_while_lease_valid() {
        let t = tree();
        let a = LeaderLock::new(t.clone(), "node-a");
        let b = LeaderLock::new(t, "node-b");
        a.acquire(1_000).unwrap();
        let outcome = b.acquire(1_500).unwrap();
        assert!(!outcome.acquired);
        assert_eq!(outcome.current_holder, "node-a");
    }

    #[test]
    fn new_leader_gets_strictly_greater_fencing_token_after_failover() {
        let t = tree();
        let a = LeaderLock::new(t.clone(), "node-a").with_lease(Duration::from_millis(10));
        let b = LeaderLock::new(t, "node-b").with_lease(Duration::from_millis(10));
        let first = a.acquire(1_000).unwrap();
        // Lease expires; node-b acquires after expiry.
        let second = b.acquire(2_000).unwrap();
        assert!(second.acquired);
        assert!(second.fencing_token > first.fencing_token);
        // The old leader's token no longer validates.
        assert!(!a.validate(first.fencing_token));
    }

    #[test]
    fn release_clears_holder_for_next_acquirer() {
        let t = tree();
        let a = LeaderLock::new(t.clone(), "node-a");
        let b = LeaderLock::new(t, "node-b");
        a.acquire(1_000).unwrap();
        a.release().unwrap();
        let outcome = b.acquire(1_001).unwrap();
        assert!(outcome.acquired);
    }
}
