//! `FinalizeQueue`: the durable at-least-once finalize pipeline.
//!
//! Uses the same sled-tree CRUD idiom as `gateway-eventlog`, generalized
//! into a queue: the sort key is `next_visible_at`, so popping the
//! lexicographically-smallest key always pops the next-due item. A separate
//! `in_flight` tree implements the visibility timeout ("at-most-one
//! consumer per item").

use rand::Rng;
use serde::{Deserialize, Serialize};

use gateway_core::constants::{FINALIZE_BACKOFF_BASE_MS, FINALIZE_BACKOFF_JITTER, FINALIZE_BACKOFF_MAX_MS, FINALIZE_MAX_ATTEMPTS};
use gateway_core::error::GatewayError;
use gateway_core::types::{AccountId, CorrelationId, EntryId, Micros, TimestampMs};

/// One finalize job: acknowledge a committed billing entry with the external
/// billing acknowledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeItem {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub amount: Micros,
    pub correlation_id: CorrelationId,
    pub attempt: u32,
}

/// The external collaborator invoked by the queue's consumer loop.
#[async_trait::async_trait]
pub trait BillingAcknowledger: Send + Sync {
    async fn finalize(
        &self,
        entry_id: EntryId,
        account_id: &AccountId,
        amount: Micros,
        correlation_id: &CorrelationId,
    ) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Acked,
    Rescheduled { delay_ms: u64, attempt: u32 },
    DeadLettered { attempts: u32 },
}

/// A key into the `in_flight` tree, returned by `dequeue` and required to
/// `ack` or `fail` the item it names. Prevents a caller from acking an item
/// it never actually dequeued.
#[derive(Clone, Debug)]
pub struct DequeueGuard {
    key: Vec<u8>,
}

pub struct FinalizeQueue {
    pending: sled::Tree,
    in_flight: sled::Tree,
    dead_letter: sled::Tree,
    visibility_timeout_ms: i64,
}

impl FinalizeQueue {
    pub fn new(pending: sled::Tree, in_flight: sled::Tree, dead_letter: sled::Tree) -> Self {
        Self {
            pending,
            in_flight,
            dead_letter,
            visibility_timeout_ms: 30_000,
        }
    }

    pub fn with_visibility_timeout_ms(mut self, ms: i64) -> Self {
        self.visibility_timeout_ms = ms;
        self
    }

    /// Enqueue `item` for immediate delivery.
    pub fn enqueue(&self, item: FinalizeItem, now: TimestampMs) -> Result<(), GatewayError> {
        self.insert_pending(&item, now)
    }

    fn insert_pending(&self, item: &FinalizeItem, visible_at: TimestampMs) -> Result<(), GatewayError> {
        let key = sort_key(visible_at);
        let bytes = bincode::serialize(item)?;
        self.pending.insert(key, bytes)?;
        Ok(())
    }

    /// Pop the earliest item whose `next_visible_at <= now`, moving it into
    /// the `in_flight` tree under a lease that expires after
    /// `visibility_timeout_ms`. Returns `None` if nothing is ready.
    pub fn dequeue(&self, now: TimestampMs) -> Result<Option<(DequeueGuard, FinalizeItem)>, GatewayError> {
        let upper = sort_key(now + 1);
        for entry in self.pending.range(..upper) {
            let (key, bytes) = entry?;
            // Claim it by removing from pending first — if two callers race,
            // only one `remove` observes `Some`.
            if self.pending.remove(&key)?.is_none() {
                continue;
            }
            let item: FinalizeItem = bincode::deserialize(&bytes)?;
            let lease_key = sort_key(now + self.visibility_timeout_ms);
            self.in_flight.insert(&lease_key, bytes)?;
            return Ok(Some((DequeueGuard { key: lease_key }, item)));
        }
        Ok(None)
    }

    /// Acknowledge successful finalization: drop the in-flight lease.
    pub fn ack(&self, guard: DequeueGuard) -> Result<(), GatewayError> {
        self.in_flight.remove(&guard.key)?;
        Ok(())
    }

    /// Record a failed finalize attempt. Reschedules with exponential
    /// backoff `base * 2^attempt * (1 ± jitter)` up to a cap, or moves the
    /// item to the dead-letter tree once `FINALIZE_MAX_ATTEMPTS` is reached.
    pub fn fail(
        &self,
        guard: DequeueGuard,
        mut item: FinalizeItem,
        now: TimestampMs,
    ) -> Result<FinalizeOutcome, GatewayError> {
        self.in_flight.remove(&guard.key)?;
        item.attempt += 1;

        if item.attempt >= FINALIZE_MAX_ATTEMPTS {
            let bytes = bincode::serialize(&item)?;
            self.dead_letter.insert(item.entry_id.as_bytes(), bytes)?;
            return Ok(FinalizeOutcome::DeadLettered {
                attempts: item.attempt,
            });
        }

        let delay_ms = backoff_delay_ms(item.attempt);
        self.insert_pending(&item, now + delay_ms as i64)?;
        Ok(FinalizeOutcome::Rescheduled {
            delay_ms,
            attempt: item.attempt,
        })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.dead_letter.len()
    }

    /// Requeue in-flight items whose lease has expired without being acked
    /// or failed (consumer crashed mid-processing). Run this periodically.
    pub fn reclaim_expired(&self, now: TimestampMs) -> Result<usize, GatewayError> {
        let upper = sort_key(now + 1);
        let mut reclaimed = 0;
        for entry in self.in_flight.range(..upper) {
            let (key, bytes) = entry?;
            if self.in_flight.remove(&key)?.is_none() {
                continue;
            }
            let item: FinalizeItem = bincode::deserialize(&bytes)?;
            self.insert_pending(&item, now)?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

fn sort_key(visible_at: TimestampMs) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&(visible_at.max(0) as u64).to_be_bytes());
    key.extend_from_slice(&rand::thread_rng().gen::<u64>().to_be_bytes());
    key
}

/// `base * 2^attempt * (1 ± jitter)`, capped at `FINALIZE_BACKOFF_MAX_MS`.
fn backoff_delay_ms(attempt: u32) -> u64 {
    let raw = (FINALIZE_BACKOFF_BASE_MS as f64) * 2f64.powi(attempt as i32);
    let capped = raw.min(FINALIZE_BACKOFF_MAX_MS as f64);
    let jitter_span = capped * FINALIZE_BACKOFF_JITTER;
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    (capped + jitter).max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> FinalizeQueue {
        let db = sled::Config::new().temporary(true).open().unwrap();
        FinalizeQueue::new(
            db.open_tree("pending").unwrap(),
            db.open_tree("in_flight").unwrap(),
            db.open_tree("dead_letter").unwrap(),
        )
    }

    fn item() -> FinalizeItem {
        FinalizeItem {
            entry_id: EntryId::new(1000, 1),
            account_id: AccountId::new("0xabc"),
            amount: 500,
            correlation_id: "corr-1".into(),
            attempt: 0,
        }
    }

    #[test]
    fn enqueue_then_dequeue_round_trips() {
        let q = queue();
        q.enqueue(item(), 1_000).unwrap();
        let (guard, popped) = q.dequeue(1_000).unwrap().unwrap();
        assert_eq!(popped.entry_id, item().entry_id);
        q.ack(guard).unwrap();
        assert_eq!(q.pending_len(), 0);
    }

    #[test]
    fn dequeue_returns_none_before_visible_time() {
        let q = queue();
        q.enqueue(item(), 5_000).unwrap();
        assert!(q.dequeue(1_000).unwrap().is_none());
        assert!(q.dequeue(5_000).unwrap().is_some());
    }

    #[test]
    fn fail_reschedules_with_backoff_until_dead_letter() {
        let q = queue();
        q.enqueue(item(), 0).unwrap();
        let mut now = 0i64;
        let mut current = item();
        for expected_attempt in 1..FINALIZE_MAX_ATTEMPTS {
            let (guard, popped) = q.dequeue(now).unwrap().unwrap();
            current = popped;
            let outcome = q.fail(guard, current.clone(), now).unwrap();
            match outcome {
                FinalizeOutcome::Rescheduled { delay_ms, attempt } => {
                    assert_eq!(attempt, expected_attempt);
                    now += delay_ms as i64 + 1;
                }
                other => panic!("expected reschedule, got {other:?}"),
            }
        }
        let (guard, popped) = q.dequeue(now).unwrap().unwrap();
        let outcome = q.fail(guard, popped, now).unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::DeadLettered {
                attempts: FINALIZE_MAX_ATTEMPTS
            }
        );
        assert_eq!(q.dead_letter_len(), 1);
        let _ = current;
    }

    #[test]
    fn reclaim_expired_requeues_abandoned_leases() {
        let q = queue();
        q.enqueue(item(), 0).unwrap();
        let (_guard, _popped) = q.dequeue(0).unwrap().unwrap();
        // Simulate a crashed consumer: never ack/fail. Lease expires at 30_000ms.
        let reclaimed = q.reclaim_expired(30_001).unwrap();
        assert_eq!(reclaimed, 1);
        assert!(q.dequeue(30_001).unwrap().is_some());
    }
}
