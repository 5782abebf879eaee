//! `BillingStateMachine`: the `BillingEntry` lifecycle.
//!
//! Composes `CreditLedger` (bucket mutation), `EventLog` (the `billing_*`
//! event trail), and `FinalizeQueue` (the async acknowledgement handoff). The
//! adjacency table itself lives on `gateway_core::billing::BillingState` —
//! this module only ever calls `can_transition_to` before mutating, never
//! re-derives it.

use std::sync::Arc;

use rand::Rng;

use gateway_core::billing::{BillingEntry, BillingState, FinalizeFailReason, ReleaseReason, VoidReason};
use gateway_core::error::GatewayError;
use gateway_core::transaction::event_types;
use gateway_core::types::{AccountId, CorrelationId, EntryId, IdempotencyKey, Micros, StreamName, TimestampMs};
use gateway_eventlog::EventLog;
use gateway_leader::LeaderLock;
use gateway_queue::{FinalizeItem, FinalizeQueue};

use crate::db::LedgerDb;
use crate::ledger::CreditLedger;

fn billing_stream(account_id: &AccountId) -> StreamName {
    StreamName::new(format!("billing:{}", account_id.as_str()))
}

pub struct BillingStateMachine {
    db: Arc<LedgerDb>,
    log: Arc<EventLog>,
    ledger: Arc<CreditLedger>,
    queue: Arc<FinalizeQueue>,
    leader: Arc<LeaderLock>,
}

impl BillingStateMachine {
    pub fn new(
        db: Arc<LedgerDb>,
        log: Arc<EventLog>,
        ledger: Arc<CreditLedger>,
        queue: Arc<FinalizeQueue>,
        leader: Arc<LeaderLock>,
    ) -> Self {
        Self { db, log, ledger, queue, leader }
    }

    pub fn get_entry(&self, entry_id: &EntryId) -> Result<BillingEntry, GatewayError> {
        self.db
            .get_billing_entry(entry_id)?
            .ok_or_else(|| GatewayError::EntryNotFound(entry_id.to_string()))
    }

    fn require_transition(&self, entry: &BillingEntry, next: BillingState) -> Result<(), GatewayError> {
        if !entry.state.can_transition_to(next) {
            return Err(GatewayError::IllegalTransition {
                from: entry.state.as_str().to_string(),
                attempted: next.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn append_event(
        &self,
        account_id: &AccountId,
        event_type: &str,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<gateway_core::types::Sequence, GatewayError> {
        let stream = billing_stream(account_id);
        let record = self.log.append(
            &stream,
            event_type,
            payload,
            correlation_id,
            now,
            &self.leader,
            self.leader.current_fencing_token(),
        )?;
        Ok(record.sequence)
    }

    /// `idle -> reserve_held`: creates a new entry and reserves
    /// `estimated_cost` against the account's unlocked balance.
    pub fn reserve(
        &self,
        account_id: AccountId,
        estimated_cost: Micros,
        exchange_rate_snapshot: f64,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<BillingEntry, GatewayError> {
        self.ledger.reserve(
            &account_id,
            estimated_cost,
            format!("{idempotency_key}:ledger-reserve"),
            correlation_id.clone(),
            now,
        )?;

        let entry_id = EntryId::new(now, rand::thread_rng().gen());
        let wal_offset = self.append_event(
            &account_id,
            event_types::BILLING_RESERVE,
            serde_json::json!({
                "entry_id": entry_id.to_string(),
                "estimated_cost": estimated_cost.to_string(),
            }),
            correlation_id.clone(),
            now,
        )?;

        let entry = BillingEntry::new(entry_id, correlation_id, account_id, estimated_cost, exchange_rate_snapshot, wal_offset, now);
        self.db.put_billing_entry(&entry)?;
        Ok(entry)
    }

    /// `reserve_held -> committed -> finalize_pending`: settles the entry at
    /// `actual_cost`, returning any un-spent reservation to `unlocked`, then
    /// immediately enqueues the external acknowledgement job — a committed
    /// entry never rests in `committed`, it sits in `finalize_pending`
    /// awaiting the acknowledger.
    pub fn commit(
        &self,
        entry_id: &EntryId,
        actual_cost: Micros,
        was_aborted: bool,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<BillingEntry, GatewayError> {
        let mut entry = self.get_entry(entry_id)?;
        self.require_transition(&entry, BillingState::Committed)?;

        self.ledger.consume(
            &entry.account_id,
            actual_cost,
            format!("{idempotency_key}:ledger-consume"),
            correlation_id.clone(),
            now,
        )?;
        if actual_cost < entry.estimated_cost {
            let residual = entry.estimated_cost - actual_cost;
            self.ledger.release(
                &entry.account_id,
                residual,
                format!("{idempotency_key}:ledger-release-residual"),
                correlation_id.clone(),
                now,
            )?;
        }

        entry.wal_offset = self.append_event(
            &entry.account_id,
            event_types::BILLING_COMMIT,
            serde_json::json!({
                "entry_id": entry_id.to_string(),
                "actual_cost": actual_cost.to_string(),
            }),
            correlation_id.clone(),
            now,
        )?;
        entry.actual_cost = Some(actual_cost);
        entry.was_aborted = was_aborted;
        entry.state = BillingState::FinalizePending;
        entry.updated_at = now;
        self.db.put_billing_entry(&entry)?;

        self.queue.enqueue(
            FinalizeItem {
                entry_id: entry.entry_id,
                account_id: entry.account_id.clone(),
                amount: actual_cost,
                correlation_id,
                attempt: 0,
            },
            now,
        )?;
        Ok(entry)
    }

    /// `reserve_held -> released`: the reservation is abandoned, its credits
    /// returned to `unlocked`.
    pub fn release(
        &self,
        entry_id: &EntryId,
        reason: ReleaseReason,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<BillingEntry, GatewayError> {
        let mut entry = self.get_entry(entry_id)?;
        self.require_transition(&entry, BillingState::Released)?;

        self.ledger.release(
            &entry.account_id,
            entry.estimated_cost,
            format!("{idempotency_key}:ledger-release"),
            correlation_id.clone(),
            now,
        )?;

        entry.wal_offset = self.append_event(
            &entry.account_id,
            event_types::BILLING_RELEASE,
            serde_json::json!({ "entry_id": entry_id.to_string(), "reason": format!("{reason:?}") }),
            correlation_id,
            now,
        )?;
        entry.state = BillingState::Released;
        entry.updated_at = now;
        self.db.put_billing_entry(&entry)?;
        Ok(entry)
    }

    /// `committed|finalize_failed -> voided`: rolls back whatever was
    /// consumed back to `unlocked`.
    pub fn void(
        &self,
        entry_id: &EntryId,
        reason: VoidReason,
        admin_id: Option<&str>,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<BillingEntry, GatewayError> {
        let mut entry = self.get_entry(entry_id)?;
        self.require_transition(&entry, BillingState::Voided)?;

        if let Some(actual_cost) = entry.actual_cost {
            self.ledger.rollback_consumed(
                &entry.account_id,
                actual_cost,
                format!("{idempotency_key}:ledger-rollback"),
                correlation_id.clone(),
                now,
            )?;
        }

        entry.wal_offset = self.append_event(
            &entry.account_id,
            event_types::BILLING_VOID,
            serde_json::json!({
                "entry_id": entry_id.to_string(),
                "reason": format!("{reason:?}"),
                "admin_id": admin_id,
            }),
            correlation_id,
            now,
        )?;
        entry.state = BillingState::Voided;
        entry.updated_at = now;
        self.db.put_billing_entry(&entry)?;
        Ok(entry)
    }

    /// `finalize_pending -> finalize_acked`: state-only, records the
    /// acknowledger's response status.
    pub fn finalize_ack(
        &self,
        entry_id: &EntryId,
        response_status: &str,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<BillingEntry, GatewayError> {
        let mut entry = self.get_entry(entry_id)?;
        self.require_transition(&entry, BillingState::FinalizeAcked)?;

        entry.wal_offset = self.append_event(
            &entry.account_id,
            event_types::BILLING_FINALIZE_ACK,
            serde_json::json!({ "entry_id": entry_id.to_string(), "response_status": response_status }),
            correlation_id,
            now,
        )?;
        entry.state = BillingState::FinalizeAcked;
        entry.updated_at = now;
        self.db.put_billing_entry(&entry)?;
        Ok(entry)
    }

    /// `finalize_pending -> finalize_failed`: state-only, the caller (the
    /// `FinalizeQueue` consumer) decides separately whether to retry.
    pub fn finalize_fail(
        &self,
        entry_id: &EntryId,
        reason: FinalizeFailReason,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<BillingEntry, GatewayError> {
        let mut entry = self.get_entry(entry_id)?;
        self.require_transition(&entry, BillingState::FinalizeFailed)?;

        entry.wal_offset = self.append_event(
            &entry.account_id,
            event_types::BILLING_FINALIZE_FAIL,
            serde_json::json!({ "entry_id": entry_id.to_string(), "reason": format!("{reason:?}") }),
            correlation_id,
            now,
        )?;
        entry.state = BillingState::FinalizeFailed;
        entry.finalize_attempts += 1;
        entry.updated_at = now;
        self.db.put_billing_entry(&entry)?;
        Ok(entry)
    }

    /// `finalize_failed -> finalize_pending`: re-admits the entry for
    /// another acknowledgement attempt. State-only; the actual requeue onto
    /// `FinalizeQueue` happens via `FinalizeOutcome::Rescheduled` in the
    /// consumer loop, not here.
    pub fn retry_finalize(&self, entry_id: &EntryId, now: TimestampMs) -> Result<BillingEntry, GatewayError> {
        let mut entry = self.get_entry(entry_id)?;
        self.require_transition(&entry, BillingState::FinalizePending)?;
        entry.state = BillingState::FinalizePending;
        entry.updated_at = now;
        self.db.put_billing_entry(&entry)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::account::AccountTier;

    fn leader_lock() -> Arc<LeaderLock> {
        let tree = sled::Config::new().temporary(true).open().unwrap().open_tree("leader").unwrap();
        let lock = LeaderLock::new(tree, "test-node");
        lock.acquire(0).unwrap();
        Arc::new(lock)
    }

    fn machine() -> (BillingStateMachine, AccountId) {
        let db = Arc::new(LedgerDb::open_temporary().unwrap());
        let log = Arc::new(EventLog::open_temporary().unwrap());
        let leader = leader_lock();
        let ledger = Arc::new(CreditLedger::new(db.clone(), log.clone(), leader.clone()));
        let qdb = sled::Config::new().temporary(true).open().unwrap();
        let queue = Arc::new(FinalizeQueue::new(
            qdb.open_tree("pending").unwrap(),
            qdb.open_tree("in_flight").unwrap(),
            qdb.open_tree("dead_letter").unwrap(),
        ));
        let account_id = AccountId::new("0xabc");
        ledger
            .allocate(account_id.clone(), 10_000, AccountTier::Community, i64::MAX, "alloc-1".into(), "c0".into(), 0)
            .unwrap();
        ledger
            .unlock(&account_id, 10_000, "unlock-1".into(), "c0".into(), 0)
            .unwrap();
        (BillingStateMachine::new(db, log, ledger, queue, leader), account_id)
    }

    #[test]
    fn reserve_then_commit_moves_through_finalize_pending() {
        let (machine, account_id) = machine();
        let entry = machine.reserve(account_id.clone(), 1_000, 1.0, "k1".into(), "c1".into(), 1).unwrap();
        assert_eq!(entry.state, BillingState::ReserveHeld);

        let committed = machine.commit(&entry.entry_id, 700, false, "k2".into(), "c1".into(), 2).unwrap();
        assert_eq!(committed.state, BillingState::FinalizePending);
        assert_eq!(committed.actual_cost, Some(700));

        let account = machine.ledger.get_account(&account_id).unwrap();
        assert_eq!(account.consumed, 700);
        assert_eq!(account.unlocked, 9_300); // 10_000 - 1_000 reserved + 300 residual released
        assert!(account.conserves());
    }

    #[test]
    fn double_commit_is_illegal_transition() {
        let (machine, account_id) = machine();
        let entry = machine.reserve(account_id, 1_000, 1.0, "k1".into(), "c1".into(), 1).unwrap();
        machine.commit(&entry.entry_id, 700, false, "k2".into(), "c1".into(), 2).unwrap();
        let err = machine.commit(&entry.entry_id, 700, false, "k3".into(), "c1".into(), 3).unwrap_err();
        assert_eq!(err.kind(), gateway_core::error::ErrorKind::PreconditionViolated);
    }

    #[test]
    fn void_after_commit_rolls_back_consumed() {
        let (machine, account_id) = machine();
        let entry = machine.reserve(account_id.clone(), 1_000, 1.0, "k1".into(), "c1".into(), 1).unwrap();
        machine.commit(&entry.entry_id, 700, false, "k2".into(), "c1".into(), 2).unwrap();
        let voided = machine
            .void(&entry.entry_id, VoidReason::ChargebackDispute, None, "k3".into(), "c1".into(), 3)
            .unwrap();
        assert_eq!(voided.state, BillingState::Voided);

        let account = machine.ledger.get_account(&account_id).unwrap();
        assert_eq!(account.consumed, 0);
        assert!(account.conserves());
    }

    #[test]
    fn release_returns_full_reservation() {
        let (machine, account_id) = machine();
        let entry = machine.reserve(account_id.clone(), 1_000, 1.0, "k1".into(), "c1".into(), 1).unwrap();
        let released = machine
            .release(&entry.entry_id, ReleaseReason::ClientCancelled, "k2".into(), "c1".into(), 2)
            .unwrap();
        assert_eq!(released.state, BillingState::Released);

        let account = machine.ledger.get_account(&account_id).unwrap();
        assert_eq!(account.reserved, 0);
        assert_eq!(account.unlocked, 10_000);
    }

    #[test]
    fn finalize_fail_then_retry_then_ack() {
        let (machine, account_id) = machine();
        let entry = machine.reserve(account_id, 1_000, 1.0, "k1".into(), "c1".into(), 1).unwrap();
        let entry = machine.commit(&entry.entry_id, 1_000, false, "k2".into(), "c1".into(), 2).unwrap();

        let failed = machine
            .finalize_fail(&entry.entry_id, FinalizeFailReason::AcknowledgerUnreachable, "c1".into(), 3)
            .unwrap();
        assert_eq!(failed.state, BillingState::FinalizeFailed);
        assert_eq!(failed.finalize_attempts, 1);

        let retried = machine.retry_finalize(&entry.entry_id, 4).unwrap();
        assert_eq!(retried.state, BillingState::FinalizePending);

        let acked = machine.finalize_ack(&entry.entry_id, "200", "c1".into(), 5).unwrap();
        assert_eq!(acked.state, BillingState::FinalizeAcked);
        assert!(acked.state.is_terminal());
    }
}
