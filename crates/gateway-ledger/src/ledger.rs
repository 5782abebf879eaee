//! `CreditLedger`: the five-bucket credit ledger.
//!
//! Each operation follows the same three-step commit ordering: (1) append an
//! `EventRecord` to the `EventLog` on this account's stream, (2) mutate the
//! in-memory `Account` projection and persist it alongside the journal row in
//! one `LedgerDb::commit_ledger_op` transaction, (3) leave any async side
//! effect (finalize acknowledgement, etc.) to the caller. Each operation
//! stages a mutated snapshot against a freshly-loaded account, validates it,
//! then commits the snapshot in one storage transaction — never interleave
//! validation with a partial write.

use std::sync::Arc;

use gateway_core::account::Account;
use gateway_core::error::GatewayError;
use gateway_core::transaction::LedgerOp;
use gateway_core::types::{AccountId, CorrelationId, IdempotencyKey, Micros, StreamName, TimestampMs};
use gateway_eventlog::EventLog;
use gateway_leader::LeaderLock;

use crate::db::LedgerDb;

/// Returns the per-account event stream: one sequence space per account so
/// replay and leader failover never need to reason about cross-account
/// ordering.
fn account_stream(account_id: &AccountId) -> StreamName {
    StreamName::new(format!("ledger:{}", account_id.as_str()))
}

pub struct CreditLedger {
    db: Arc<LedgerDb>,
    log: Arc<EventLog>,
    leader: Arc<LeaderLock>,
}

impl CreditLedger {
    /// `leader` must be the same lock the node acquired at startup — every
    /// WAL write this ledger makes is fenced against it (I4/P8).
    pub fn new(db: Arc<LedgerDb>, log: Arc<EventLog>, leader: Arc<LeaderLock>) -> Self {
        Self { db, log, leader }
    }

    pub fn db(&self) -> &LedgerDb {
        &self.db
    }

    pub fn get_account(&self, account_id: &AccountId) -> Result<Account, GatewayError> {
        self.db
            .get_account(account_id)?
            .ok_or_else(|| GatewayError::AccountNotFound(account_id.to_string()))
    }

    /// Create a new account with its full `initial_allocation` sitting in the
    /// `allocated` bucket. Idempotent on `idempotency_key`: a retry with the
    /// same key returns success without creating a second account.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &self,
        account_id: AccountId,
        initial_allocation: Micros,
        tier: gateway_core::account::AccountTier,
        expires_at: TimestampMs,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        if let Some(existing) = self.db.get_transaction_by_key(&idempotency_key)? {
            let _ = existing;
            return self.get_account(&account_id);
        }

        let account = Account::new(account_id.clone(), initial_allocation, tier, expires_at, now);
        if !account.conserves() {
            return Err(GatewayError::ConservationViolatedPreWrite(account_id.to_string()));
        }

        self.commit(
            &account_id,
            LedgerOp::Allocate,
            initial_allocation,
            idempotency_key,
            correlation_id,
            now,
            account.clone(),
        )?;
        Ok(account)
    }

    /// `allocated -> unlocked`. Precondition: `amount <= allocated`.
    pub fn unlock(
        &self,
        account_id: &AccountId,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if amount > acct.allocated {
                return Err(GatewayError::InsufficientBalance {
                    bucket: "allocated",
                    need: amount,
                    have: acct.allocated,
                });
            }
            acct.allocated -= amount;
            acct.unlocked += amount;
            Ok((LedgerOp::Unlock, amount))
        })
    }

    /// `unlocked -> reserved`. Precondition: `amount <= unlocked`.
    pub fn reserve(
        &self,
        account_id: &AccountId,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if amount > acct.unlocked {
                return Err(GatewayError::InsufficientBalance {
                    bucket: "unlocked",
                    need: amount,
                    have: acct.unlocked,
                });
            }
            acct.unlocked -= amount;
            acct.reserved += amount;
            Ok((LedgerOp::Reserve, amount))
        })
    }

    /// `reserved -> consumed`. Precondition: `amount <= reserved`. `amount`
    /// may be less than what was originally reserved (actual usage can
    /// undershoot the reservation) — the remainder is left in
    /// `reserved` for the caller to `release` separately.
    pub fn consume(
        &self,
        account_id: &AccountId,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if amount > acct.reserved {
                return Err(GatewayError::InsufficientBalance {
                    bucket: "reserved",
                    need: amount,
                    have: acct.reserved,
                });
            }
            acct.reserved -= amount;
            acct.consumed += amount;
            Ok((LedgerOp::Consume, amount))
        })
    }

    /// `reserved -> unlocked`. Returns an un-consumed reservation to the
    /// spendable pool (a voided or partially-undershooting reservation).
    pub fn release(
        &self,
        account_id: &AccountId,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if amount > acct.reserved {
                return Err(GatewayError::InsufficientBalance {
                    bucket: "reserved",
                    need: amount,
                    have: acct.reserved,
                });
            }
            acct.reserved -= amount;
            acct.unlocked += amount;
            Ok((LedgerOp::Release, amount))
        })
    }

    /// `consumed -> unlocked`: reverses a prior `consume` (a voided billing
    /// entry). Precondition: `amount <= consumed`.
    pub fn rollback_consumed(
        &self,
        account_id: &AccountId,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if amount > acct.consumed {
                return Err(GatewayError::InsufficientBalance {
                    bucket: "consumed",
                    need: amount,
                    have: acct.consumed,
                });
            }
            acct.consumed -= amount;
            acct.unlocked += amount;
            Ok((LedgerOp::Rollback, amount))
        })
    }

    /// `allocated + unlocked -> expired`. Precondition: `now > expires_at`.
    /// Sweeps whatever remains unspent into the terminal `expired` bucket;
    /// credits already `reserved` or `consumed` are untouched.
    pub fn expire(
        &self,
        account_id: &AccountId,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if now <= acct.expires_at {
                return Err(GatewayError::ReservationExpired);
            }
            let amount = acct.allocated + acct.unlocked;
            acct.expired += amount;
            acct.allocated = 0;
            acct.unlocked = 0;
            Ok((LedgerOp::Expire, amount))
        })
    }

    /// `unlocked -> reserved`, marking the moved amount as frozen pending
    /// reorg-divergence investigation. Precondition:
    /// `amount <= unlocked`.
    pub fn freeze(
        &self,
        account_id: &AccountId,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if amount > acct.unlocked {
                return Err(GatewayError::InsufficientBalance {
                    bucket: "unlocked",
                    need: amount,
                    have: acct.unlocked,
                });
            }
            acct.unlocked -= amount;
            acct.reserved += amount;
            acct.frozen += amount;
            Ok((LedgerOp::Freeze, amount))
        })
    }

    /// Reverses a prior `freeze`: `reserved -> unlocked`, unmarking the
    /// amount as frozen. Precondition: `amount <= frozen`.
    pub fn unfreeze(
        &self,
        account_id: &AccountId,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
    ) -> Result<Account, GatewayError> {
        self.apply(account_id, idempotency_key, correlation_id, now, |acct| {
            if amount > acct.frozen {
                return Err(GatewayError::InsufficientBalance {
                    bucket: "frozen",
                    need: amount,
                    have: acct.frozen,
                });
            }
            acct.reserved -= amount;
            acct.frozen -= amount;
            acct.unlocked += amount;
            Ok((LedgerOp::Unfreeze, amount))
        })
    }

    /// Runs `mutate` against a freshly-loaded snapshot, checks conservation on
    /// the result, and commits the snapshot plus its journal row atomically.
    /// `f` returns the op/amount pair recorded on the journal row.
    fn apply(
        &self,
        account_id: &AccountId,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
        mutate: impl FnOnce(&mut Account) -> Result<(LedgerOp, Micros), GatewayError>,
    ) -> Result<Account, GatewayError> {
        if let Some(_prior) = self.db.get_transaction_by_key(&idempotency_key)? {
            return self.get_account(account_id);
        }

        let mut account = self.get_account(account_id)?;
        if !account.conserves() {
            return Err(GatewayError::ConservationViolatedPreWrite(account_id.to_string()));
        }

        let (op, amount) = mutate(&mut account)?;
        account.updated_at = now;

        self.commit(account_id, op, amount, idempotency_key, correlation_id, now, account.clone())?;
        Ok(account)
    }

    fn commit(
        &self,
        account_id: &AccountId,
        op: LedgerOp,
        amount: Micros,
        idempotency_key: IdempotencyKey,
        correlation_id: CorrelationId,
        now: TimestampMs,
        account: Account,
    ) -> Result<(), GatewayError> {
        if !account.conserves() {
            return Err(GatewayError::ConservationViolatedPostWrite {
                account: account_id.to_string(),
                sum: account.bucket_sum(),
                initial: account.initial_allocation,
            });
        }

        let stream = account_stream(account_id);
        let payload = serde_json::json!({
            "account_id": account_id.as_str(),
            "op": op.as_str(),
            "amount": amount.to_string(),
        });
        let record = self.log.append(
            &stream,
            op.as_str(),
            payload,
            correlation_id.clone(),
            now,
            &self.leader,
            self.leader.current_fencing_token(),
        )?;

        let tx = gateway_core::transaction::LedgerTransaction {
            account_id: account_id.clone(),
            op,
            amount,
            correlation_id,
            idempotency_key,
            timestamp: now,
            metadata: serde_json::json!({ "wal_sequence": record.sequence }),
        };
        self.db.commit_ledger_op(&account, &tx)
    }
}
