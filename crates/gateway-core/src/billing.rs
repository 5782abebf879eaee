//! The `BillingEntry` lifecycle object and its state enum.
//!
//! This module holds data shapes only. The transition logic (the adjacency
//! table and the operations that apply it) lives in
//! `gateway-ledger::billing::BillingStateMachine`, which composes this type
//! with `EventLog`, `CreditLedger`, and `FinalizeQueue`.

use serde::{Deserialize, Serialize};

use crate::types::{AccountId, CorrelationId, EntryId, Micros, Sequence, TimestampMs};

/// A billing entry's current phase. Legal adjacency:
///
/// ```text
/// Idle           -> ReserveHeld
/// ReserveHeld    -> Committed | Released
/// Committed      -> FinalizePending | Voided
/// FinalizePending -> FinalizeAcked | FinalizeFailed
/// FinalizeFailed -> FinalizePending | Voided
/// Released, FinalizeAcked, Voided -- terminal
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingState {
    Idle,
    ReserveHeld,
    Committed,
    FinalizePending,
    FinalizeAcked,
    FinalizeFailed,
    Released,
    Voided,
}

impl BillingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BillingState::Released | BillingState::FinalizeAcked | BillingState::Voided
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingState::Idle => "idle",
            BillingState::ReserveHeld => "reserve_held",
            BillingState::Committed => "committed",
            BillingState::FinalizePending => "finalize_pending",
            BillingState::FinalizeAcked => "finalize_acked",
            BillingState::FinalizeFailed => "finalize_failed",
            BillingState::Released => "released",
            BillingState::Voided => "voided",
        }
    }

    /// True iff `self -> next` appears in the adjacency table above.
    pub fn can_transition_to(&self, next: BillingState) -> bool {
        use BillingState::*;
        matches!(
            (self, next),
            (Idle, ReserveHeld)
                | (ReserveHeld, Committed)
                | (ReserveHeld, Released)
                | (Committed, FinalizePending)
                | (Committed, Voided)
                | (FinalizePending, FinalizeAcked)
                | (FinalizePending, FinalizeFailed)
                | (FinalizeFailed, FinalizePending)
                | (FinalizeFailed, Voided)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    ClientCancelled,
    EstimateExpired,
    AdminOverride,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoidReason {
    ProviderRefund,
    ChargebackDispute,
    AdminCorrection,
    ReorgReverted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizeFailReason {
    AcknowledgerUnreachable,
    AcknowledgerRejected,
    Timeout,
}

/// One chargeable operation's lifecycle record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingEntry {
    pub entry_id: EntryId,
    pub correlation_id: CorrelationId,
    pub state: BillingState,
    pub account_id: AccountId,
    pub estimated_cost: Micros,
    pub actual_cost: Option<Micros>,
    pub exchange_rate_snapshot: f64,
    pub wal_offset: Sequence,
    pub finalize_attempts: u32,
    pub was_aborted: bool,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl BillingEntry {
    pub fn new(
        entry_id: EntryId,
        correlation_id: CorrelationId,
        account_id: AccountId,
        estimated_cost: Micros,
        exchange_rate_snapshot: f64,
        wal_offset: Sequence,
        now: TimestampMs,
    ) -> Self {
        Self {
            entry_id,
            correlation_id,
            state: BillingState::ReserveHeld,
            account_id,
            estimated_cost,
            actual_cost: None,
            exchange_rate_snapshot,
            wal_offset,
            finalize_attempts: 0,
            was_aborted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacency_table_allows_only_the_documented_edges() {
        assert!(BillingState::Idle.can_transition_to(BillingState::ReserveHeld));
        assert!(!BillingState::Idle.can_transition_to(BillingState::Committed));
        assert!(BillingState::ReserveHeld.can_transition_to(BillingState::Committed));
        assert!(BillingState::ReserveHeld.can_transition_to(BillingState::Released));
        assert!(BillingState::Committed.can_transition_to(BillingState::FinalizePending));
        assert!(BillingState::Committed.can_transition_to(BillingState::Voided));
        assert!(BillingState::FinalizePending.can_transition_to(BillingState::FinalizeAcked));
        assert!(BillingState::FinalizePending.can_transition_to(BillingState::FinalizeFailed));
        assert!(BillingState::FinalizeFailed.can_transition_to(BillingState::FinalizePending));
        assert!(BillingState::FinalizeFailed.can_transition_to(BillingState::Voided));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [BillingState::Released, BillingState::FinalizeAcked, BillingState::Voided] {
            assert!(terminal.is_terminal());
            for next in [
                BillingState::Idle,
                BillingState::ReserveHeld,
                BillingState::Committed,
                BillingState::FinalizePending,
                BillingState::FinalizeAcked,
                BillingState::FinalizeFailed,
                BillingState::Released,
                BillingState::Voided,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn released_is_reachable_only_from_reserve_held() {
        for state in [
            BillingState::Idle,
            BillingState::Committed,
            BillingState::FinalizePending,
            BillingState::FinalizeFailed,
        ] {
            assert!(!state.can_transition_to(BillingState::Released));
        }
    }
}
