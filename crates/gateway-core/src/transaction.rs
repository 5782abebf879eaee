use serde::{Deserialize, Serialize};

use crate::types::{AccountId, CorrelationId, IdempotencyKey, Micros, Sequence, StreamName, TimestampMs};

// ── LedgerTransaction ─────────────────────────────────────────────────────────

/// Describes which ledger buckets a transaction moved credits between.
/// Mirrors the operation table in `CreditLedger`: allocate, unlock, reserve,
/// consume, release, expire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOp {
    Allocate,
    Unlock,
    Reserve,
    Consume,
    Release,
    Expire,
    /// `consumed -> unlocked`: reverses a prior `Consume` when a committed
    /// entry is voided (`void`).
    Rollback,
    /// `unlocked -> reserved`, additionally marking the moved amount in
    /// `Account.frozen` (ReorgWatch divergence response).
    Freeze,
    /// Reverses a prior `Freeze`: unmarks `Account.frozen` and returns the
    /// amount to `unlocked`.
    Unfreeze,
}

impl LedgerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOp::Allocate => "allocate",
            LedgerOp::Unlock => "unlock",
            LedgerOp::Reserve => "reserve",
            LedgerOp::Consume => "consume",
            LedgerOp::Release => "release",
            LedgerOp::Expire => "expire",
            LedgerOp::Rollback => "rollback",
            LedgerOp::Freeze => "freeze",
            LedgerOp::Unfreeze => "unfreeze",
        }
    }
}

/// An append-only, immutable journal row capturing one debit→credit move on
/// one account. `idempotency_key` is unique across the whole journal; a
/// second transaction presenting the same key returns the original row
/// rather than creating a new one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub account_id: AccountId,
    pub op: LedgerOp,
    pub amount: Micros,
    pub correlation_id: CorrelationId,
    pub idempotency_key: IdempotencyKey,
    pub timestamp: TimestampMs,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ── EventRecord ───────────────────────────────────────────────────────────────

/// The current WAL envelope schema version. Bump this and keep the old
/// variant decodable whenever the payload shape changes.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// An immutable append-only log record. The `checksum` is a CRC32 (as 8
/// lowercase hex digits) over the JSON-serialized `payload`; it exists so a
/// replaying reader can detect and skip torn or bit-rotted records without
/// treating the whole stream as fatally corrupt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub schema_version: u32,
    pub event_type: String,
    pub stream: StreamName,
    pub sequence: Sequence,
    pub timestamp: TimestampMs,
    pub correlation_id: CorrelationId,
    pub payload: serde_json::Value,
    pub checksum: String,
}

impl EventRecord {
    /// Recompute the checksum over `payload` and compare against the stored
    /// value. Used by `EventLog::replay` to decide whether to skip a record.
    pub fn checksum_valid(&self) -> bool {
        self.checksum == crate::compute_checksum(&self.payload)
    }
}

/// Billing and credit event type names.
pub mod event_types {
    pub const BILLING_RESERVE: &str = "billing_reserve";
    pub const BILLING_COMMIT: &str = "billing_commit";
    pub const BILLING_RELEASE: &str = "billing_release";
    pub const BILLING_VOID: &str = "billing_void";
    pub const BILLING_FINALIZE_ACK: &str = "billing_finalize_ack";
    pub const BILLING_FINALIZE_FAIL: &str = "billing_finalize_fail";
    pub const CREDIT_MINT: &str = "credit_mint";
    pub const CREDIT_MINT_REVALIDATED: &str = "credit_mint_revalidated";
    pub const CREDIT_MINT_REVERTED: &str = "credit_mint_reverted";
    pub const REKTDROP_ALLOCATE: &str = "rektdrop_allocate";
    pub const USDC_UNLOCK: &str = "usdc_unlock";
}
