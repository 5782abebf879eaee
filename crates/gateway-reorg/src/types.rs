//! External collaborator and persisted-record shapes for reorg watching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gateway_core::error::GatewayError;
use gateway_core::types::{AccountId, CorrelationId, Micros, TimestampMs};

/// One source of on-chain block/receipt data. ReorgWatch is instantiated
/// with a primary and (optionally) a fallback; divergence between the two
/// is itself grounds for freezing credits.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn get_block(&self, height: u64) -> Result<BlockInfo, GatewayError>;
    async fn get_receipt(&self, tx_hash: &str) -> Result<ReceiptInfo, GatewayError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    pub hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptInfo {
    pub status: bool,
    pub block_hash: String,
    pub block_number: u64,
    #[serde(default)]
    pub logs: Vec<serde_json::Value>,
}

/// Notified whenever ReorgWatch detects a divergence and freezes credits.
/// The node binary wires this to whatever paging/alerting channel it uses;
/// a no-op implementation is fine for tests.
pub trait AlertSink: Send + Sync {
    fn alert(&self, account_id: &AccountId, tx_hash: &str, reason: &str);
}

pub struct NullAlertSink;

impl AlertSink for NullAlertSink {
    fn alert(&self, _account_id: &AccountId, _tx_hash: &str, _reason: &str) {}
}

/// Whether a watched mint is still open for re-verification or has reached
/// a terminal outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintStatus {
    Watching,
    Reverted,
    /// Confirmed final: either the watch horizon elapsed without
    /// divergence, or a `credit_revalidated` event fired and nothing more
    /// needs checking once the stored block id is current.
    Settled,
}

/// One persisted on-chain credit mint under periodic re-verification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditMintRecord {
    pub account_id: AccountId,
    pub tx_hash: String,
    pub amount: Micros,
    pub block_height: u64,
    pub block_hash: String,
    pub minted_at: TimestampMs,
    pub correlation_id: CorrelationId,
    pub status: MintStatus,
}
