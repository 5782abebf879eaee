//! `ReorgWatch`: the periodic re-verification loop over recently-minted
//! on-chain credits.
//!
//! A handful of small pure-ish functions reading a snapshot and issuing a
//! narrow set of writes — a query/verifier-over-a-shared-store shape, with
//! block/receipt comparison driving the writes.

use std::sync::Arc;
use std::time::Duration;

use gateway_core::transaction::event_types;
use gateway_core::types::{AccountId, Micros, StreamName, TimestampMs};
use gateway_eventlog::EventLog;
use gateway_leader::LeaderLock;
use gateway_ledger::CreditLedger;

use crate::store::MintStore;
use crate::types::{AlertSink, BlockSource, CreditMintRecord, MintStatus, NullAlertSink};

fn ledger_stream(account_id: &AccountId) -> StreamName {
    StreamName::new(format!("ledger:{}", account_id.as_str()))
}

/// Horizon and cadence, loaded from ambient config rather than hard-coded.
/// Sensible defaults are preserved via `Default`.
#[derive(Clone, Copy, Debug)]
pub struct ReorgWatchConfig {
    pub horizon_secs: i64,
    pub cadence_secs: i64,
}

impl Default for ReorgWatchConfig {
    fn default() -> Self {
        Self {
            horizon_secs: gateway_core::constants::REORG_WATCH_HORIZON_SECS,
            cadence_secs: gateway_core::constants::REORG_WATCH_CADENCE_SECS,
        }
    }
}

/// One tick's outcome, for logging and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub reverted: usize,
    pub revalidated: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CheckOutcome {
    Unchanged,
    Reverted,
    Revalidated,
}

pub struct ReorgWatch {
    store: Arc<MintStore>,
    ledger: Arc<CreditLedger>,
    log: Arc<EventLog>,
    primary: Arc<dyn BlockSource>,
    fallback: Option<Arc<dyn BlockSource>>,
    alert_sink: Arc<dyn AlertSink>,
    config: ReorgWatchConfig,
    leader: Arc<LeaderLock>,
}

impl ReorgWatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MintStore>,
        ledger: Arc<CreditLedger>,
        log: Arc<EventLog>,
        primary: Arc<dyn BlockSource>,
        fallback: Option<Arc<dyn BlockSource>>,
        config: ReorgWatchConfig,
        leader: Arc<LeaderLock>,
    ) -> Self {
        Self {
            store,
            ledger,
            log,
            primary,
            fallback,
            alert_sink: Arc::new(NullAlertSink),
            config,
            leader,
        }
    }

    pub fn with_alert_sink(mut self, alert_sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = alert_sink;
        self
    }

    /// Registers a freshly-observed on-chain mint for periodic
    /// re-verification and appends its `credit_mint` event.
    pub fn watch(&self, record: CreditMintRecord, now: TimestampMs) -> Result<(), gateway_core::error::GatewayError> {
        let stream = ledger_stream(&record.account_id);
        let payload = serde_json::json!({
            "account_id": record.account_id.as_str(),
            "tx_hash": record.tx_hash,
            "amount": record.amount.to_string(),
            "block_height": record.block_height,
            "block_hash": record.block_hash,
        });
        self.log.append(
            &stream,
            event_types::CREDIT_MINT,
            payload,
            record.correlation_id.clone(),
            now,
            &self.leader,
            self.leader.current_fencing_token(),
        )?;
        self.store.record_mint(&record)
    }

    /// Runs one re-verification pass over every mint within the configured
    /// horizon. Safe to call concurrently with itself only in the sense that
    /// sled serializes the underlying writes; the node binary is expected to
    /// run at most one `tick` at a time via `spawn_loop`.
    pub async fn tick(&self, now: TimestampMs) -> TickSummary {
        let mut summary = TickSummary::default();
        let horizon_ms = self.config.horizon_secs.saturating_mul(1_000);
        let records = match self.store.active_within_horizon(now, horizon_ms) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load active mints for reorg watch tick");
                return summary;
            }
        };

        for record in records {
            summary.checked += 1;
            match self.check_one(record, now).await {
                Ok(CheckOutcome::Unchanged) => {}
                Ok(CheckOutcome::Reverted) => summary.reverted += 1,
                Ok(CheckOutcome::Revalidated) => summary.revalidated += 1,
                Err(e) => tracing::warn!(error = %e, "reorg watch check failed for one mint"),
            }
        }
        summary
    }

    async fn check_one(
        &self,
        mut record: CreditMintRecord,
        now: TimestampMs,
    ) -> Result<CheckOutcome, gateway_core::error::GatewayError> {
        let current_block = self.primary.get_block(record.block_height).await?;
        if current_block.hash == record.block_hash {
            return Ok(CheckOutcome::Unchanged); // nothing moved, still within horizon
        }

        let primary_receipt = self.primary.get_receipt(&record.tx_hash).await;
        let fallback_receipt = match &self.fallback {
            Some(fallback) => Some(fallback.get_receipt(&record.tx_hash).await),
            None => None,
        };

        let diverged = match (&primary_receipt, &fallback_receipt) {
            (Err(_), _) => true,
            (Ok(receipt), _) if !receipt.status => true,
            (Ok(primary), Some(Ok(fallback))) => primary.block_hash != fallback.block_hash,
            (Ok(_), Some(Err(_))) => true,
            (Ok(_), None) => false,
        };

        if diverged {
            self.revert(&mut record, now).await?;
            Ok(CheckOutcome::Reverted)
        } else if let Ok(receipt) = primary_receipt {
            self.revalidate(&mut record, receipt.block_number, receipt.block_hash, now)?;
            Ok(CheckOutcome::Revalidated)
        } else {
            Ok(CheckOutcome::Unchanged)
        }
    }

    async fn revert(
        &self,
        record: &mut CreditMintRecord,
        now: TimestampMs,
    ) -> Result<(), gateway_core::error::GatewayError> {
        let account = self.ledger.get_account(&record.account_id)?;
        let freeze_amount: Micros = record.amount.min(account.unlocked);
        if freeze_amount > 0 {
            let idempotency_key = format!("reorg-freeze:{}", record.tx_hash);
            self.ledger.freeze(
                &record.account_id,
                freeze_amount,
                idempotency_key,
                record.correlation_id.clone(),
                now,
            )?;
        }

        let stream = ledger_stream(&record.account_id);
        let payload = serde_json::json!({
            "account_id": record.account_id.as_str(),
            "tx_hash": record.tx_hash,
            "frozen_amount": freeze_amount.to_string(),
        });
        self.log.append(
            &stream,
            event_types::CREDIT_MINT_REVERTED,
            payload,
            record.correlation_id.clone(),
            now,
            &self.leader,
            self.leader.current_fencing_token(),
        )?;

        record.status = MintStatus::Reverted;
        self.store.put(record)?;
        self.alert_sink.alert(&record.account_id, &record.tx_hash, "credit mint reverted");
        Ok(())
    }

    fn revalidate(
        &self,
        record: &mut CreditMintRecord,
        block_number: u64,
        block_hash: String,
        now: TimestampMs,
    ) -> Result<(), gateway_core::error::GatewayError> {
        record.block_height = block_number;
        record.block_hash = block_hash;

        let stream = ledger_stream(&record.account_id);
        let payload = serde_json::json!({
            "account_id": record.account_id.as_str(),
            "tx_hash": record.tx_hash,
            "block_height": record.block_height,
            "block_hash": record.block_hash,
        });
        self.log.append(
            &stream,
            event_types::CREDIT_MINT_REVALIDATED,
            payload,
            record.correlation_id.clone(),
            now,
            &self.leader,
            self.leader.current_fencing_token(),
        )?;

        self.store.put(record)
    }

    /// Spawns a background task ticking every `config.cadence_secs`,
    /// calling `now_fn` at each tick rather than reading the clock directly
    /// (the ambient `TimeSource` collaborator).
    pub fn spawn_loop(
        self: Arc<Self>,
        now_fn: impl Fn() -> TimestampMs + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let cadence = Duration::from_secs(self.config.cadence_secs.max(1) as u64);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            loop {
                interval.tick().await;
                let now = now_fn();
                let summary = self.tick(now).await;
                if summary.reverted > 0 {
                    tracing::warn!(?summary, "reorg watch tick found divergence");
                } else {
                    tracing::debug!(?summary, "reorg watch tick complete");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use gateway_core::account::AccountTier;
    use gateway_ledger::LedgerDb;

    use crate::types::{BlockInfo, ReceiptInfo};

    struct FixedBlockSource {
        block: Mutex<BlockInfo>,
        receipt: Mutex<ReceiptInfo>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlockSource for FixedBlockSource {
        async fn get_block(&self, _height: u64) -> Result<BlockInfo, gateway_core::error::GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.block.lock().unwrap().clone())
        }

        async fn get_receipt(&self, _tx_hash: &str) -> Result<ReceiptInfo, gateway_core::error::GatewayError> {
            Ok(self.receipt.lock().unwrap().clone())
        }
    }

    fn leader_lock() -> Arc<LeaderLock> {
        let tree = sled::Config::new().temporary(true).open().unwrap().open_tree("leader").unwrap();
        let lock = LeaderLock::new(tree, "test-node");
        lock.acquire(0).unwrap();
        Arc::new(lock)
    }

    fn harness() -> (Arc<ReorgWatch>, Arc<FixedBlockSource>, AccountId) {
        let ledger_db = Arc::new(LedgerDb::open_temporary().unwrap());
        let log = Arc::new(EventLog::open_temporary().unwrap());
        let leader = leader_lock();
        let ledger = Arc::new(CreditLedger::new(ledger_db, log.clone(), leader.clone()));
        let account_id = AccountId::new("0xabc");
        ledger
            .allocate(account_id.clone(), 10_000, AccountTier::Community, i64::MAX, "alloc-1".into(), "c0".into(), 0)
            .unwrap();
        ledger.unlock(&account_id, 5_000, "u1".into(), "c1".into(), 1).unwrap();

        let store = Arc::new(MintStore::open_temporary().unwrap());
        let source = Arc::new(FixedBlockSource {
            block: Mutex::new(BlockInfo { height: 100, hash: "0xblockA".into() }),
            receipt: Mutex::new(ReceiptInfo { status: true, block_hash: "0xblockA".into(), block_number: 100, logs: vec![] }),
            calls: AtomicUsize::new(0),
        });
        let watch = Arc::new(ReorgWatch::new(
            store,
            ledger,
            log,
            source.clone() as Arc<dyn BlockSource>,
            None,
            ReorgWatchConfig { horizon_secs: 3_600, cadence_secs: 300 },
            leader,
        ));
        (watch, source, account_id)
    }

    #[tokio::test]
    async fn unchanged_block_hash_leaves_mint_watching_and_credits_unfrozen() {
        let (watch, _source, account_id) = harness();
        watch
            .watch(
                CreditMintRecord {
                    account_id: account_id.clone(),
                    tx_hash: "0xtx1".into(),
                    amount: 2_000,
                    block_height: 100,
                    block_hash: "0xblockA".into(),
                    minted_at: 0,
                    correlation_id: "c1".into(),
                    status: MintStatus::Watching,
                },
                0,
            )
            .unwrap();

        let summary = watch.tick(10).await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.reverted, 0);
        assert_eq!(summary.revalidated, 0);

        let account = watch.ledger.get_account(&account_id).unwrap();
        assert_eq!(account.frozen, 0);
    }

    #[tokio::test]
    async fn changed_block_with_failed_receipt_freezes_credits_and_marks_reverted() {
        let (watch, source, account_id) = harness();
        watch
            .watch(
                CreditMintRecord {
                    account_id: account_id.clone(),
                    tx_hash: "0xtx1".into(),
                    amount: 2_000,
                    block_height: 100,
                    block_hash: "0xblockA".into(),
                    minted_at: 0,
                    correlation_id: "c1".into(),
                    status: MintStatus::Watching,
                },
                0,
            )
            .unwrap();

        *source.block.lock().unwrap() = BlockInfo { height: 100, hash: "0xblockB-reorged".into() };
        *source.receipt.lock().unwrap() = ReceiptInfo { status: false, block_hash: "0xblockB-reorged".into(), block_number: 100, logs: vec![] };

        let summary = watch.tick(10).await;
        assert_eq!(summary.reverted, 1);

        let account = watch.ledger.get_account(&account_id).unwrap();
        assert_eq!(account.frozen, 2_000);
        assert_eq!(account.reserved, 2_000);
        assert_eq!(account.unlocked, 3_000);
        assert!(account.conserves());

        let stored = watch.store.get("0xtx1").unwrap().unwrap();
        assert_eq!(stored.status, MintStatus::Reverted);
    }

    #[tokio::test]
    async fn changed_block_with_valid_receipt_revalidates_without_freezing() {
        let (watch, source, account_id) = harness();
        watch
            .watch(
                CreditMintRecord {
                    account_id: account_id.clone(),
                    tx_hash: "0xtx1".into(),
                    amount: 2_000,
                    block_height: 100,
                    block_hash: "0xblockA".into(),
                    minted_at: 0,
                    correlation_id: "c1".into(),
                    status: MintStatus::Watching,
                },
                0,
            )
            .unwrap();

        *source.block.lock().unwrap() = BlockInfo { height: 101, hash: "0xblockA-moved".into() };
        *source.receipt.lock().unwrap() = ReceiptInfo { status: true, block_hash: "0xblockA-moved".into(), block_number: 101, logs: vec![] };

        let summary = watch.tick(10).await;
        assert_eq!(summary.revalidated, 1);

        let account = watch.ledger.get_account(&account_id).unwrap();
        assert_eq!(account.frozen, 0);

        let stored = watch.store.get("0xtx1").unwrap().unwrap();
        assert_eq!(stored.block_height, 101);
        assert_eq!(stored.block_hash, "0xblockA-moved");
    }

    #[tokio::test]
    async fn mint_outside_horizon_is_not_checked() {
        let (watch, source, account_id) = harness();
        watch
            .watch(
                CreditMintRecord {
                    account_id,
                    tx_hash: "0xtx1".into(),
                    amount: 2_000,
                    block_height: 100,
                    block_hash: "0xblockA".into(),
                    minted_at: 0,
                    correlation_id: "c1".into(),
                    status: MintStatus::Watching,
                },
                0,
            )
            .unwrap();

        // Horizon in ms is 3_600 * 1_000; push `now` well past it.
        let summary = watch.tick(10_000_000).await;
        assert_eq!(summary.checked, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
