//! `MintStore`: the sled-backed registry of on-chain credit mints under
//! periodic re-verification. Same `bincode`/`GatewayError::Storage` shape as
//! `LedgerDb`'s single-tree CRUD pattern, scaled down to the one tree this
//! watcher needs.

use std::path::Path;

use gateway_core::error::GatewayError;
use gateway_core::types::TimestampMs;

use crate::types::{CreditMintRecord, MintStatus};

pub struct MintStore {
    _db: sled::Db,
    mints: sled::Tree,
}

impl MintStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn open_temporary() -> Result<Self, GatewayError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, GatewayError> {
        let mints = db.open_tree("credit_mints")?;
        Ok(Self { _db: db, mints })
    }

    pub fn record_mint(&self, record: &CreditMintRecord) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(record)?;
        self.mints.insert(record.tx_hash.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get(&self, tx_hash: &str) -> Result<Option<CreditMintRecord>, GatewayError> {
        match self.mints.get(tx_hash.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, record: &CreditMintRecord) -> Result<(), GatewayError> {
        self.record_mint(record)
    }

    /// Every mint still `Watching` and younger than `horizon_ms` as of `now`.
    pub fn active_within_horizon(
        &self,
        now: TimestampMs,
        horizon_ms: i64,
    ) -> Result<Vec<CreditMintRecord>, GatewayError> {
        let mut out = Vec::new();
        for item in self.mints.iter() {
            let (_, bytes) = item?;
            let record: CreditMintRecord = bincode::deserialize(&bytes)?;
            if record.status == MintStatus::Watching && now - record.minted_at < horizon_ms {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.mints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mints.is_empty()
    }
}
