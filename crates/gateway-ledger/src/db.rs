//! `LedgerDb`: the sled-backed store bundling the accounts, billing-entry,
//! and ledger-transaction trees. Same CRUD-helper-per-tree pattern, same
//! `bincode::serialize`/`deserialize` plus `GatewayError::Storage`/
//! `Serialization` mapping.

use std::path::Path;

use gateway_core::account::Account;
use gateway_core::billing::BillingEntry;
use gateway_core::error::GatewayError;
use gateway_core::transaction::LedgerTransaction;
use gateway_core::types::{AccountId, EntryId, IdempotencyKey};

pub struct LedgerDb {
    _db: sled::Db,
    accounts: sled::Tree,
    billing_entries: sled::Tree,
    ledger_transactions: sled::Tree,
}

impl LedgerDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn open_temporary() -> Result<Self, GatewayError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, GatewayError> {
        let accounts = db.open_tree("accounts")?;
        let billing_entries = db.open_tree("billing_entries")?;
        let ledger_transactions = db.open_tree("ledger_transactions")?;
        Ok(Self {
            _db: db,
            accounts,
            billing_entries,
            ledger_transactions,
        })
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    pub fn get_account(&self, id: &AccountId) -> Result<Option<Account>, GatewayError> {
        match self.accounts.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_account(&self, account: &Account) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(account)?;
        self.accounts.insert(account.account_id.as_str().as_bytes(), bytes)?;
        Ok(())
    }

    pub fn account_exists(&self, id: &AccountId) -> bool {
        self.accounts.contains_key(id.as_str().as_bytes()).unwrap_or(false)
    }

    pub fn iter_accounts(&self) -> Result<Vec<Account>, GatewayError> {
        let mut out = Vec::new();
        for item in self.accounts.iter() {
            let (_, bytes) = item?;
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }

    // ── Billing entries ──────────────────────────────────────────────────────

    pub fn get_billing_entry(&self, id: &EntryId) -> Result<Option<BillingEntry>, GatewayError> {
        match self.billing_entries.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_billing_entry(&self, entry: &BillingEntry) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(entry)?;
        self.billing_entries.insert(entry.entry_id.as_bytes(), bytes)?;
        Ok(())
    }

    // ── Ledger transaction journal (keyed by idempotency_key) ───────────────

    pub fn get_transaction_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerTransaction>, GatewayError> {
        match self.ledger_transactions.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_transaction(&self, tx: &LedgerTransaction) -> Result<(), GatewayError> {
        let bytes = bincode::serialize(tx)?;
        self.ledger_transactions.insert(tx.idempotency_key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Persist the new account snapshot and its journal row atomically: the
    /// ledger "never partially mutates".
    pub fn commit_ledger_op(
        &self,
        account: &Account,
        tx: &LedgerTransaction,
    ) -> Result<(), GatewayError> {
        use sled::transaction::{ConflictableTransactionError, Transactional};

        let account_bytes = bincode::serialize(account)?;
        let tx_bytes = bincode::serialize(tx)?;
        let account_key = account.account_id.as_str().as_bytes().to_vec();
        let tx_key = tx.idempotency_key.as_bytes().to_vec();

        (&self.accounts, &self.ledger_transactions)
            .transaction(move |(accounts, ledger_transactions)| {
                accounts.insert(account_key.as_slice(), account_bytes.clone())?;
                ledger_transactions.insert(tx_key.as_slice(), tx_bytes.clone())?;
                Ok::<(), ConflictableTransactionError<GatewayError>>(())
            })
            .map_err(|e| match e {
                sled::transaction::TransactionError::Abort(inner) => inner,
                sled::transaction::TransactionError::Storage(e) => GatewayError::Storage(e.to_string()),
            })?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), GatewayError> {
        self._db.flush()?;
        Ok(())
    }
}
