pub mod billing;
pub mod db;
pub mod ledger;
pub mod nonce;

pub use billing::BillingStateMachine;
pub use db::LedgerDb;
pub use ledger::CreditLedger;
pub use nonce::NonceRegistry;
