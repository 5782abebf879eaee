//! Periodic re-verification of recent on-chain credit mints against a
//! pluggable block source, freezing affected credits on divergence.

pub mod store;
pub mod types;
pub mod watch;

pub use store::MintStore;
pub use types::{AlertSink, BlockInfo, BlockSource, CreditMintRecord, MintStatus, NullAlertSink, ReceiptInfo};
pub use watch::{ReorgWatch, ReorgWatchConfig, TickSummary};
