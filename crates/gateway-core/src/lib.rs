pub mod account;
pub mod billing;
pub mod claims;
pub mod constants;
pub mod error;
pub mod transaction;
pub mod types;

pub use account::*;
pub use billing::{BillingEntry, BillingState, FinalizeFailReason, ReleaseReason, VoidReason};
pub use claims::{ModelPreferences, Tier, TenantClaims};
pub use constants::*;
pub use error::{ErrorKind, GatewayError};
pub use transaction::*;
pub use types::*;

/// CRC32 over the JSON-serialized form of `payload`, as 8 lowercase hex
/// digits — the checksum algorithm fixed by the WAL envelope.
pub fn compute_checksum(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    format!("{:08x}", crc32fast::hash(&bytes))
}

