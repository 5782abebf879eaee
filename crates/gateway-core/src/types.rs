use serde::{Deserialize, Serialize};
use std::fmt;

/// Monetary amount in micro-currency units (10⁻⁶ of the underlying currency).
/// All ledger and pricing arithmetic is integer arithmetic over this type.
pub type Micros = u128;

/// Unix timestamp, milliseconds, UTC.
pub type TimestampMs = i64;

/// Monotonic per-stream sequence number assigned by the event log.
pub type Sequence = u64;

/// Fencing token issued by the leader lock on each successful acquisition.
pub type FencingToken = u64;

// ── AccountId ────────────────────────────────────────────────────────────────

/// Lowercased wallet identifier. The gateway treats this as an opaque,
/// case-normalized string rather than a raw key — unlike an on-chain
/// address, it never needs to be recovered from a signature.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── EntryId ──────────────────────────────────────────────────────────────────

/// Sortable time-ordered identifier for a `BillingEntry`: 48 bits of
/// millisecond timestamp followed by 16 bits of random tiebreak, hex
/// encoded. Ordering by string equals ordering by creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId([u8; 8]);

impl EntryId {
    pub fn new(millis: TimestampMs, tiebreak: u16) -> Self {
        let mut buf = [0u8; 8];
        let ms = (millis.max(0) as u64) & 0x0000_FFFF_FFFF_FFFF;
        buf[0..6].copy_from_slice(&ms.to_be_bytes()[2..8]);
        buf[6..8].copy_from_slice(&tiebreak.to_be_bytes());
        Self(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes[..8.min(bytes.len())]);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.to_hex())
    }
}

// ── TraceId / CorrelationId ──────────────────────────────────────────────────

/// Client-supplied correlation identifier threaded through every record of
/// one logical operation (a request, a reservation, a finalize attempt).
pub type CorrelationId = String;

/// Opaque trace identifier scoping one request's idempotency cache entries.
pub type TraceId = String;

/// Caller-supplied key ensuring a ledger operation has at-most-once effect.
pub type IdempotencyKey = String;

// ── StreamName ───────────────────────────────────────────────────────────────

/// A logical partition of the event log, each with its own sequence space.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamName({})", self.0)
    }
}

impl From<&str> for StreamName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── Cursor ───────────────────────────────────────────────────────────────────

/// A replay position: the last sequence number a consumer has observed for
/// one stream. `replay` yields only records with `sequence > last_sequence`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub stream: StreamName,
    pub last_sequence: Sequence,
}

impl Cursor {
    pub fn start_of(stream: StreamName) -> Self {
        Self {
            stream,
            last_sequence: 0,
        }
    }
}
