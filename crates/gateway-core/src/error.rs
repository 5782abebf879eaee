use thiserror::Error;

/// Coarse error classification. Every `GatewayError` maps to
/// exactly one `ErrorKind`; callers branch on `kind()` rather than matching
/// variants directly so that new variants can be added within a kind without
/// breaking call sites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InputInvalid,
    AuthFailed,
    PreconditionViolated,
    Transient,
    CircuitOpen,
    Fatal,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    // ── InputInvalid ─────────────────────────────────────────────────────────
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unknown archetype: {0}")]
    UnknownArchetype(String),

    #[error("unsupported tier: {0}")]
    UnsupportedTier(String),

    #[error("invalid pack size: {0}")]
    InvalidPackSize(u64),

    // ── AuthFailed ───────────────────────────────────────────────────────────
    // Never surfaced to the caller with detail — `opaque_auth_message`
    // collapses all of these to one stable string. The variants exist for
    // internal logging only.
    #[error("signature invalid")]
    SignatureInvalid,

    #[error("nonce already used")]
    NonceReused,

    #[error("issuer or audience mismatch")]
    IssuerAudienceMismatch,

    #[error("jwt structurally invalid: {0}")]
    JwtStructurallyInvalid(String),

    #[error("jwt missing required claim: {0}")]
    JwtMissingClaim(&'static str),

    #[error("jti required but absent")]
    JtiRequired,

    #[error("jwt expired or not yet valid")]
    JwtExpired,

    // ── PreconditionViolated ─────────────────────────────────────────────────
    #[error("illegal billing transition: {from} -> {attempted}")]
    IllegalTransition { from: String, attempted: String },

    #[error("insufficient balance in {bucket}: need {need}, have {have}")]
    InsufficientBalance {
        bucket: &'static str,
        need: u128,
        have: u128,
    },

    #[error("reservation expired")]
    ReservationExpired,

    #[error("conservation invariant violated before write for account {0}")]
    ConservationViolatedPreWrite(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("billing entry not found: {0}")]
    EntryNotFound(String),

    // ── Transient ────────────────────────────────────────────────────────────
    #[error("provider rate limited (429)")]
    ProviderRateLimited,

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("block source disagreement: {0}")]
    BlockSourceDisagreement(String),

    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: String },

    #[error("adapter process failed to spawn: {0}")]
    AdapterSpawnFailed(String),

    #[error("adapter process exceeded max runtime of {max_runtime_ms}ms")]
    AdapterTimedOut { max_runtime_ms: u64 },

    // ── CircuitOpen ──────────────────────────────────────────────────────────
    #[error("budget circuit open: ledger writer degraded for {degraded_secs}s")]
    BudgetCircuitOpen { degraded_secs: i64 },

    // ── Fatal ────────────────────────────────────────────────────────────────
    #[error("conservation invariant violated after write for account {account}: sum={sum}, initial={initial}")]
    ConservationViolatedPostWrite {
        account: String,
        sum: u128,
        initial: u128,
    },

    #[error("sequence gap on stream {stream}: expected {expected}, got {got}")]
    SequenceGap {
        stream: String,
        expected: u64,
        got: u64,
    },

    #[error("write attempted without a valid fencing token")]
    InvalidFencingToken,

    #[error("adapter process group {0} still alive after escalated kill")]
    AdapterProcessGroupSurvivedKill(i32),

    // ── EventLog ─────────────────────────────────────────────────────────────
    #[error("event log is closed")]
    LogClosed,

    #[error("event log capacity exhausted for stream {0}")]
    CapacityExhausted(String),

    // ── Storage / serialization (mechanical, kind depends on context) ───────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        use GatewayError::*;
        match self {
            MalformedRequest(_) | UnknownArchetype(_) | UnsupportedTier(_) | InvalidPackSize(_) => {
                ErrorKind::InputInvalid
            }

            SignatureInvalid
            | NonceReused
            | IssuerAudienceMismatch
            | JwtStructurallyInvalid(_)
            | JwtMissingClaim(_)
            | JtiRequired
            | JwtExpired => ErrorKind::AuthFailed,

            IllegalTransition { .. }
            | InsufficientBalance { .. }
            | ReservationExpired
            | ConservationViolatedPreWrite(_)
            | AccountNotFound(_)
            | EntryNotFound(_) => ErrorKind::PreconditionViolated,

            ProviderRateLimited
            | ConnectionReset(_)
            | BlockSourceDisagreement(_)
            | RetriesExhausted { .. }
            | AdapterSpawnFailed(_)
            | AdapterTimedOut { .. } => ErrorKind::Transient,

            BudgetCircuitOpen { .. } => ErrorKind::CircuitOpen,

            ConservationViolatedPostWrite { .. } | SequenceGap { .. } | InvalidFencingToken
            | LogClosed | AdapterProcessGroupSurvivedKill(_) => ErrorKind::Fatal,

            CapacityExhausted(_) => ErrorKind::Transient,

            Storage(_) | Serialization(_) | Io(_) | Other(_) => ErrorKind::Fatal,
        }
    }

    /// The opaque message every `AuthFailed` error must surface to the
    /// caller. Never leak which specific check failed.
    pub fn opaque_auth_message() -> &'static str {
        "invalid or expired credentials"
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<sled::Error> for GatewayError {
    fn from(e: sled::Error) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for GatewayError {
    fn from(e: bincode::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}
