//! ─── Gateway Constants ──────────────────────────────────────────────────────
//!
//! Pricing and limits defaults. Nothing here is load-bearing for correctness
//! of the state machine — these are operational defaults, overridable by the
//! on-disk pricing/routing config the node binary loads at boot.

// ── Micro-currency ────────────────────────────────────────────────────────────

/// 1 unit of the underlying currency expressed in micro-currency.
pub const MICROS_PER_UNIT: u128 = 1_000_000;

// ── Idempotency cache ─────────────────────────────────────────────────────────

/// Default bounded capacity of the per-process idempotency cache.
pub const IDEMPOTENCY_CACHE_CAPACITY: usize = 10_000;

/// Default TTL for a cached idempotent tool result (seconds).
pub const IDEMPOTENCY_CACHE_TTL_SECS: i64 = 300;

// ── Rate limiter ──────────────────────────────────────────────────────────────

/// Sliding window width for request rate limiting (seconds).
pub const RATE_LIMIT_WINDOW_SECS: i64 = 60;

/// Default max requests per window for the `free` tier.
pub const RATE_LIMIT_FREE_MAX: u32 = 30;

/// Default max requests per window for the `pro` tier.
pub const RATE_LIMIT_PRO_MAX: u32 = 300;

/// Default max requests per window for the `enterprise` tier.
pub const RATE_LIMIT_ENTERPRISE_MAX: u32 = 3_000;

// ── Reorg watch ───────────────────────────────────────────────────────────────

/// Default age horizon for on-chain mints subject to reorg re-verification (seconds).
pub const REORG_WATCH_HORIZON_SECS: i64 = 3_600;

/// Default polling cadence of the reorg watcher (seconds).
pub const REORG_WATCH_CADENCE_SECS: i64 = 300;

// ── Finalize queue ────────────────────────────────────────────────────────────

/// Base delay for the exponential backoff of a failed finalize attempt (ms).
pub const FINALIZE_BACKOFF_BASE_MS: u64 = 500;

/// Cap on the computed backoff delay (ms).
pub const FINALIZE_BACKOFF_MAX_MS: u64 = 5 * 60 * 1_000;

/// Jitter fraction applied symmetrically to the computed backoff (0.2 = ±20%).
pub const FINALIZE_BACKOFF_JITTER: f64 = 0.2;

/// Attempts after which an item is moved to the dead-letter stream.
pub const FINALIZE_MAX_ATTEMPTS: u32 = 8;

// ── Leader lock ───────────────────────────────────────────────────────────────

/// Default lease duration for leadership (seconds).
pub const LEADER_LEASE_SECS: i64 = 15;

/// Refresh the lease every `LEADER_LEASE_SECS / LEADER_REFRESH_DIVISOR`.
pub const LEADER_REFRESH_DIVISOR: i64 = 3;

// ── JWT / auth ────────────────────────────────────────────────────────────────

/// Allowed clock skew when validating `iat`/`exp` claims (seconds).
pub const JWT_CLOCK_SKEW_SECS: i64 = 30;

/// JWKS cache tier boundaries (seconds since last successful fetch).
pub const JWKS_HEALTHY_MAX_AGE_SECS: i64 = 15 * 60;
pub const JWKS_STALE_MAX_AGE_SECS: i64 = 24 * 3_600;

// ── Stream cost tracker ───────────────────────────────────────────────────────

/// Overcount billing margin applied to byte-estimated completion tokens,
/// expressed as a whole-number percent, ceiling-rounded.
pub const OVERCOUNT_MARGIN_PERCENT: u64 = 10;

/// Fallback bytes-per-token ratio used when a model's pricing entry does not
/// specify one explicitly.
pub const DEFAULT_BYTES_PER_TOKEN: u64 = 4;

// ── Model adapter ─────────────────────────────────────────────────────────────

/// Default grace period between SIGTERM and SIGKILL when tearing down an
/// adapter's process group (ms).
pub const ADAPTER_KILL_GRACE_MS: u64 = 2_000;

/// Default wall-clock ceiling for one adapter invocation (ms).
pub const ADAPTER_MAX_RUNTIME_MS: u64 = 120_000;

/// Orchestrator wall-clock budget is this multiple of the adapter ceiling.
pub const ORCHESTRATOR_BUDGET_MULTIPLIER: u64 = 2;

// ── Budget circuit breaker ────────────────────────────────────────────────────

/// How long the finalize path may stay degraded before the circuit opens (secs).
pub const BUDGET_CIRCUIT_OPEN_AFTER_SECS: i64 = 120;
