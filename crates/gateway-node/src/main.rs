//! gateway-node — the personality-conditioned inference gateway binary.
//!
//! Startup sequence:
//!   1. Open the sled-backed stores (event log, ledger, leader lock, nonce
//!      registry, finalize queue, reorg-watch mint store)
//!   2. Acquire the leader lock and spawn its lease-refresh loop
//!   3. Load the pricing table and pool routing table from disk (or fall
//!      back to development defaults)
//!   4. Wire the orchestrator, rate limiter, and idempotency cache
//!   5. Spawn background tasks: reorg watch, finalize consumer, JWKS
//!      refresh, rate-limiter/nonce sweep
//!   6. Serve the HTTP/SSE completion endpoint

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use gateway_cache::IdempotencyCache;
use gateway_core::account::AccountTier;
use gateway_core::billing::FinalizeFailReason;
use gateway_core::claims::{TenantClaims, Tier};
use gateway_core::constants::{JWT_CLOCK_SKEW_SECS, RATE_LIMIT_WINDOW_SECS};
use gateway_core::error::GatewayError;
use gateway_core::types::{AccountId, CorrelationId, EntryId, Micros, TimestampMs};
use gateway_crypto::{verify_es256_jwt, JwksCache};
use gateway_eventlog::EventLog;
use gateway_leader::LeaderLock;
use gateway_ledger::{BillingStateMachine, CreditLedger, LedgerDb, NonceRegistry};
use gateway_orchestrator::{ClientSink, CompletionRequest, OrchestratorEvent, Orchestrator, PoolRoutingTable, RateLimiter, StreamBridge, ToolDispatcher};
use gateway_queue::{BillingAcknowledger, FinalizeOutcome, FinalizeQueue};
use gateway_reorg::{AlertSink, BlockInfo, BlockSource, CreditMintRecord, MintStatus, MintStore, ReceiptInfo, ReorgWatch, ReorgWatchConfig};
use gateway_sse::cost::Rounding;
use gateway_sse::{PricingEntry, PricingTable};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(
    name = "gateway-node",
    version,
    about = "Personality-conditioned LLM inference gateway — credit ledger and streaming orchestration core"
)]
struct Args {
    /// Directory for the persistent sled stores.
    #[arg(long, default_value = "~/.gateway/data")]
    data_dir: PathBuf,

    /// HTTP/SSE listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind_addr: SocketAddr,

    /// On-disk pricing table (JSON, pool id -> PricingEntry). Falls back to
    /// built-in development defaults if omitted.
    #[arg(long)]
    pricing_table: Option<PathBuf>,

    /// On-disk pool routing table (JSON, tier -> ordered pool candidates).
    /// Falls back to built-in development defaults if omitted.
    #[arg(long)]
    pool_routing_table: Option<PathBuf>,

    /// Expected JWT issuer claim.
    #[arg(long, default_value = "gateway")]
    jwt_issuer: String,

    /// Expected JWT audience claim.
    #[arg(long, default_value = "gateway-api")]
    jwt_audience: String,

    /// JWKS endpoint serving the ES256 verifying keys for tenant claims.
    #[arg(long, default_value = "http://127.0.0.1:8081/.well-known/jwks.json")]
    jwks_url: String,

    /// Age horizon for on-chain mints subject to reorg re-verification (secs).
    #[arg(long, default_value_t = gateway_core::constants::REORG_WATCH_HORIZON_SECS)]
    reorg_horizon_secs: i64,

    /// Reorg watch polling cadence (secs).
    #[arg(long, default_value_t = gateway_core::constants::REORG_WATCH_CADENCE_SECS)]
    reorg_cadence_secs: i64,

    /// Rate limiter sliding window width (secs).
    #[arg(long, default_value_t = RATE_LIMIT_WINDOW_SECS)]
    rate_limit_window_secs: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gateway=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("gateway node starting");

    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    // ── Leader lock ────────────────────────────────────────────────────────────
    // Acquired before the event log so every WAL writer constructed below can
    // be fenced against it from the start (I4/P8) — there is no window where
    // a ledger or billing handle exists without a fencing token to present.
    let leader_db = sled::open(data_dir.join("leader")).context("opening leader lock db")?;
    let holder_id = std::env::var("HOSTNAME").unwrap_or_else(|_| format!("gateway-{}", std::process::id()));
    let leader_lock = Arc::new(LeaderLock::new(
        leader_db.open_tree("holder").context("opening leader tree")?,
        holder_id,
    ));
    let now = chrono::Utc::now().timestamp_millis();
    let outcome = leader_lock.acquire(now).context("acquiring leader lock")?;
    if outcome.acquired {
        info!(fencing_token = outcome.fencing_token, "acquired leader lock");
    } else {
        warn!(current_holder = %outcome.current_holder, "another writer already holds the leader lock");
    }
    leader_lock.clone().spawn_refresh(Arc::new(|| {
        warn!("lost leader lease — stepping down as writer");
    }));

    // ── Event log + credit ledger ─────────────────────────────────────────────
    let log = Arc::new(EventLog::open(data_dir.join("eventlog")).context("opening event log")?);
    let ledger_db = Arc::new(LedgerDb::open(data_dir.join("ledger")).context("opening ledger db")?);
    let ledger = Arc::new(CreditLedger::new(ledger_db.clone(), log.clone(), leader_lock.clone()));

    // ── Finalize queue + billing state machine ────────────────────────────────
    let queue_db = sled::open(data_dir.join("queue")).context("opening finalize queue db")?;
    let finalize_queue = Arc::new(FinalizeQueue::new(
        queue_db.open_tree("pending").context("opening pending tree")?,
        queue_db.open_tree("in_flight").context("opening in_flight tree")?,
        queue_db.open_tree("dead_letter").context("opening dead_letter tree")?,
    ));
    let billing = Arc::new(BillingStateMachine::new(
        ledger_db.clone(),
        log.clone(),
        ledger.clone(),
        finalize_queue.clone(),
        leader_lock.clone(),
    ));

    // ── Nonce registry (EIP-3009-style unlock authorization replay guard) ─────
    let nonce_registry = Arc::new(
        NonceRegistry::open(data_dir.join("nonces"), 24 * 3_600 * 1_000).context("opening nonce registry")?,
    );

    // ── Reorg watch ────────────────────────────────────────────────────────────
    let mint_store = Arc::new(MintStore::open(data_dir.join("mints")).context("opening mint store")?);
    let reorg_config = ReorgWatchConfig {
        horizon_secs: args.reorg_horizon_secs,
        cadence_secs: args.reorg_cadence_secs,
    };
    let reorg_watch = Arc::new(
        ReorgWatch::new(
            mint_store,
            ledger.clone(),
            log.clone(),
            Arc::new(UnconfiguredBlockSource),
            None,
            reorg_config,
            leader_lock.clone(),
        )
        .with_alert_sink(Arc::new(LoggingAlertSink)),
    );
    reorg_watch.clone().spawn_loop(|| chrono::Utc::now().timestamp_millis());

    // ── Pricing / routing config ──────────────────────────────────────────────
    let pricing = load_pricing_table(args.pricing_table.as_deref())?;
    let pools = load_pool_routing_table(args.pool_routing_table.as_deref())?;

    // ── Orchestrator, cache, rate limiter ──────────────────────────────────────
    let idempotency_cache = Arc::new(IdempotencyCache::default());
    let orchestrator = Arc::new(Orchestrator::new(
        billing.clone(),
        idempotency_cache,
        pools,
        pricing,
        Arc::new(UnconfiguredToolDispatcher),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(args.rate_limit_window_secs * 1_000));

    // ── JWKS refresh loop ──────────────────────────────────────────────────────
    let jwks = Arc::new(JwksCache::new(args.jwks_url.clone()));
    if let Err(e) = jwks.refresh().await {
        warn!(error = %e, "initial JWKS fetch failed — serving with a stale/empty key set until the next refresh");
    }
    spawn_jwks_refresh_loop(jwks.clone());

    // ── Finalize queue consumer ────────────────────────────────────────────────
    spawn_finalize_consumer(finalize_queue.clone(), billing.clone(), Arc::new(LoggingBillingAcknowledger));

    // ── Periodic sweeps ────────────────────────────────────────────────────────
    spawn_sweep_loop(rate_limiter.clone(), nonce_registry.clone());

    let state = AppState {
        orchestrator,
        rate_limiter,
        jwks,
        jwt_issuer: args.jwt_issuer,
        jwt_audience: args.jwt_audience,
        ledger,
        nonce_registry,
        reorg_watch,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/completions", post(handle_completion))
        .route("/v1/credits/mint", post(handle_credit_mint))
        .with_state(state);

    info!(addr = %args.bind_addr, "gateway node ready");
    let listener = tokio::net::TcpListener::bind(args.bind_addr)
        .await
        .with_context(|| format!("binding {}", args.bind_addr))?;
    axum::serve(listener, app).await.context("serving HTTP")?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    rate_limiter: Arc<RateLimiter>,
    jwks: Arc<JwksCache>,
    jwt_issuer: String,
    jwt_audience: String,
    ledger: Arc<CreditLedger>,
    nonce_registry: Arc<NonceRegistry>,
    reorg_watch: Arc<ReorgWatch>,
}

async fn healthz() -> &'static str {
    "ok"
}

// ── Fatal error termination ───────────────────────────────────────────────────
//
// Per spec §7: a Fatal-kind `GatewayError` (sequence gap, post-write
// conservation violation, a stale fencing token, storage corruption) means a
// core invariant already broke — this process can no longer be trusted to
// keep serving requests on top of it. There is no retry or degrade path for
// these; the only correct move is to flush what's been logged and exit so an
// orchestrator (systemd, k8s) restarts against a clean lease.

fn terminate_on_fatal(err: &GatewayError) -> ! {
    tracing::error!(error = %err, kind = ?err.kind(), "fatal error — terminating process");
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(1);
}

/// Checks `result` for a Fatal-kind error and terminates the process before
/// returning it — call this on every `Result<_, GatewayError>` that reaches
/// the HTTP layer, so a Fatal error is never quietly turned into a 500.
fn fatal_checked<T>(result: Result<T, GatewayError>) -> Result<T, GatewayError> {
    if let Err(ref e) = result {
        if e.is_fatal() {
            terminate_on_fatal(e);
        }
    }
    result
}

// ── Completion endpoint ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CompletionBody {
    user_message: String,
    #[serde(default = "default_system_template")]
    system_template: String,
    #[serde(default)]
    prompt_tokens_hint: u64,
}

fn default_system_template() -> String {
    "{{user_message}}".to_string()
}

/// Wraps an outbound SSE channel as a `ClientSink`. `send` fails once the
/// axum response body is dropped (client disconnected or walked away), which
/// is exactly the signal `StreamBridge` needs to flip the shared abort flag.
struct AxumSink {
    tx: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl ClientSink for AxumSink {
    async fn send(&self, event: &OrchestratorEvent) -> Result<(), ()> {
        let payload = serde_json::to_string(event).map_err(|_| ())?;
        self.tx.send(payload).await.map_err(|_| ())
    }
}

async fn handle_completion(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let claims = authenticate(&state, &headers, &body)?;

    let now = chrono::Utc::now().timestamp_millis();
    if !state.rate_limiter.check_and_insert(claims.tier, &claims.tenant_id, now) {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".to_string()));
    }

    let parsed: CompletionBody = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("malformed request body: {e}")))?;

    let trace_id = uuid::Uuid::new_v4().to_string();
    let request = CompletionRequest {
        claims,
        correlation_id: trace_id.clone(),
        trace_id,
        system_template: parsed.system_template,
        user_message: parsed.user_message,
        prompt_tokens_hint: parsed.prompt_tokens_hint,
    };

    let (events_tx, events_rx) = mpsc::channel::<OrchestratorEvent>(128);
    let (sse_tx, sse_rx) = mpsc::channel::<String>(128);
    let abort = Arc::new(AtomicBool::new(false));
    let bridge = Arc::new(StreamBridge::new(abort.clone()));
    let sink: Arc<dyn ClientSink> = Arc::new(AxumSink { tx: sse_tx });

    let bridge_for_task = bridge.clone();
    tokio::spawn(async move { bridge_for_task.run(events_rx, sink).await });

    let orchestrator = state.orchestrator.clone();
    let error_tx = events_tx.clone();
    tokio::spawn(async move {
        let now = chrono::Utc::now().timestamp_millis();
        if let Err(e) = orchestrator.run_request(request, events_tx, abort, now).await {
            if e.is_fatal() {
                terminate_on_fatal(&e);
            }
            let _ = error_tx.send(OrchestratorEvent::LoopError { message: e.to_string() }).await;
        }
    });

    let stream = ReceiverStream::new(sse_rx).map(|payload| Ok::<_, Infallible>(Event::default().data(payload)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Authenticates a request, constructing a specific `GatewayError::AuthFailed`
/// variant per failure reason and logging it via `kind()` before degrading to
/// the opaque client-facing message — the client never learns which check
/// failed, but the logs do.
fn authenticate(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<TenantClaims, (StatusCode, String)> {
    try_authenticate(state, headers, body).map_err(|e| {
        tracing::warn!(error = %e, kind = ?e.kind(), "authentication failed");
        (StatusCode::UNAUTHORIZED, GatewayError::opaque_auth_message().to_string())
    })
}

fn try_authenticate(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<TenantClaims, GatewayError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| GatewayError::JwtStructurallyInvalid("missing bearer token".to_string()))?;

    let header = jsonwebtoken::decode_header(token)
        .map_err(|e| GatewayError::JwtStructurallyInvalid(e.to_string()))?;
    let kid = header.kid.ok_or_else(|| GatewayError::JwtMissingClaim("kid"))?;
    let key = state.jwks.get(&kid).ok_or_else(|| GatewayError::JwtStructurallyInvalid(format!("unknown kid: {kid}")))?;

    let claims: TenantClaims = verify_es256_jwt(token, &key, &state.jwt_issuer, &state.jwt_audience, JWT_CLOCK_SKEW_SECS as u64)
        .map_err(|e| match e {
            gateway_crypto::JwtVerifyError::Structural(msg) => GatewayError::JwtStructurallyInvalid(msg),
            gateway_crypto::JwtVerifyError::Signature => GatewayError::SignatureInvalid,
            gateway_crypto::JwtVerifyError::Expired => GatewayError::JwtExpired,
            gateway_crypto::JwtVerifyError::IssuerAudienceMismatch => GatewayError::IssuerAudienceMismatch,
            gateway_crypto::JwtVerifyError::Verification(msg) => GatewayError::JwtStructurallyInvalid(msg),
        })?;

    let expected = format!("sha256:{}", gateway_crypto::sha256_hex(body));
    if claims.req_hash.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(GatewayError::SignatureInvalid);
    }

    // Enterprise claims must carry a `jti` so a captured token can't be
    // replayed against this endpoint a second time; lower tiers don't get
    // this guarantee but also don't get charged at Enterprise rates.
    if claims.tier == Tier::Enterprise {
        let jti = claims.jti.as_ref().ok_or(GatewayError::JtiRequired)?;
        let now = chrono::Utc::now().timestamp_millis();
        let fresh = state.nonce_registry.reserve(jti.as_bytes(), now)?;
        if !fresh {
            return Err(GatewayError::NonceReused);
        }
    }

    Ok(claims)
}

// ── On-chain credit mint intake ───────────────────────────────────────────────
//
// Called by an external chain-watching process when it observes a mint or
// unlock-authorization event; registers it for reorg re-verification and
// moves the amount from `allocated` to `unlocked`. On-chain signature
// verification and the actual RPC call to the chain are out of scope here —
// this endpoint trusts its caller the same way `BillingAcknowledger` and
// `BlockSource` are trusted external collaborators elsewhere in this binary.

#[derive(Debug, Deserialize)]
struct CreditMintBody {
    account_id: String,
    tx_hash: String,
    amount: Micros,
    block_height: u64,
    block_hash: String,
    from: String,
    to: String,
    nonce: String,
    valid_before: String,
    correlation_id: String,
}

#[derive(Debug, Serialize)]
struct CreditMintResponse {
    entry_id: Option<String>,
    status: &'static str,
}

async fn handle_credit_mint(
    State(state): State<AppState>,
    Json(body): Json<CreditMintBody>,
) -> Result<Json<CreditMintResponse>, (StatusCode, String)> {
    let now = chrono::Utc::now().timestamp_millis();
    let fingerprint = gateway_crypto::unlock_authorization_fingerprint(&body.from, &body.to, &body.nonce, &body.amount.to_string(), &body.valid_before);

    let fresh = fatal_checked(state.nonce_registry.reserve(fingerprint.as_bytes(), now))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !fresh {
        return Ok(Json(CreditMintResponse { entry_id: None, status: "already_processed" }));
    }

    let account_id = AccountId::new(&body.account_id);
    let account = if state.ledger.db().account_exists(&account_id) {
        fatal_checked(state.ledger.get_account(&account_id)).map_err(|e| (StatusCode::CONFLICT, e.to_string()))?
    } else {
        fatal_checked(state.ledger.allocate(
            account_id.clone(),
            body.amount,
            AccountTier::Community,
            i64::MAX,
            body.tx_hash.clone(),
            body.correlation_id.clone(),
            now,
        ))
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?
    };
    let _ = account;

    // NOTE: a mint against an account that already exists only registers the
    // reorg watch entry below — it does not top up `allocated` a second time.
    // Re-minting into an existing account is a follow-up once the external
    // on-chain collaborator settles on its top-up semantics.
    fatal_checked(state.ledger.unlock(&account_id, body.amount, format!("{}:unlock", body.tx_hash), body.correlation_id.clone(), now))
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;

    fatal_checked(
        state.reorg_watch.watch(
            CreditMintRecord {
                account_id,
                tx_hash: body.tx_hash,
                amount: body.amount,
                block_height: body.block_height,
                block_hash: body.block_hash,
                minted_at: now,
                correlation_id: body.correlation_id,
                status: MintStatus::Watching,
            },
            now,
        ),
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(CreditMintResponse { entry_id: None, status: "watching" }))
}

// ── External collaborator placeholders ────────────────────────────────────────
//
// These stand in for systems this crate only specifies an interface for:
// an upstream chain RPC client, a real billing acknowledger,
// and whatever dispatches tool calls. A real deployment replaces each with
// its own implementation of the corresponding trait at boot.

struct UnconfiguredBlockSource;

#[async_trait::async_trait]
impl BlockSource for UnconfiguredBlockSource {
    async fn get_block(&self, _height: u64) -> Result<BlockInfo, GatewayError> {
        Err(GatewayError::Other("no block source configured for this deployment".into()))
    }

    async fn get_receipt(&self, _tx_hash: &str) -> Result<ReceiptInfo, GatewayError> {
        Err(GatewayError::Other("no block source configured for this deployment".into()))
    }
}

struct LoggingAlertSink;

impl AlertSink for LoggingAlertSink {
    fn alert(&self, account_id: &AccountId, tx_hash: &str, reason: &str) {
        warn!(account_id = %account_id, tx_hash, reason, "reorg watch froze credits");
    }
}

struct UnconfiguredToolDispatcher;

#[async_trait::async_trait]
impl ToolDispatcher for UnconfiguredToolDispatcher {
    async fn dispatch(&self, name: &str, _args: &Value) -> Result<Value, GatewayError> {
        Err(GatewayError::Other(format!("no tool dispatcher configured for tool '{name}'")))
    }
}

struct LoggingBillingAcknowledger;

#[async_trait::async_trait]
impl BillingAcknowledger for LoggingBillingAcknowledger {
    async fn finalize(&self, entry_id: EntryId, account_id: &AccountId, amount: Micros, correlation_id: &CorrelationId) -> Result<(), GatewayError> {
        info!(entry_id = %entry_id, account_id = %account_id, amount, correlation_id = %correlation_id, "finalize acknowledged (no external acknowledger configured — DO NOT USE IN PRODUCTION)");
        Ok(())
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

fn spawn_jwks_refresh_loop(jwks: Arc<JwksCache>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            interval.tick().await;
            if let Err(e) = jwks.refresh().await {
                warn!(error = %e, staleness = ?jwks.staleness(), "JWKS refresh failed");
            }
        }
    });
}

fn spawn_finalize_consumer(queue: Arc<FinalizeQueue>, billing: Arc<BillingStateMachine>, acknowledger: Arc<dyn BillingAcknowledger>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp_millis();

            match queue.dequeue(now) {
                Ok(Some((guard, item))) => {
                    let result = acknowledger.finalize(item.entry_id, &item.account_id, item.amount, &item.correlation_id).await;
                    match result {
                        Ok(()) => {
                            if let Err(e) = billing.finalize_ack(&item.entry_id, "ok", item.correlation_id.clone(), now) {
                                warn!(error = %e, "finalize_ack failed after acknowledger succeeded");
                            }
                            let _ = queue.ack(guard);
                        }
                        Err(e) => {
                            warn!(error = %e, entry_id = %item.entry_id, "billing acknowledger failed, requeuing");
                            let _ = billing.finalize_fail(&item.entry_id, FinalizeFailReason::AcknowledgerUnreachable, item.correlation_id.clone(), now);
                            match queue.fail(guard, item.clone(), now) {
                                Ok(FinalizeOutcome::Rescheduled { .. }) => {
                                    let _ = billing.retry_finalize(&item.entry_id, now);
                                }
                                Ok(FinalizeOutcome::DeadLettered { attempts }) => {
                                    warn!(entry_id = %item.entry_id, attempts, "finalize dead-lettered");
                                }
                                Ok(FinalizeOutcome::Acked) | Err(_) => {}
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "finalize queue dequeue failed"),
            }

            if let Ok(reclaimed) = queue.reclaim_expired(now) {
                if reclaimed > 0 {
                    warn!(reclaimed, "reclaimed abandoned finalize leases");
                }
            }
        }
    });
}

fn spawn_sweep_loop(rate_limiter: Arc<RateLimiter>, nonce_registry: Arc<NonceRegistry>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            rate_limiter.sweep(now);
            if let Ok(swept) = nonce_registry.sweep_expired(now) {
                if swept > 0 {
                    info!(swept, "swept expired nonce entries");
                }
            }
        }
    });
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_pricing_table(path: Option<&Path>) -> anyhow::Result<PricingTable> {
    if let Some(p) = path {
        let json = std::fs::read_to_string(p).with_context(|| format!("reading pricing table {}", p.display()))?;
        return serde_json::from_str(&json).context("parsing pricing table JSON");
    }
    warn!("no --pricing-table provided — using built-in development defaults");
    let mut table = PricingTable::new();
    table.insert(
        "small-pool".to_string(),
        PricingEntry {
            in_rate_micros_per_token: 5,
            out_rate_micros_per_token: 15,
            bytes_per_token: 4,
            rounding: Rounding::NearestEven,
        },
    );
    table.insert(
        "large-pool".to_string(),
        PricingEntry {
            in_rate_micros_per_token: 20,
            out_rate_micros_per_token: 60,
            bytes_per_token: 4,
            rounding: Rounding::NearestEven,
        },
    );
    Ok(table)
}

fn load_pool_routing_table(path: Option<&Path>) -> anyhow::Result<PoolRoutingTable> {
    if let Some(p) = path {
        let json = std::fs::read_to_string(p).with_context(|| format!("reading pool routing table {}", p.display()))?;
        return serde_json::from_str(&json).context("parsing pool routing table JSON");
    }
    warn!("no --pool-routing-table provided — using built-in development defaults");
    let mut routes = HashMap::new();
    routes.insert(Tier::Free, vec!["small-pool".to_string()]);
    routes.insert(Tier::Pro, vec!["large-pool".to_string(), "small-pool".to_string()]);
    routes.insert(Tier::Enterprise, vec!["large-pool".to_string()]);
    Ok(PoolRoutingTable::new(routes))
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
