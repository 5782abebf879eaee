//! Request/event shapes and the external collaborator traits the
//! orchestrator drives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gateway_core::claims::{TenantClaims, Tier};
use gateway_core::error::GatewayError;
use gateway_core::types::{CorrelationId, Micros, TraceId};

/// A model/provider pool, named by the pricing table key it ultimately
/// resolves to (`PricingTable` in `gateway-sse::cost`).
pub type PoolId = String;

/// Tier -> ordered candidate pools, most-preferred first. `resolve` walks
/// the list so a tier can name a fallback chain rather than one pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolRoutingTable(HashMap<Tier, Vec<PoolId>>);

impl PoolRoutingTable {
    pub fn new(routes: HashMap<Tier, Vec<PoolId>>) -> Self {
        Self(routes)
    }

    /// The first candidate pool configured for `tier`, or
    /// `UnsupportedTier` if the tier has no routing entry at all, or
    /// `UnknownArchetype` if the entry exists but is empty.
    pub fn resolve(&self, tier: Tier) -> Result<&PoolId, GatewayError> {
        let candidates = self
            .0
            .get(&tier)
            .ok_or_else(|| GatewayError::UnsupportedTier(tier.as_str().to_string()))?;
        candidates
            .first()
            .ok_or_else(|| GatewayError::UnknownArchetype(format!("no pool configured for tier {}", tier.as_str())))
    }

    /// The full fallback chain for `tier`, in preference order.
    pub fn candidates(&self, tier: Tier) -> Result<&[PoolId], GatewayError> {
        self.0
            .get(&tier)
            .map(Vec::as_slice)
            .ok_or_else(|| GatewayError::UnsupportedTier(tier.as_str().to_string()))
    }
}

/// One caller-initiated completion request. `system_template` is an opaque,
/// caller-supplied string the orchestrator substitutes into the adapter's
/// system prompt slot unchanged — rendering it into a persona is an
/// external collaborator's concern, not this crate's.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub claims: TenantClaims,
    pub trace_id: TraceId,
    pub correlation_id: CorrelationId,
    pub system_template: String,
    pub user_message: String,
    #[serde(default)]
    pub prompt_tokens_hint: u64,
}

/// Every event the orchestrator emits while driving one request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    StreamStart { pool: PoolId },
    Token { delta: String },
    ToolRequested { name: String, args: Value },
    ToolExecuting { name: String },
    ToolExecuted { name: String, result: Value },
    ResultFed { name: String },
    BudgetCheck { remaining_degraded_secs: i64, circuit_open: bool },
    IterationStart { iteration: u32 },
    IterationComplete { iteration: u32 },
    LoopComplete { entry_id: String, actual_cost: Micros },
    LoopError { message: String },
}

/// The external collaborator invoked on a `ToolCall` stream event once the
/// idempotency cache misses. Dispatch, persona rendering, and marketplace
/// semantics all live on the other side of this trait.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, name: &str, args: &Value) -> Result<Value, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PoolRoutingTable {
        let mut routes = HashMap::new();
        routes.insert(Tier::Free, vec!["small-pool".to_string()]);
        routes.insert(Tier::Pro, vec!["large-pool".to_string(), "small-pool".to_string()]);
        routes.insert(Tier::Enterprise, vec![]);
        PoolRoutingTable::new(routes)
    }

    #[test]
    fn resolve_returns_first_candidate() {
        let table = table();
        assert_eq!(table.resolve(Tier::Pro).unwrap(), "large-pool");
    }

    #[test]
    fn resolve_rejects_unmapped_tier() {
        let routes = HashMap::new();
        let table = PoolRoutingTable::new(routes);
        let err = table.resolve(Tier::Free).unwrap_err();
        assert_eq!(err.kind(), gateway_core::error::ErrorKind::InputInvalid);
    }

    #[test]
    fn resolve_rejects_empty_candidate_list() {
        let table = table();
        let err = table.resolve(Tier::Enterprise).unwrap_err();
        assert_eq!(err.kind(), gateway_core::error::ErrorKind::InputInvalid);
    }

    #[test]
    fn candidates_exposes_the_full_fallback_chain() {
        let table = table();
        assert_eq!(table.candidates(Tier::Pro).unwrap(), &["large-pool".to_string(), "small-pool".to_string()]);
    }
}
