//! Drives one completion request end to end: pool selection, streaming,
//! tool dispatch, cost tracking, commit/abort cleanup, and the transport-
//! facing bridge and rate limiter that surround it.

pub mod bridge;
pub mod orchestrator;
pub mod ratelimit;
pub mod types;

pub use bridge::{ClientSink, StreamBridge};
pub use orchestrator::{AlwaysHealthy, DegradedClock, Orchestrator};
pub use ratelimit::RateLimiter;
pub use types::{CompletionRequest, OrchestratorEvent, PoolId, PoolRoutingTable, ToolDispatcher};
