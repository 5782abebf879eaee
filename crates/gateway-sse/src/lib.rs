pub mod consumer;
pub mod cost;

pub use consumer::{decode_event, SseDecoder, SseRecord, StreamEvent};
pub use cost::{BillingMethod, CostResult, PricingEntry, PricingTable, StreamCostTracker};
