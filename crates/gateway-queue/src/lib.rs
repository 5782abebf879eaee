pub mod queue;

pub use queue::{
    BillingAcknowledger, DequeueGuard, FinalizeItem, FinalizeOutcome, FinalizeQueue,
};
