pub mod subprocess;

pub use subprocess::{AdapterConfig, AdapterMode, BatchResult, ModelAdapter, StreamHandle};
