pub mod cache;
pub mod canonical;

pub use cache::IdempotencyCache;
