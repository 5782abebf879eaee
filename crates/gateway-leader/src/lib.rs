pub mod lock;

pub use lock::{AcquireOutcome, LeaderLock, LossCallback};
