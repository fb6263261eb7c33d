// Single-flight call deduplication with a TTL result cache and rate-limited dispatch

pub mod config;
pub mod deduplication;
pub mod error;
pub mod executor;
pub mod key;
pub mod store;
pub mod sweeper;


// Re-export for convenience
pub use config::{CallOptions, DedupeConfig};
pub use deduplication::{DedupeStats, Deduplicator};
pub use error::{ConfigError, DedupeError, ExecutorError};
pub use executor::{IntervalThrottle, RateLimitedExecutor, SharedRateLimitedExecutor, Throttle, Unthrottled};
pub use key::CallKey;
pub use store::{Attach, CallRecordStore, StoreStats};
pub use sweeper::ExpirySweeper;
