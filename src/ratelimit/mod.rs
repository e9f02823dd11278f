//! Rate limiting: shared counters, metering, pacing and the adjustable ceiling.

mod controller;
mod key;
mod limiter;
mod memory;
mod pacing;
mod redis_store;
mod store;
mod window;

pub use controller::{RateController, RateSnapshot};
pub use key::{ClientKey, ClientKeySource, ForwardedFor, KeyExtractor, RemoteAddr};
pub use limiter::{RateLimiter, DEFAULT_NAMESPACE};
pub use memory::MemoryStore;
pub use pacing::{wait_duration, Admission, PacingPolicy, DEFAULT_MIN_PAUSE};
pub use redis_store::RedisStore;
pub use store::{CounterStore, StoreError, StoreResult};
pub use window::{SlidingWindow, DEFAULT_GRANULARITY, DEFAULT_PERIOD};
