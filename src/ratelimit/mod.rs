//! Rate limiting logic and state management.

mod clock;
mod decision;
mod limiter;
mod sliding_window;
mod store;
mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, RateLimitInfo};
pub use limiter::RateLimiter;
pub use sliding_window::SlidingWindowCounter;
pub use store::{KeyState, Limiter, LimiterStore, MemoryStore, ShardedStore};
pub use token_bucket::TokenBucket;
