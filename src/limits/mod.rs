//! Per-client admission counters
//!
//! - [`QuotaTracker`]: daily byte quota with a configurable local reset time
//! - [`RateLimiter`]: fixed one-minute request window with a latched block
//!
//! Both keep a keyed map behind a `parking_lot::RwLock`, mutate it from
//! request handlers, and reclaim state through [`crate::sweep::Sweeper`].

pub mod quota;
pub mod ratelimit;

pub use quota::{Headroom, QuotaConfig, QuotaStatus, QuotaTracker};
pub use ratelimit::{
    RateDecision, RateLimitConfig, RateLimitConfigBuilder, RateLimiter, RateLimiterStats,
    RatePolicy,
};
