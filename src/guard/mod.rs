pub mod pacing;
pub mod rate_limiter;

pub use rate_limiter::{
    BlockReason, GuardDecision, RateLimitSnapshot, RateLimiter, TierUsage,
};
