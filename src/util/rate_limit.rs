//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max command submissions per second from one peer
pub const COMMAND_RATE_LIMIT: u32 = 30;

/// Per-peer rate limiter state
#[derive(Clone)]
pub struct PeerRateLimiter {
    command_limiter: Arc<Limiter>,
}

impl PeerRateLimiter {
    pub fn new() -> Self {
        Self {
            command_limiter: create_limiter(COMMAND_RATE_LIMIT),
        }
    }

    /// Check if a command submission is allowed (returns true if allowed)
    pub fn check_command(&self) -> bool {
        self.command_limiter.check().is_ok()
    }
}

impl Default for PeerRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_beyond_quota_is_rejected() {
        let limiter = PeerRateLimiter::new();
        let allowed = (0..COMMAND_RATE_LIMIT * 2)
            .filter(|_| limiter.check_command())
            .count();
        assert!(allowed >= COMMAND_RATE_LIMIT as usize);
        assert!(allowed < (COMMAND_RATE_LIMIT * 2) as usize);
    }
}
