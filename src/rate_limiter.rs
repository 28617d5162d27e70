use std::num::NonZeroU32;
use std::time::Duration;

use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::debug;

use crate::error::RateLimitExceeded;

pub use governor::clock::{Clock, DefaultClock, FakeRelativeClock, Reference};

/// Window over which a [`TokenBucket::fixed`] bucket would refill. Far beyond
/// any job lifetime, and small enough that governor's nanosecond arithmetic
/// cannot overflow.
const FIXED_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

type DirectLimiter<C> =
    RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Token bucket guarding the upstream API quota.
///
/// One instance is shared by every job in the process. The bucket starts full
/// and replenishes one token every `refill_period / capacity`, so an empty
/// bucket is full again after `refill_period`. A bucket built with
/// [`TokenBucket::fixed`] does not refill within any realistic run.
pub struct TokenBucket<C: Clock = DefaultClock> {
    capacity: u32,
    limiter: Option<DirectLimiter<C>>,
}

impl<C: Clock> TokenBucket<C> {
    pub fn new(capacity: u32, refill_period: Duration, clock: &C) -> Self {
        if refill_period.is_zero() {
            return Self::fixed(capacity, clock);
        }
        Self::build(capacity, refill_period, clock)
    }

    pub fn fixed(capacity: u32, clock: &C) -> Self {
        Self::build(capacity, FIXED_WINDOW, clock)
    }

    fn build(capacity: u32, window: Duration, clock: &C) -> Self {
        let limiter = NonZeroU32::new(capacity).map(|burst| {
            let per_token = (window / burst.get()).max(Duration::from_nanos(1));
            let quota = Quota::with_period(per_token)
                .unwrap_or_else(|| Quota::per_second(burst))
                .allow_burst(burst);
            RateLimiter::direct_with_clock(quota, clock)
        });
        Self { capacity, limiter }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Debits `n` tokens, or fails leaving the bucket untouched. Asking for
    /// zero tokens always succeeds.
    pub fn try_consume(&self, n: u32) -> Result<(), RateLimitExceeded> {
        let Some(n) = NonZeroU32::new(n) else {
            return Ok(());
        };
        let granted = match &self.limiter {
            Some(limiter) => matches!(limiter.check_n(n), Ok(Ok(_))),
            None => false,
        };
        if granted {
            return Ok(());
        }
        debug!(requested = n.get(), capacity = self.capacity, "token bucket exhausted");
        Err(RateLimitExceeded {
            requested: n.get(),
            capacity: self.capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_refill_grants_whole_tokens_only() {
        let clock = FakeRelativeClock::default();
        let bucket = TokenBucket::new(10, Duration::from_secs(10), &clock);
        bucket.try_consume(10).unwrap();
        clock.advance(Duration::from_millis(2_500));
        bucket.try_consume(2).unwrap();
        assert!(bucket.try_consume(1).is_err());
    }

    #[test]
    fn request_above_capacity_never_succeeds() {
        let clock = FakeRelativeClock::default();
        let bucket = TokenBucket::new(3, Duration::from_secs(1), &clock);
        clock.advance(Duration::from_secs(60));
        let err = bucket.try_consume(4).unwrap_err();
        assert_eq!(err.requested, 4);
        assert_eq!(err.capacity, 3);
    }

    #[test]
    fn zero_capacity_bucket_rejects_everything_but_zero() {
        let clock = FakeRelativeClock::default();
        let bucket = TokenBucket::new(0, Duration::from_secs(1), &clock);
        assert!(bucket.try_consume(0).is_ok());
        assert!(bucket.try_consume(1).is_err());
    }
}
