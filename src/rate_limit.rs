//! Requests-per-minute rate limiting shared across all provider calls in a run.
//!
//! A monotonic token bucket with capacity 1 and a refill rate of `rpm / 60`
//! tokens per second. The lock is held only while refilling and reserving;
//! waiting always happens outside it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ProviderError, ProviderResult};

/// Monotonic clock source, injectable for deterministic tests.
pub trait MonotonicClock: Send + Sync {
    /// Seconds elapsed on a monotonic timeline.
    fn monotonic(&self) -> f64;
}

struct SystemClock {
    origin: Instant,
}

impl MonotonicClock for SystemClock {
    fn monotonic(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Blocking sleep, injectable so tests can advance a fake clock instead.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, seconds: f64);
}

struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, seconds: f64) {
        std::thread::sleep(Duration::from_secs_f64(seconds));
    }
}

struct BucketState {
    tokens: f64,
    updated_at: f64,
}

/// Token-bucket rate limiter with sync and async acquisition.
pub struct RateLimiter {
    rate_per_second: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn MonotonicClock>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> ProviderResult<Self> {
        let clock: Arc<dyn MonotonicClock> = Arc::new(SystemClock {
            origin: Instant::now(),
        });
        Self::with_clock(rpm, clock, Arc::new(ThreadSleeper))
    }

    pub fn with_clock(
        rpm: u32,
        clock: Arc<dyn MonotonicClock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> ProviderResult<Self> {
        if rpm == 0 {
            return Err(ProviderError::Config(
                "rpm must be greater than zero".into(),
            ));
        }
        let now = clock.monotonic();
        Ok(Self {
            rate_per_second: f64::from(rpm) / 60.0,
            state: Mutex::new(BucketState {
                tokens: 1.0,
                updated_at: now,
            }),
            clock,
            sleeper,
        })
    }

    /// Refill and try to take one token; returns how long to wait when the
    /// bucket is empty. Zero means the token was taken.
    fn reserve(&self) -> f64 {
        let now = self.clock.monotonic();
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = now - state.updated_at;
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_second).min(1.0);
            state.updated_at = now;
        }
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return 0.0;
        }
        let deficit = 1.0 - state.tokens;
        let wait = deficit / self.rate_per_second;
        state.tokens = 0.0;
        state.updated_at = now;
        wait
    }

    /// Block until a token is available.
    pub fn acquire(&self) {
        loop {
            let wait = self.reserve();
            if wait <= 0.0 {
                return;
            }
            self.sleeper.sleep(wait);
        }
    }

    /// Yield until a token is available.
    pub async fn acquire_async(&self) {
        loop {
            let wait = self.reserve();
            if wait <= 0.0 {
                return;
            }
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

/// Build the optional shared limiter: no `rpm` means acquisition is a no-op.
pub fn resolve_rate_limiter(rpm: Option<u32>) -> ProviderResult<Option<Arc<RateLimiter>>> {
    match rpm {
        None => Ok(None),
        Some(rpm) => Ok(Some(Arc::new(RateLimiter::new(rpm)?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake clock advanced by the fake sleeper, so acquires are deterministic.
    struct FakeClock {
        now: Mutex<f64>,
    }

    impl MonotonicClock for FakeClock {
        fn monotonic(&self) -> f64 {
            *self.now.lock().unwrap()
        }
    }

    struct FakeSleeper {
        clock: Arc<FakeClock>,
        slept: Mutex<Vec<f64>>,
    }

    impl Sleeper for FakeSleeper {
        fn sleep(&self, seconds: f64) {
            *self.clock.now.lock().unwrap() += seconds;
            self.slept.lock().unwrap().push(seconds);
        }
    }

    #[test]
    fn test_zero_rpm_rejected() {
        assert!(RateLimiter::new(0).is_err());
    }

    #[test]
    fn test_back_to_back_acquires_spaced_by_rate() {
        let clock = Arc::new(FakeClock {
            now: Mutex::new(0.0),
        });
        let sleeper = Arc::new(FakeSleeper {
            clock: Arc::clone(&clock),
            slept: Mutex::new(Vec::new()),
        });
        let limiter =
            RateLimiter::with_clock(30, Arc::clone(&clock) as _, Arc::clone(&sleeper) as _)
                .unwrap();

        limiter.acquire();
        assert!(sleeper.slept.lock().unwrap().is_empty());

        limiter.acquire();
        let slept: f64 = sleeper.slept.lock().unwrap().iter().sum();
        assert!(slept >= 2.0, "expected >= 2.0s wait at rpm=30, got {slept}");
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let clock = Arc::new(FakeClock {
            now: Mutex::new(0.0),
        });
        let sleeper = Arc::new(FakeSleeper {
            clock: Arc::clone(&clock),
            slept: Mutex::new(Vec::new()),
        });
        let limiter =
            RateLimiter::with_clock(60, Arc::clone(&clock) as _, Arc::clone(&sleeper) as _)
                .unwrap();

        limiter.acquire();
        *clock.now.lock().unwrap() += 1.0;
        limiter.acquire();
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_async_acquire_immediate_when_token_available() {
        let limiter = RateLimiter::new(600).unwrap();
        tokio_test::block_on(limiter.acquire_async());
    }

    #[test]
    fn test_resolve_rate_limiter_none() {
        assert!(resolve_rate_limiter(None).unwrap().is_none());
        assert!(resolve_rate_limiter(Some(10)).unwrap().is_some());
    }
}
