//! Per-second outbound byte budget
//!
//! A fixed window opens at the first send. Sends are charged to it until
//! the next one would exceed the budget; that send waits for the window
//! boundary and opens the next window. Bursts up to the budget pass
//! unthrottled, so this is a soft bound rather than a leaky bucket.

use std::time::{Duration, Instant};

use crate::pipeline::CancelToken;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RateLimiter {
    budget: u64,
    window_start: Instant,
    bytes_in_window: u64,
    throttled: Duration,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        Self::starting_at(bytes_per_second, Instant::now())
    }

    /// Limiter whose first window opens at `start`
    pub fn starting_at(bytes_per_second: u64, start: Instant) -> Self {
        Self {
            budget: bytes_per_second,
            window_start: start,
            bytes_in_window: 0,
            throttled: Duration::ZERO,
        }
    }

    /// Charge `bytes` sent at `now` and return how long to wait first
    ///
    /// A send larger than the whole budget passes alone in an empty window.
    pub fn acquire_at(&mut self, now: Instant, bytes: u64) -> Duration {
        if now.saturating_duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.bytes_in_window = 0;
        }

        let mut wait = Duration::ZERO;
        if self.bytes_in_window > 0 && self.bytes_in_window + bytes > self.budget {
            wait = WINDOW.saturating_sub(now.saturating_duration_since(self.window_start));
            self.window_start = now + wait;
            self.bytes_in_window = 0;
            self.throttled += wait;
        }

        self.bytes_in_window += bytes;
        wait
    }

    /// Wait until `bytes` may be sent; false if cancelled while waiting
    pub fn acquire(&mut self, bytes: u64, cancel: &CancelToken) -> bool {
        let wait = self.acquire_at(Instant::now(), bytes);
        wait.is_zero() || cancel.sleep(wait)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Total time spent waiting for a window boundary
    pub fn throttled(&self) -> Duration {
        self.throttled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_burst_within_budget_passes() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::starting_at(375, t0);
        assert_eq!(limiter.acquire_at(t0, 100), Duration::ZERO);
        assert_eq!(limiter.acquire_at(t0, 100), Duration::ZERO);
        assert_eq!(limiter.acquire_at(t0, 175), Duration::ZERO);
        assert_eq!(limiter.throttled(), Duration::ZERO);
    }

    #[test]
    fn test_overflow_waits_for_boundary() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::starting_at(375, t0);
        limiter.acquire_at(t0, 300);

        let now = t0 + Duration::from_millis(250);
        assert_eq!(limiter.acquire_at(now, 100), Duration::from_millis(750));
        assert_eq!(limiter.throttled(), Duration::from_millis(750));

        // The next window opened at t0 + 1s and already holds 100 bytes
        let now = t0 + Duration::from_millis(1200);
        assert_eq!(limiter.acquire_at(now, 275), Duration::ZERO);
        assert_eq!(limiter.acquire_at(now, 1), Duration::from_millis(800));
    }

    #[test]
    fn test_idle_window_resets() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::starting_at(100, t0);
        limiter.acquire_at(t0, 100);
        assert_eq!(limiter.acquire_at(t0 + Duration::from_secs(3), 100), Duration::ZERO);
    }

    #[test]
    fn test_oversized_send_passes_alone() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::starting_at(100, t0);
        assert_eq!(limiter.acquire_at(t0, 500), Duration::ZERO);
        assert_eq!(limiter.acquire_at(t0, 500), Duration::from_secs(1));
    }

    #[test]
    fn test_acquire_cancelled() {
        let mut limiter = RateLimiter::new(10);
        let cancel = CancelToken::new();
        assert!(limiter.acquire(10, &cancel));

        cancel.cancel();
        let started = Instant::now();
        assert!(!limiter.acquire(10, &cancel));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    proptest! {
        #[test]
        fn prop_rate_bounded_by_budget_plus_one_send(
            budget in 1u64..2000,
            size in 1u64..600,
            spacing_ms in 0u64..400,
            sends in 1usize..80,
        ) {
            let t0 = Instant::now();
            let mut limiter = RateLimiter::starting_at(budget, t0);
            let spacing = Duration::from_millis(spacing_ms);

            let mut clock = t0;
            let mut first = None;
            for i in 0..sends {
                // Requests arrive at a uniform pace and are served in order
                clock = clock.max(t0 + spacing * i as u32);
                clock += limiter.acquire_at(clock, size);
                if first.is_none() {
                    first = Some(clock);
                }

                // Every window stays within the budget or holds a single send
                prop_assert!(limiter.bytes_in_window <= budget.max(size));
                prop_assert!(clock.duration_since(limiter.window_start) < WINDOW);
            }

            let span = clock.duration_since(first.unwrap_or(t0)) + WINDOW;
            let rate = (sends as u64 * size) as f64 / span.as_secs_f64();
            prop_assert!(rate <= (budget + size) as f64 + 1e-6);
        }
    }
}
