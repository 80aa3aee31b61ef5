use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Paces every request a client sends: a burst of `burst` calls, then one call
/// per `interval`. A zero interval disables pacing.
#[derive(Debug)]
pub struct RequestLimiter {
    burst: u32,
    interval: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Clone, Copy)]
struct LimiterState {
    available: u32,
    /// Point from which the next token accrues.
    anchor: Instant,
}

impl LimiterState {
    fn refill(&mut self, now: Instant, burst: u32, interval: Duration) {
        let earned = now.saturating_duration_since(self.anchor).as_nanos() / interval.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.available = self.available.saturating_add(earned).min(burst);
        if self.available == burst {
            self.anchor = now;
        } else {
            // Keep the partial interval already elapsed.
            self.anchor += interval * earned;
        }
    }
}

impl RequestLimiter {
    pub fn new(burst: u32, interval: Duration) -> Self {
        let burst = burst.max(1);
        Self {
            burst,
            interval,
            state: Mutex::new(LimiterState {
                available: burst,
                anchor: Instant::now(),
            }),
        }
    }

    /// `rps` calls of burst and `rps` calls per second after that; `0` is unlimited.
    pub fn per_second(rps: u32) -> Self {
        match rps {
            0 => Self::unlimited(),
            rps => Self::new(rps, Duration::from_secs(1) / rps),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn is_unlimited(&self) -> bool {
        self.interval.is_zero()
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        let mut state = self.state.lock().await;
        state.refill(Instant::now(), self.burst, self.interval);
        if state.available == 0 {
            return false;
        }
        state.available -= 1;
        true
    }

    /// Wait for a token. Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill(now, self.burst, self.interval);
                if state.available > 0 {
                    state.available -= 1;
                    return start.elapsed();
                }
                (state.anchor + self.interval).saturating_duration_since(now)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_paced() {
        let limiter = RequestLimiter::new(2, Duration::from_millis(250));
        let start = Instant::now();

        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(limiter.acquire().await, Duration::ZERO);

        let waited = limiter.acquire().await;
        assert!(waited >= Duration::from_millis(250) && waited < Duration::from_millis(260));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(520));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_interval_is_not_lost() {
        let limiter = RequestLimiter::new(2, Duration::from_millis(100));
        limiter.acquire().await;
        limiter.acquire().await;

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        // 50ms of the next interval already accrued.
        let waited = limiter.acquire().await;
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_refills_up_to_burst() {
        let limiter = RequestLimiter::per_second(4);
        assert_eq!(limiter.burst(), 4);
        for _ in 0..4 {
            limiter.acquire().await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        for _ in 0..4 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_means_unlimited() {
        let limiter = RequestLimiter::per_second(0);
        assert!(limiter.is_unlimited());
        for _ in 0..100 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }
}
