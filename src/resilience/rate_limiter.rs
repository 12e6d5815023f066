use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Window {
    limit: usize,
    span: Duration,
    timestamps: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) >= self.span {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_time(&self, now: Instant) -> Duration {
        if self.timestamps.len() < self.limit {
            return Duration::ZERO;
        }
        // The oldest entry that must leave before we fit.
        let idx = self.timestamps.len() - self.limit;
        (self.timestamps[idx] + self.span).saturating_duration_since(now)
    }
}

/// Sliding-window throttle. Callers over capacity are delayed until the oldest
/// request leaves the window; nothing is ever rejected.
pub struct RateLimiter {
    windows: Mutex<Vec<Window>>,
}

impl RateLimiter {
    /// One window per `(limit, span)` pair; a zero limit disables its window.
    pub fn new(limits: Vec<(u32, Duration)>) -> Self {
        let windows = limits
            .into_iter()
            .filter(|(limit, _)| *limit > 0)
            .map(|(limit, span)| Window {
                limit: limit as usize,
                span,
                timestamps: VecDeque::with_capacity(limit.min(4096) as usize),
            })
            .collect();

        RateLimiter {
            windows: Mutex::new(windows),
        }
    }

    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(vec![(requests_per_minute, Duration::from_secs(60))])
    }

    /// Records the request if every window has room, otherwise returns how
    /// long to wait before trying again.
    pub fn check_and_record(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");

        let mut wait = Duration::ZERO;
        for window in windows.iter_mut() {
            window.prune(now);
            wait = wait.max(window.wait_time(now));
        }

        if !wait.is_zero() {
            return Err(wait);
        }

        for window in windows.iter_mut() {
            window.timestamps.push_back(now);
        }
        Ok(())
    }

    /// Suspends until the request fits, then records it. Returns the total
    /// time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();
        loop {
            match self.check_and_record() {
                Ok(()) => return start.elapsed(),
                Err(wait) => {
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, throttling");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Requests currently counted in the tightest window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        windows
            .iter_mut()
            .map(|w| {
                w.prune(now);
                w.timestamps.len()
            })
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_nth_plus_one_is_delayed_not_rejected() {
        let limiter = RateLimiter::per_minute(3);
        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }

        let start = Instant::now();
        let waited = limiter.acquire().await;
        assert_eq!(waited, Duration::from_secs(60));
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(limiter.in_window(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_tracks_oldest_timestamp() {
        let limiter = RateLimiter::per_minute(2);
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(20)).await;
        limiter.acquire().await;

        assert_eq!(limiter.check_and_record(), Err(Duration::from_secs(40)));
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(limiter.check_and_record(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_exceeds_limit() {
        let limiter = RateLimiter::per_minute(5);
        let mut issued = Vec::new();
        for _ in 0..17 {
            limiter.acquire().await;
            issued.push(Instant::now());
        }

        for (i, t) in issued.iter().enumerate() {
            let in_window = issued[i..]
                .iter()
                .filter(|u| u.duration_since(*t) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 5, "{} requests within 60s of request {}", in_window, i);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_windows_take_longest_wait() {
        let limiter = RateLimiter::new(vec![
            (2, Duration::from_secs(1)),
            (3, Duration::from_secs(60)),
        ]);
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.check_and_record(), Err(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        limiter.acquire().await;
        assert_eq!(limiter.check_and_record(), Err(Duration::from_secs(59)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_windows_never_waits() {
        let limiter = RateLimiter::new(vec![(0, Duration::from_secs(60))]);
        for _ in 0..1000 {
            assert_eq!(limiter.check_and_record(), Ok(()));
        }
    }
}
