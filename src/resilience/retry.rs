use std::future::Future;
use std::time::Duration;
use rand::Rng;
use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::observability::metrics::FETCH_RETRIES;

const JITTER_FRACTION: f64 = 0.10;

/// Exponential backoff with jitter around a single fallible call.
pub struct RetryHandler {
    source_name: String,
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(source_name: impl Into<String>, config: RetryConfig) -> Self {
        RetryHandler {
            source_name: source_name.into(),
            config,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// `min(base_delay * exponential_base^attempt, max_delay)`, 0-indexed.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay();
        let exp = self.config.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        // Overflow to inf/NaN lands on the cap.
        Duration::try_from_secs_f64(self.config.base_delay().as_secs_f64() * exp)
            .map_or(max, |delay| delay.min(max))
    }

    /// Base delay perturbed by up to ±10%, then clamped back into
    /// `[0, max_delay]`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(attempt);
        if !self.config.jitter || base.is_zero() {
            return base;
        }

        let spread = base.as_secs_f64() * JITTER_FRACTION;
        let jittered = base.as_secs_f64() + rng.gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.clamp(0.0, self.config.max_delay().as_secs_f64()))
    }

    /// Invokes `f` up to `max_attempts` times. Non-retryable errors and the
    /// final attempt's error are returned unchanged.
    pub async fn execute<T, F, Fut>(&self, mut f: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    tracing::debug!(source = %self.source_name, error = %e, "Not retrying");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        tracing::warn!(
                            source = %self.source_name,
                            attempts = attempt,
                            error = %e,
                            "Retries exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt - 1, &mut rand::thread_rng());
                    FETCH_RETRIES.with_label_values(&[&self.source_name]).inc();
                    tracing::debug!(
                        source = %self.source_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn handler(max_attempts: u32, base: f64, max: f64, jitter: bool) -> RetryHandler {
        RetryHandler::new("test", RetryConfig {
            max_attempts,
            base_delay_secs: base,
            max_delay_secs: max,
            exponential_base: 2.0,
            jitter,
        })
    }

    #[test]
    fn test_backoff_sequence() {
        let h = handler(5, 1.0, 10.0, false);
        let delays: Vec<_> = (0..6).map(|i| h.base_delay_for(i).as_secs_f64()).collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0, 10.0, 10.0]);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let h = handler(5, 1.0, 100.0, true);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = h.delay_for(2, &mut rng).as_secs_f64();
            assert!((3.6..=4.4).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_oversized_delays_land_on_cap() {
        let h = handler(5, 1e20, 1e30, false);
        let year = h.config().max_delay();
        assert_eq!(year, Duration::from_secs(365 * 24 * 3600));
        assert_eq!(h.base_delay_for(0), year);
        assert_eq!(h.delay_for(3, &mut StdRng::seed_from_u64(1)), year);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let h = handler(3, 0.5, 5.0, true);
        let calls = AtomicU32::new(0);
        let result = h
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(FetchError::Http { status: 503, body: String::new() }) } else { Ok(n) }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let h = handler(4, 0.1, 1.0, false);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = h
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Network(format!("attempt {}", n)))
            })
            .await;
        assert_eq!(result, Err(FetchError::Network("attempt 3".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_invoke_once() {
        for err in [
            FetchError::Authentication { status: 401 },
            FetchError::Authentication { status: 403 },
            FetchError::NotFound("missing".into()),
        ] {
            let h = handler(5, 0.1, 1.0, true);
            let calls = AtomicU32::new(0);
            let expected = err.clone();
            let result: Result<(), _> = h
                .execute(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let err = err.clone();
                    async move { Err(err) }
                })
                .await;
            assert_eq!(result, Err(expected));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let h = handler(3, 1.0, 10.0, false);
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = h.execute(|| async { Err(FetchError::Timeout) }).await;
        // 1s + 2s of backoff before the third attempt
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_max(
            base in 0.0f64..10.0,
            max in 0.0f64..120.0,
            exp in 1.0f64..10.0,
            attempt in 0u32..64,
            seed in any::<u64>(),
        ) {
            let h = RetryHandler::new("prop", RetryConfig {
                max_attempts: 10,
                base_delay_secs: base,
                max_delay_secs: max,
                exponential_base: exp,
                jitter: true,
            });
            let mut rng = StdRng::seed_from_u64(seed);
            let d = h.delay_for(attempt, &mut rng);
            prop_assert!(d <= Duration::from_secs_f64(max));
        }

        #[test]
        fn prop_invocations_bounded_by_max_attempts(max_attempts in 1u32..8, fail_first in 0u32..12) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let calls = AtomicU32::new(0);
            let h = handler(max_attempts, 0.01, 0.1, true);
            let _ = rt.block_on(h.execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_first { Err(FetchError::Timeout) } else { Ok(()) }
            }));
            prop_assert_eq!(calls.load(Ordering::SeqCst), (fail_first + 1).min(max_attempts));
        }
    }
}
