use std::future::Future;
use std::sync::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use crate::config::CircuitBreakerConfig;
use crate::error::{ErrorKind, FetchError};
use crate::observability::metrics::CIRCUIT_BREAKER_TRIPS;

/// Breaker states, named by what they mean for the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Closed: calls pass through.
    Healthy,
    /// Half-open: trial calls are let through to probe recovery.
    Degraded,
    /// Open: calls fail immediately without I/O.
    CircuitOpen,
}

#[derive(Clone, Debug, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub trips: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_calls: u32,
    total_calls: u64,
    successful_calls: u64,
    trips: u64,
}

/// Per-worker circuit breaker. Owned by exactly one worker and never shared.
pub struct CircuitBreaker {
    source_name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(source_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            source_name: source_name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Healthy,
                failure_count: 0,
                last_failure_time: None,
                half_open_calls: 0,
                total_calls: 0,
                successful_calls: 0,
                trips: 0,
            }),
        }
    }

    /// Runs `f` under the breaker. Only transient failures count toward
    /// tripping; client errors and cancellations leave the state untouched.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.admit()?;

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if e.kind() == ErrorKind::Transient {
                    self.on_failure();
                }
                Err(e)
            }
        }
    }

    fn admit(&self) -> Result<(), FetchError> {
        let mut s = self.state.lock().expect("circuit breaker lock poisoned");

        if s.state == CircuitState::CircuitOpen {
            let recovered = s
                .last_failure_time
                .map(|t| t.elapsed() >= self.config.recovery_timeout())
                .unwrap_or(true);

            if !recovered {
                return Err(FetchError::CircuitOpen {
                    source_name: self.source_name.clone(),
                });
            }

            s.state = CircuitState::Degraded;
            s.half_open_calls = 0;
            tracing::info!(source = %self.source_name, "Circuit breaker half-open, probing recovery");
        }

        s.total_calls += 1;
        Ok(())
    }

    fn on_success(&self) {
        let mut s = self.state.lock().expect("circuit breaker lock poisoned");
        s.successful_calls += 1;
        s.failure_count = 0;

        if s.state == CircuitState::Degraded {
            s.half_open_calls += 1;
            if s.half_open_calls >= self.config.half_open_max_calls {
                s.state = CircuitState::Healthy;
                s.half_open_calls = 0;
                tracing::info!(source = %self.source_name, "Circuit breaker closed, source recovered");
            }
        }
    }

    fn on_failure(&self) {
        let mut s = self.state.lock().expect("circuit breaker lock poisoned");
        s.failure_count += 1;
        s.last_failure_time = Some(Instant::now());

        let trip = match s.state {
            CircuitState::Degraded => true,
            CircuitState::Healthy => s.failure_count >= self.config.failure_threshold,
            CircuitState::CircuitOpen => false,
        };

        if trip {
            s.state = CircuitState::CircuitOpen;
            s.half_open_calls = 0;
            s.trips += 1;
            CIRCUIT_BREAKER_TRIPS.with_label_values(&[&self.source_name]).inc();
            tracing::warn!(
                source = %self.source_name,
                failures = s.failure_count,
                "Circuit breaker opened"
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().expect("circuit breaker lock poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().expect("circuit breaker lock poisoned").failure_count
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let s = self.state.lock().expect("circuit breaker lock poisoned");
        CircuitBreakerStats {
            state: s.state,
            failure_count: s.failure_count,
            half_open_calls: s.half_open_calls,
            total_calls: s.total_calls,
            successful_calls: s.successful_calls,
            trips: s.trips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use proptest::prelude::*;

    fn breaker(threshold: u32, recovery_secs: f64, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
            half_open_max_calls: half_open,
        })
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), FetchError> {
        cb.call(|| async { Err::<(), _>(FetchError::Timeout) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), FetchError> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_short_circuits() {
        let cb = breaker(3, 60.0, 1);
        for _ in 0..3 {
            assert_eq!(fail(&cb).await, Err(FetchError::Timeout));
        }
        assert_eq!(cb.state(), CircuitState::CircuitOpen);

        let invoked = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 60.0, 1);
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.failure_count(), 2);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.failure_count(), 0);
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_timeout_lets_probe_through() {
        let cb = breaker(1, 30.0, 2);
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::CircuitOpen);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(succeed(&cb).await, Err(FetchError::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Degraded);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_degraded_reopens() {
        let cb = breaker(2, 10.0, 3);
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Degraded);
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::CircuitOpen);
        assert_eq!(cb.stats().half_open_calls, 0);
        assert_eq!(cb.stats().trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_do_not_trip() {
        let cb = breaker(1, 60.0, 1);
        let result = cb
            .call(|| async { Err::<(), _>(FetchError::NotFound("AAPL".into())) })
            .await;
        assert!(matches!(result, Err(FetchError::NotFound(_))));
        assert_eq!(cb.state(), CircuitState::Healthy);
        assert_eq!(cb.stats().total_calls, 1);
        assert_eq!(cb.stats().successful_calls, 0);
    }

    proptest! {
        #[test]
        fn prop_threshold_failures_always_open(threshold in 1u32..20, extra in 0u32..10) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let cb = breaker(threshold, 60.0, 1);
                for _ in 0..(threshold + extra) {
                    let _ = fail(&cb).await;
                }
                prop_assert_eq!(cb.state(), CircuitState::CircuitOpen);
                prop_assert_eq!(cb.stats().total_calls, threshold as u64);
                Ok(())
            })?;
        }

        #[test]
        fn prop_k_successes_close_half_open(k in 1u32..10) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let cb = breaker(1, 5.0, k);
                let _ = fail(&cb).await;
                tokio::time::advance(Duration::from_secs(5)).await;
                for i in 0..k {
                    prop_assert_ne!(cb.state(), CircuitState::Healthy, "closed early at {}", i);
                    succeed(&cb).await.unwrap();
                }
                prop_assert_eq!(cb.state(), CircuitState::Healthy);
                Ok(())
            })?;
        }
    }
}
