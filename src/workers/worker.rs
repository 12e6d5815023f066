use std::sync::{Arc, Mutex};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::config::SourceConfig;
use crate::error::{FetchError, Result};
use crate::http::ConnectionPoolManager;
use crate::observability::metrics::FETCHES;
use crate::observability::tracing::trace_fetch;
use crate::resilience::{CircuitBreaker, CircuitState, RateLimiter, RetryHandler};
use crate::types::{FetchParams, RequestId, WorkerId};
use crate::workers::SourceFetcher;
use crate::workers::metrics::{WorkerMetrics, WorkerSnapshot};

/// One provider worker: rate limit, then circuit breaker around retries around
/// the provider's single-request fetch.
///
/// A worker is only ever driven by one caller at a time; the pool's hand-off
/// guarantees it. The locks below are never held across an await.
pub struct DataSourceWorker {
    id: WorkerId,
    config: Arc<SourceConfig>,
    fetcher: Arc<dyn SourceFetcher>,
    http: ConnectionPoolManager,
    breaker: CircuitBreaker,
    retry: RetryHandler,
    rate_limiter: RateLimiter,
    metrics: Mutex<WorkerMetrics>,
    cancel: CancellationToken,
}

impl DataSourceWorker {
    pub fn new(
        id: WorkerId,
        config: Arc<SourceConfig>,
        fetcher: Arc<dyn SourceFetcher>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = ConnectionPoolManager::new(&config.name, config.effective_pool_config());
        http.initialize()?;

        Ok(DataSourceWorker {
            id,
            breaker: CircuitBreaker::new(&config.name, config.circuit_breaker.clone()),
            retry: RetryHandler::new(&config.name, config.retry.clone()),
            rate_limiter: RateLimiter::new(config.rate_windows()),
            http,
            config,
            fetcher,
            metrics: Mutex::new(WorkerMetrics::default()),
            cancel,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn source_name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn health(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Failures are recorded here and returned as values; nothing panics or
    /// escapes past this boundary.
    pub async fn fetch(&self, params: &FetchParams) -> std::result::Result<Value, FetchError> {
        let span = trace_fetch(RequestId::new(), &self.config.name, params.symbol.as_deref());
        let start = Instant::now();

        let result = self.run(params).instrument(span).await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record(&result, elapsed_ms);
        result
    }

    async fn run(&self, params: &FetchParams) -> std::result::Result<Value, FetchError> {
        self.check_supported(params)?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.guarded_fetch(params) => result,
        }
    }

    async fn guarded_fetch(&self, params: &FetchParams) -> std::result::Result<Value, FetchError> {
        let waited = self.rate_limiter.acquire().await;
        if !waited.is_zero() {
            tracing::debug!(waited_ms = waited.as_millis() as u64, "Throttled by rate limit");
        }

        self.breaker
            .call(|| {
                self.retry.execute(|| self.fetcher.fetch_internal(&self.http, &self.config, params))
            })
            .await
    }

    fn check_supported(&self, params: &FetchParams) -> std::result::Result<(), FetchError> {
        if let Some(symbol) = params.symbol.as_deref() {
            if !self.config.supports_symbol(symbol) {
                return Err(FetchError::UnsupportedRequest(format!(
                    "{} does not serve symbol {}",
                    self.config.name, symbol
                )));
            }
        }
        if let Some(data_type) = params.data_type.as_deref() {
            if !self.config.supports_data_type(data_type) {
                return Err(FetchError::UnsupportedRequest(format!(
                    "{} does not serve data type {}",
                    self.config.name, data_type
                )));
            }
        }
        Ok(())
    }

    fn record(&self, result: &std::result::Result<Value, FetchError>, elapsed_ms: f64) {
        let trips = self.breaker.stats().trips;
        let mut metrics = self.metrics.lock().expect("worker metrics lock poisoned");
        metrics.circuit_breaker_trips = trips;

        match result {
            Ok(_) => {
                metrics.record_success(elapsed_ms);
                FETCHES.with_label_values(&[&self.config.name, "success"]).inc();
            }
            Err(e) => {
                metrics.record_failure(elapsed_ms, &e.to_string());
                FETCHES.with_label_values(&[&self.config.name, e.kind().as_str()]).inc();
                tracing::warn!(
                    source = %self.config.name,
                    worker = %self.id,
                    error = %e,
                    "Fetch failed"
                );
            }
        }
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics.lock().expect("worker metrics lock poisoned").clone()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let metrics = self.metrics();
        WorkerSnapshot {
            worker_id: self.id,
            source: self.config.name.clone(),
            circuit_state: self.breaker.state(),
            success_rate: metrics.success_rate(),
            average_response_time_ms: metrics.average_response_time_ms(),
            metrics,
            connections: self.http.stats(),
        }
    }

    pub fn close(&self) {
        self.http.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use serde_json::json;
    use crate::workers::MockSourceFetcher;

    fn config(name: &str) -> SourceConfig {
        let mut config = SourceConfig::new(name, "http://127.0.0.1:9");
        config.requests_per_minute = 0;
        config.retry.max_attempts = 2;
        config.retry.base_delay_secs = 0.01;
        config.circuit_breaker.failure_threshold = 2;
        config
    }

    fn worker(config: SourceConfig, fetcher: MockSourceFetcher) -> DataSourceWorker {
        DataSourceWorker::new(WorkerId(0), Arc::new(config), Arc::new(fetcher), CancellationToken::new())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_updates_metrics() {
        let mut fetcher = MockSourceFetcher::new();
        fetcher
            .expect_fetch_internal()
            .times(1)
            .returning(|_, _, params| Ok(json!({ "symbol": params.symbol })));

        let w = worker(config("binance"), fetcher);
        let data = w.fetch(&FetchParams::new().symbol("BTCUSDT")).await.unwrap();

        assert_eq!(data, json!({ "symbol": "BTCUSDT" }));
        let metrics = w.metrics();
        assert_eq!(metrics.requests_completed, 1);
        assert_eq!(metrics.requests_failed, 0);
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_returned_and_recorded() {
        let mut fetcher = MockSourceFetcher::new();
        fetcher
            .expect_fetch_internal()
            .times(1)
            .returning(|_, _, _| Err(FetchError::Authentication { status: 401 }));

        let w = worker(config("polygon"), fetcher);
        let err = w.fetch(&FetchParams::new()).await.unwrap_err();

        assert_eq!(err, FetchError::Authentication { status: 401 });
        let metrics = w.metrics();
        assert_eq!(metrics.requests_failed, 1);
        assert!(metrics.last_error.unwrap().contains("401"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_fetch_internal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut fetcher = MockSourceFetcher::new();
        fetcher.expect_fetch_internal().returning(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Timeout)
        });

        let w = worker(config("kraken"), fetcher);
        // two fetches x two attempts each, threshold counts fetches
        w.fetch(&FetchParams::new()).await.unwrap_err();
        w.fetch(&FetchParams::new()).await.unwrap_err();
        assert_eq!(w.health(), CircuitState::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let err = w.fetch(&FetchParams::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(w.metrics().circuit_breaker_trips, 1);
        assert_eq!(w.metrics().requests_failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_symbol_fails_without_io() {
        let mut fetcher = MockSourceFetcher::new();
        fetcher.expect_fetch_internal().times(0);

        let mut cfg = config("fred");
        cfg.symbols = vec!["GDP".into()];
        let w = worker(cfg, fetcher);

        let err = w.fetch(&FetchParams::new().symbol("AAPL")).await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedRequest(_)));
        assert_eq!(w.metrics().requests_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delays_excess_fetches() {
        let mut fetcher = MockSourceFetcher::new();
        fetcher.expect_fetch_internal().times(3).returning(|_, _, _| Ok(json!({})));

        let mut cfg = config("alpha_vantage");
        cfg.requests_per_minute = 2;
        let w = worker(cfg, fetcher);

        let start = Instant::now();
        w.fetch(&FetchParams::new()).await.unwrap();
        w.fetch(&FetchParams::new()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        w.fetch(&FetchParams::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(w.metrics().requests_completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_is_a_failure() {
        let mut fetcher = MockSourceFetcher::new();
        fetcher.expect_fetch_internal().times(0);

        let mut cfg = config("coinbase");
        cfg.requests_per_minute = 1;
        let cancel = CancellationToken::new();
        let w = DataSourceWorker::new(WorkerId(3), Arc::new(cfg), Arc::new(fetcher), cancel.clone()).unwrap();

        // Exhaust the window so the next fetch parks in the throttle.
        w.rate_limiter.check_and_record().unwrap();
        let start = Instant::now();
        let params = FetchParams::new();
        let (result, ()) = tokio::join!(w.fetch(&params), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        assert_eq!(result.unwrap_err(), FetchError::Cancelled);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(w.metrics().requests_failed, 1);
        assert_eq!(w.health(), CircuitState::Healthy);
    }
}
