use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use futures::future::join_all;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};
use crate::config::{EngineConfig, SourceConfig};
use crate::engine::buffer::ResultBuffer;
use crate::engine::metrics::{IngestionMetrics, MetricsSnapshot};
use crate::error::{Error, Result};
use crate::observability::metrics::FETCH_LATENCY;
use crate::observability::tracing::trace_batch;
use crate::types::{BufferItem, FetchParams, RequestSpec};
use crate::utils::TaskSupervisor;
use crate::utils::helper::{alert_operations_team_critical, alert_operations_team_warning, duration_ms};
use crate::workers::{ProviderRegistry, WorkerPool};

/// Everything that exists only between `start()` and `stop()`.
#[derive(Clone)]
struct Running {
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    in_flight: TaskTracker,
}

/// Front door of the ingestion core: owns the worker pool, the result buffer
/// and the three background loops.
///
/// Lifecycle is `stopped → running → stopped`; the engine may be started
/// again after a stop.
pub struct IngestionEngine {
    config: EngineConfig,
    sources: Vec<SourceConfig>,
    registry: ProviderRegistry,

    // Serializes start/stop and owns the loop handles.
    lifecycle: Arc<tokio::sync::Mutex<TaskSupervisor>>,
    running: RwLock<Option<Running>>,

    buffer: Arc<ResultBuffer>,
    metrics: Arc<Mutex<IngestionMetrics>>,
}

impl IngestionEngine {
    pub fn new(config: EngineConfig, sources: Vec<SourceConfig>, registry: ProviderRegistry) -> Self {
        IngestionEngine {
            buffer: Arc::new(ResultBuffer::new(config.queue_size)),
            metrics: Arc::new(Mutex::new(IngestionMetrics::new(config.latency_window))),
            lifecycle: Arc::new(tokio::sync::Mutex::new(TaskSupervisor::new())),
            running: RwLock::new(None),
            config,
            sources,
            registry,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.read().expect("engine state lock poisoned").is_some()
    }

    fn current(&self) -> Option<Running> {
        self.running.read().expect("engine state lock poisoned").clone()
    }

    pub async fn start(&self) -> Result<()> {
        let mut supervisor = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(Error::EngineAlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let pool = Arc::new(WorkerPool::initialize(
            &self.sources,
            &self.registry,
            &self.config,
            cancel.clone(),
        )?);

        supervisor.spawn(
            "queue_processor",
            queue_processor(
                Arc::clone(&self.buffer),
                self.config.batch_size,
                self.config.queue_poll_interval(),
                cancel.clone(),
            ),
        );
        supervisor.spawn(
            "metrics_collector",
            metrics_collector(
                Arc::clone(&self.metrics),
                Arc::clone(&self.buffer),
                self.config.metrics_interval(),
                cancel.clone(),
            ),
        );
        supervisor.spawn(
            "performance_monitor",
            performance_monitor(
                Arc::clone(&self.metrics),
                Arc::clone(&pool),
                Arc::clone(&self.lifecycle),
                self.config.clone(),
                cancel.clone(),
            ),
        );

        info!(
            workers = pool.worker_count(),
            sources = ?pool.sources(),
            "Ingestion engine started"
        );
        *self.running.write().expect("engine state lock poisoned") = Some(Running {
            pool,
            cancel,
            in_flight: TaskTracker::new(),
        });
        Ok(())
    }

    /// Cancels the loops and every in-flight fetch, waits for them within the
    /// shutdown timeout, closes the pool and moves queued results to the ready
    /// buffer. Stopping a stopped engine does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut supervisor = self.lifecycle.lock().await;
        let Some(running) = self.running.write().expect("engine state lock poisoned").take() else {
            debug!("Ingestion engine already stopped");
            return Ok(());
        };

        info!("Stopping ingestion engine");
        running.cancel.cancel();
        running.in_flight.close();

        let grace = self.config.shutdown_timeout();
        let deadline = Instant::now() + grace;
        if tokio::time::timeout_at(deadline, running.in_flight.wait()).await.is_err() {
            warn!(
                remaining = running.in_flight.len(),
                "In-flight fetches still running after {:?}",
                grace
            );
        }
        supervisor.shutdown(deadline.saturating_duration_since(Instant::now())).await;

        running.pool.close_all();
        let drained = self.buffer.drain_queue().await;
        self.metrics
            .lock()
            .expect("engine metrics lock poisoned")
            .set_buffer_state(self.buffer.len(), self.buffer.dropped());

        info!(drained, ready = self.buffer.ready_len(), "Ingestion engine stopped");
        Ok(())
    }

    /// Fails with `TaskFailed` when a background loop has died while the
    /// engine is running.
    pub async fn check_health(&self) -> Result<()> {
        let supervisor = self.lifecycle.lock().await;
        if !self.is_running() {
            return Err(Error::EngineNotRunning);
        }
        supervisor.check_health()
    }

    /// Single fetch with the failure kept visible.
    pub async fn try_fetch_data(&self, source_name: &str, params: FetchParams) -> Result<Value> {
        let running = self.current().ok_or(Error::EngineNotRunning)?;
        let pool = Arc::clone(&running.pool);

        running
            .in_flight
            .track_future(self.fetch_timed(pool, source_name, params))
            .await
    }

    /// Single fetch. Any failure, including an unknown source, is `None`.
    pub async fn fetch_data(&self, source_name: &str, params: FetchParams) -> Option<Value> {
        match self.try_fetch_data(source_name, params).await {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(source = source_name, error = %e, "fetch_data returned no data");
                None
            }
        }
    }

    /// Issues every request concurrently. Result `i` belongs to request `i`.
    pub async fn fetch_batch(&self, requests: Vec<RequestSpec>) -> Vec<Option<Value>> {
        let span = trace_batch(requests.len());
        let fetches = requests
            .into_iter()
            .map(|request| async move { self.fetch_data(&request.source, request.params).await });

        join_all(fetches).instrument(span).await
    }

    async fn fetch_timed(&self, pool: Arc<WorkerPool>, source_name: &str, params: FetchParams) -> Result<Value> {
        let start = Instant::now();
        let result = pool.fetch_data(source_name, &params).await;
        let elapsed = start.elapsed();
        let latency_ms = duration_ms(elapsed);

        FETCH_LATENCY
            .with_label_values(&[source_name])
            .observe(elapsed.as_secs_f64());

        let data = result.inspect_err(|_| self.record(latency_ms, false, false))?;

        let item = BufferItem::new(source_name, &params, data.clone(), latency_ms);
        let buffered = self.buffer.push(item).is_ok();
        self.record(latency_ms, true, buffered);
        Ok(data)
    }

    fn record(&self, latency_ms: f64, success: bool, buffered: bool) {
        let mut metrics = self.metrics.lock().expect("engine metrics lock poisoned");
        metrics.record_request(latency_ms, success);
        if buffered {
            metrics.record_buffered();
        }
        metrics.set_buffer_state(self.buffer.len(), self.buffer.dropped());
    }

    /// Drains up to `max_items` results for the normalization layer.
    pub fn get_buffer_items(&self, max_items: usize) -> Vec<BufferItem> {
        self.buffer.take(max_items)
    }

    /// Recomputes percentiles and reports SLA status alongside pool metrics.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let (engine, sla) = {
            let mut metrics = self.metrics.lock().expect("engine metrics lock poisoned");
            metrics.recompute_percentiles();
            metrics.set_buffer_state(self.buffer.len(), self.buffer.dropped());
            (metrics.snapshot(), metrics.sla(&self.config))
        };

        let running = self.current();
        MetricsSnapshot {
            running: running.is_some(),
            engine,
            sla,
            pool: running.map(|r| r.pool.snapshot()),
        }
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn queue_processor(buffer: Arc<ResultBuffer>, batch_size: usize, poll: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            moved = buffer.process_batch(batch_size, poll) => {
                if moved > 0 {
                    debug!(moved, ready = buffer.ready_len(), "Moved results to ready buffer");
                }
            }
        }
    }
    info!("Queue processor stopped");
}

async fn metrics_collector(
    metrics: Arc<Mutex<IngestionMetrics>>,
    buffer: Arc<ResultBuffer>,
    period: Duration,
    cancel: CancellationToken,
) {
    metrics
        .lock()
        .expect("engine metrics lock poisoned")
        .update_throughput(Instant::now());

    let mut ticker = interval(period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut metrics = metrics.lock().expect("engine metrics lock poisoned");
                let throughput = metrics.update_throughput(Instant::now());
                metrics.recompute_percentiles();
                metrics.set_buffer_state(buffer.len(), buffer.dropped());
                debug!(throughput_rps = throughput, "Metrics collected");
            }
        }
    }
    info!("Metrics collector stopped");
}

async fn performance_monitor(
    metrics: Arc<Mutex<IngestionMetrics>>,
    pool: Arc<WorkerPool>,
    supervisor: Arc<tokio::sync::Mutex<TaskSupervisor>>,
    config: EngineConfig,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.monitor_interval());
    let mut last_total = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (sla, total) = {
                    let metrics = metrics.lock().expect("engine metrics lock poisoned");
                    (metrics.sla(&config), metrics.total_requests())
                };

                if !sla.p95_met {
                    alert_operations_team_warning(format!(
                        "p95 latency {:.1}ms exceeds target {:.1}ms",
                        sla.p95_latency_ms, sla.p95_target_ms
                    ));
                }
                // An idle engine has no throughput to speak of.
                if !sla.throughput_met && total > last_total {
                    alert_operations_team_warning(format!(
                        "throughput {:.2} req/s below target {:.2} req/s",
                        sla.throughput_rps, sla.throughput_target
                    ));
                }
                last_total = total;

                // Held by start/stop while they run; the next tick checks again.
                if let Ok(supervisor) = supervisor.try_lock() {
                    if let Err(e) = supervisor.check_health() {
                        alert_operations_team_critical(e.to_string());
                    }
                }

                let unhealthy = pool.health();
                if !unhealthy.is_empty() && unhealthy.len() == pool.worker_count() {
                    alert_operations_team_critical(format!("all {} workers have open circuits", unhealthy.len()));
                } else {
                    for worker in unhealthy {
                        alert_operations_team_warning(format!(
                            "{} ({}) circuit is {:?}",
                            worker.worker_id, worker.source, worker.state
                        ));
                    }
                }
            }
        }
    }
    info!("Performance monitor stopped");
}
