use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::config::{EngineConfig, SourceConfig};
use crate::error::{Error, Result};
use crate::resilience::CircuitState;
use crate::types::{FetchParams, WorkerId};
use crate::workers::metrics::WorkerSnapshot;
use crate::workers::registry::ProviderRegistry;
use crate::workers::worker::DataSourceWorker;

#[derive(Clone, Debug, Serialize)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub source: String,
    pub state: CircuitState,
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolSnapshot {
    pub total_workers: usize,
    pub available_workers: usize,
    pub workers: Vec<WorkerSnapshot>,
}

/// Owns every worker and hands each one to at most one caller at a time.
///
/// Idle worker ids sit in `available`. A caller removes the first id whose
/// source matches, drives that worker, and the lease puts the id back on drop,
/// so a worker is returned on success, failure and cancellation alike.
pub struct WorkerPool {
    workers: Vec<Arc<DataSourceWorker>>,
    by_source: HashMap<String, Vec<WorkerId>>,
    available: Mutex<VecDeque<WorkerId>>,
    released: Notify,
    acquire_timeout: Duration,
}

struct WorkerLease<'a> {
    pool: &'a WorkerPool,
    id: WorkerId,
}

impl WorkerLease<'_> {
    fn worker(&self) -> &DataSourceWorker {
        &self.pool.workers[self.id.0]
    }
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        self.pool
            .available
            .lock()
            .expect("worker pool lock poisoned")
            .push_back(self.id);
        self.pool.released.notify_waiters();
    }
}

impl WorkerPool {
    /// Builds `workers_per_source` workers for every enabled source that has a
    /// registered provider, up to `max_workers` in total.
    pub fn initialize(
        sources: &[SourceConfig],
        registry: &ProviderRegistry,
        engine: &EngineConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut workers: Vec<Arc<DataSourceWorker>> = Vec::new();
        let mut by_source: HashMap<String, Vec<WorkerId>> = HashMap::new();

        'sources: for source in sources.iter().filter(|s| s.enabled) {
            if by_source.contains_key(&source.name) {
                warn!("Source {} configured twice, ignoring the duplicate", source.name);
                continue;
            }

            let mut config = source.clone();
            config.connection_pool.max_connections = config
                .connection_pool
                .max_connections
                .min(engine.max_total_connections.max(1));
            let config = Arc::new(config);

            let Some(fetcher) = registry.build(&config) else {
                warn!(
                    registered = ?registry.names(),
                    "No provider registered for source {}, skipping",
                    source.name
                );
                continue;
            };

            for _ in 0..engine.workers_per_source.max(1) {
                if workers.len() >= engine.max_workers {
                    warn!(
                        "Worker limit {} reached, not creating further workers (next source: {})",
                        engine.max_workers, source.name
                    );
                    break 'sources;
                }

                let id = WorkerId(workers.len());
                let worker = DataSourceWorker::new(id, Arc::clone(&config), Arc::clone(&fetcher), cancel.clone())?;
                workers.push(Arc::new(worker));
                by_source.entry(config.name.clone()).or_default().push(id);
            }
        }

        info!(
            workers = workers.len(),
            sources = by_source.len(),
            "Worker pool initialized"
        );

        let available = workers.iter().map(|w| w.id()).collect();
        Ok(WorkerPool {
            workers,
            by_source,
            available: Mutex::new(available),
            released: Notify::new(),
            acquire_timeout: engine.worker_acquire_timeout(),
        })
    }

    pub fn has_source(&self, source_name: &str) -> bool {
        self.by_source.contains_key(source_name)
    }

    pub fn sources(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.by_source.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().expect("worker pool lock poisoned").len()
    }

    fn try_take(&self, source_name: &str) -> Option<WorkerId> {
        let mut available = self.available.lock().expect("worker pool lock poisoned");
        let pos = available
            .iter()
            .position(|id| self.workers[id.0].source_name() == source_name)?;
        available.remove(pos)
    }

    async fn acquire(&self, source_name: &str) -> Result<WorkerLease<'_>> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            // Register for the wake-up before looking, so a release between
            // the look and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_take(source_name) {
                return Ok(WorkerLease { pool: self, id });
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::NoAvailableWorker {
                    source_name: source_name.to_string(),
                    waited_ms: self.acquire_timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Routes one request to an idle worker of `source_name`.
    pub async fn fetch_data(&self, source_name: &str, params: &FetchParams) -> Result<Value> {
        if !self.has_source(source_name) {
            return Err(Error::UnknownSource(source_name.to_string()));
        }

        let lease = self.acquire(source_name).await?;
        debug!(source = source_name, worker = %lease.id, "Worker acquired");

        let result = lease.worker().fetch(params).await;
        drop(lease);

        result.map_err(Error::Fetch)
    }

    /// Workers whose circuit is not closed.
    pub fn health(&self) -> Vec<WorkerHealth> {
        self.workers
            .iter()
            .filter(|w| w.health() != CircuitState::Healthy)
            .map(|w| WorkerHealth {
                worker_id: w.id(),
                source: w.source_name().to_string(),
                state: w.health(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            total_workers: self.workers.len(),
            available_workers: self.available_count(),
            workers: self.workers.iter().map(|w| w.snapshot()).collect(),
        }
    }

    pub fn close_all(&self) {
        for worker in &self.workers {
            worker.close();
        }
        info!("Closed {} workers", self.workers.len());
    }
}
