use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::config::source::secs;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub workers_per_source: usize,
    pub queue_size: usize,
    pub batch_size: usize,

    // SLA targets
    pub p95_latency_target_ms: f64,
    pub throughput_target: f64,  // completed requests per second

    /// Upper bound applied to every worker's pool `max_connections`.
    pub max_total_connections: usize,

    pub latency_window: usize,
    pub worker_acquire_timeout_ms: u64,
    pub queue_poll_interval_ms: u64,
    pub metrics_interval_secs: f64,
    pub monitor_interval_secs: f64,
    pub shutdown_timeout_secs: f64,

    pub metrics_addr: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_workers: 50,
            workers_per_source: 1,
            queue_size: 10_000,
            batch_size: 100,
            p95_latency_target_ms: 500.0,
            throughput_target: 100.0,
            max_total_connections: 200,
            latency_window: 10_000,
            worker_acquire_timeout_ms: 1_000,
            queue_poll_interval_ms: 100,
            metrics_interval_secs: 10.0,
            monitor_interval_secs: 30.0,
            shutdown_timeout_secs: 10.0,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    pub fn worker_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_acquire_timeout_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms.max(1))
    }

    pub fn metrics_interval(&self) -> Duration {
        secs(self.metrics_interval_secs.max(0.001))
    }

    pub fn monitor_interval(&self) -> Duration {
        secs(self.monitor_interval_secs.max(0.001))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }

    /// Every duration setting of the engine, by config key.
    pub fn duration_settings(&self) -> [(&'static str, f64); 3] {
        [
            ("metrics_interval_secs", self.metrics_interval_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
        ]
    }
}
