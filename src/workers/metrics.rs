use chrono::{DateTime, Utc};
use serde::Serialize;
use crate::http::ConnectionStats;
use crate::resilience::CircuitState;
use crate::types::WorkerId;

/// Per-worker counters, updated after every fetch attempt.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WorkerMetrics {
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub total_response_time_ms: f64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub circuit_breaker_trips: u64,
}

impl WorkerMetrics {
    pub fn record_success(&mut self, response_time_ms: f64) {
        self.requests_completed += 1;
        self.total_response_time_ms += response_time_ms;
        self.last_request_time = Some(Utc::now());
    }

    pub fn record_failure(&mut self, response_time_ms: f64, error: &str) {
        self.requests_failed += 1;
        self.total_response_time_ms += response_time_ms;
        self.last_request_time = Some(Utc::now());
        self.last_error = Some(error.to_string());
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_completed + self.requests_failed
    }

    /// `completed / (completed + failed)`, or 0 before any request.
    pub fn success_rate(&self) -> f64 {
        match self.total_requests() {
            0 => 0.0,
            total => self.requests_completed as f64 / total as f64,
        }
    }

    pub fn average_response_time_ms(&self) -> f64 {
        match self.total_requests() {
            0 => 0.0,
            total => self.total_response_time_ms / total as f64,
        }
    }
}

/// Read-only view of one worker for reporting.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub source: String,
    pub circuit_state: CircuitState,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub metrics: WorkerMetrics,
    pub connections: ConnectionStats,
}
