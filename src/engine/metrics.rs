use std::collections::VecDeque;
use serde::Serialize;
use tokio::time::Instant;
use crate::config::EngineConfig;
use crate::workers::PoolSnapshot;

/// Nearest-rank percentile of an ascending slice; 0 for an empty one.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Engine-wide counters plus a bounded latency window.
///
/// Percentiles and throughput are derived values: they only move when
/// [`recompute_percentiles`](Self::recompute_percentiles) or
/// [`update_throughput`](Self::update_throughput) run.
#[derive(Debug)]
pub struct IngestionMetrics {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    latencies_ms: VecDeque<f64>,
    window: usize,

    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,

    throughput_rps: f64,
    throughput_mark: Option<(Instant, u64)>,

    items_buffered: u64,
    items_dropped: u64,
    buffer_depth: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub latency_samples: usize,
    pub throughput_rps: f64,
    pub items_buffered: u64,
    pub items_dropped: u64,
    pub buffer_depth: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlaReport {
    pub p95_latency_ms: f64,
    pub p95_target_ms: f64,
    pub p95_met: bool,
    pub throughput_rps: f64,
    pub throughput_target: f64,
    pub throughput_met: bool,
}

/// What `IngestionEngine::get_metrics` returns.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub running: bool,
    pub engine: EngineMetrics,
    pub sla: SlaReport,
    pub pool: Option<PoolSnapshot>,
}

impl IngestionMetrics {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        IngestionMetrics {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            latencies_ms: VecDeque::with_capacity(window.min(16_384)),
            window,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            throughput_rps: 0.0,
            throughput_mark: None,
            items_buffered: 0,
            items_dropped: 0,
            buffer_depth: 0,
        }
    }

    pub fn record_request(&mut self, latency_ms: f64, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        if self.latencies_ms.len() == self.window {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    pub fn record_buffered(&mut self) {
        self.items_buffered += 1;
    }

    /// Mirrors the result buffer. `dropped` covers both stages: items refused
    /// by a full queue and items evicted from a full ready list.
    pub fn set_buffer_state(&mut self, depth: usize, dropped: u64) {
        self.buffer_depth = depth;
        self.items_dropped = dropped;
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// `successful / (successful + failed)`, or 0 before any request.
    pub fn success_rate(&self) -> f64 {
        match self.successful_requests + self.failed_requests {
            0 => 0.0,
            total => self.successful_requests as f64 / total as f64,
        }
    }

    pub fn recompute_percentiles(&mut self) {
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        self.p50_ms = percentile(&sorted, 50.0);
        self.p95_ms = percentile(&sorted, 95.0);
        self.p99_ms = percentile(&sorted, 99.0);
    }

    /// Requests completed per second since the previous call. The first call
    /// only sets the mark.
    pub fn update_throughput(&mut self, now: Instant) -> f64 {
        if let Some((at, count)) = self.throughput_mark {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                self.throughput_rps = (self.total_requests - count) as f64 / elapsed;
            }
        }
        self.throughput_mark = Some((now, self.total_requests));
        self.throughput_rps
    }

    /// An empty latency window counts as meeting the p95 target.
    pub fn sla(&self, config: &EngineConfig) -> SlaReport {
        SlaReport {
            p95_latency_ms: self.p95_ms,
            p95_target_ms: config.p95_latency_target_ms,
            p95_met: self.latencies_ms.is_empty() || self.p95_ms <= config.p95_latency_target_ms,
            throughput_rps: self.throughput_rps,
            throughput_target: config.throughput_target,
            throughput_met: self.throughput_rps >= config.throughput_target,
        }
    }

    pub fn snapshot(&self) -> EngineMetrics {
        EngineMetrics {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            success_rate: self.success_rate(),
            p50_latency_ms: self.p50_ms,
            p95_latency_ms: self.p95_ms,
            p99_latency_ms: self.p99_ms,
            latency_samples: self.latencies_ms.len(),
            throughput_rps: self.throughput_rps,
            items_buffered: self.items_buffered,
            items_dropped: self.items_dropped,
            buffer_depth: self.buffer_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_percentiles_of_ten_to_a_thousand() {
        let mut metrics = IngestionMetrics::new(10_000);
        for i in 1..=100 {
            metrics.record_request((i * 10) as f64, true);
        }
        metrics.recompute_percentiles();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.p50_latency_ms, 500.0);
        assert_eq!(snapshot.p95_latency_ms, 950.0);
        assert_eq!(snapshot.p99_latency_ms, 990.0);
        assert_eq!(snapshot.latency_samples, 100);
    }

    #[test]
    fn test_percentiles_ignore_insertion_order() {
        let mut metrics = IngestionMetrics::new(100);
        for i in (1..=100).rev() {
            metrics.record_request((i * 10) as f64, true);
        }
        metrics.recompute_percentiles();
        assert_eq!(metrics.snapshot().p95_latency_ms, 950.0);
    }

    #[test]
    fn test_success_rate() {
        let mut metrics = IngestionMetrics::new(10);
        assert_eq!(metrics.success_rate(), 0.0);

        metrics.record_request(1.0, true);
        metrics.record_request(1.0, true);
        metrics.record_request(1.0, true);
        metrics.record_request(1.0, false);
        assert_eq!(metrics.success_rate(), 0.75);
    }

    #[test]
    fn test_window_keeps_latest_samples() {
        let mut metrics = IngestionMetrics::new(3);
        for latency in [1000.0, 1.0, 2.0, 3.0] {
            metrics.record_request(latency, true);
        }
        metrics.recompute_percentiles();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.latency_samples, 3);
        assert_eq!(snapshot.p99_latency_ms, 3.0);
        assert_eq!(snapshot.total_requests, 4);
    }

    #[test]
    fn test_sla_report() {
        let config = EngineConfig {
            p95_latency_target_ms: 500.0,
            throughput_target: 2.0,
            ..EngineConfig::default()
        };
        let mut metrics = IngestionMetrics::new(100);
        let empty = metrics.sla(&config);
        assert!(empty.p95_met);
        assert!(!empty.throughput_met);

        for _ in 0..10 {
            metrics.record_request(800.0, true);
        }
        metrics.recompute_percentiles();
        assert!(!metrics.sla(&config).p95_met);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_between_marks() {
        let mut metrics = IngestionMetrics::new(100);
        assert_eq!(metrics.update_throughput(Instant::now()), 0.0);

        for _ in 0..50 {
            metrics.record_request(5.0, false);
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(metrics.update_throughput(Instant::now()), 5.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(metrics.update_throughput(Instant::now()), 0.0);
    }

    proptest! {
        #[test]
        fn prop_percentiles_are_ordered_samples(samples in prop::collection::vec(0.0f64..10_000.0, 1..500)) {
            let mut sorted = samples.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));

            let p50 = percentile(&sorted, 50.0);
            let p95 = percentile(&sorted, 95.0);
            let p99 = percentile(&sorted, 99.0);
            prop_assert!(p50 <= p95 && p95 <= p99);
            prop_assert!(samples.contains(&p95));
        }
    }
}
