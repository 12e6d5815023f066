use std::time::Duration;

/// Fractional milliseconds, the unit every latency figure is reported in.
pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Alert operations team (critical)
pub fn alert_operations_team_critical(message: String) {
    tracing::error!(alert = "critical", "CRITICAL ALERT: {}", message);
}

/// Alert operations team (warning)
///
/// SLA misses land here. They are observability signals only and never fail
/// the request that produced them.
pub fn alert_operations_team_warning(message: String) {
    tracing::warn!(alert = "warning", "WARNING ALERT: {}", message);
}
