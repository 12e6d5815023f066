use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Immutable per-provider settings. Built once at startup, never mutated after
/// the worker that owns it is constructed.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    pub base_url: String,
    pub enabled: bool,

    // 0 disables the corresponding window
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,

    pub connect_timeout_secs: f64,
    pub read_timeout_secs: f64,
    pub total_timeout_secs: f64,

    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub connection_pool: ConnectionPoolConfig,

    /// Empty means any symbol is accepted.
    pub symbols: Vec<String>,
    /// Empty means any data type is accepted.
    pub data_types: Vec<String>,
    pub params: HashMap<String, String>,

    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            name: String::new(),
            base_url: String::new(),
            enabled: true,
            requests_per_second: 0,
            requests_per_minute: 60,
            requests_per_hour: 0,
            connect_timeout_secs: 5.0,
            read_timeout_secs: 30.0,
            total_timeout_secs: 30.0,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            connection_pool: ConnectionPoolConfig::default(),
            symbols: Vec::new(),
            data_types: Vec::new(),
            params: HashMap::new(),
            api_key: None,
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("enabled", &self.enabled)
            .field("requests_per_second", &self.requests_per_second)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("requests_per_hour", &self.requests_per_hour)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("connection_pool", &self.connection_pool)
            .field("symbols", &self.symbols)
            .field("data_types", &self.data_types)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        SourceConfig {
            name: name.into(),
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn supports_symbol(&self, symbol: &str) -> bool {
        self.symbols.is_empty() || self.symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol))
    }

    pub fn supports_data_type(&self, data_type: &str) -> bool {
        self.data_types.is_empty() || self.data_types.iter().any(|d| d == data_type)
    }

    /// Pool settings with the source's own timeouts folded in. The tighter
    /// bound wins; reads have no separate knob on the client, so the read
    /// timeout caps the total.
    pub fn effective_pool_config(&self) -> ConnectionPoolConfig {
        let mut pool = self.connection_pool.clone();
        pool.connect_timeout_secs = pool.connect_timeout_secs.min(self.connect_timeout_secs);
        pool.total_timeout_secs = pool
            .total_timeout_secs
            .min(self.total_timeout_secs)
            .min(self.read_timeout_secs);
        pool
    }

    /// (limit, window) pairs for every enabled rate cap.
    pub fn rate_windows(&self) -> Vec<(u32, Duration)> {
        [
            (self.requests_per_second, Duration::from_secs(1)),
            (self.requests_per_minute, Duration::from_secs(60)),
            (self.requests_per_hour, Duration::from_secs(3600)),
        ]
        .into_iter()
        .filter(|(limit, _)| *limit > 0)
        .collect()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        secs(self.max_delay_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        secs(self.recovery_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub max_connections: usize,
    pub limit_per_host: usize,
    pub keepalive_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    pub total_timeout_secs: f64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        ConnectionPoolConfig {
            max_connections: 100,
            limit_per_host: 30,
            keepalive_timeout_secs: 30.0,
            connect_timeout_secs: 10.0,
            total_timeout_secs: 30.0,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn keepalive_timeout(&self) -> Duration {
        secs(self.keepalive_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        secs(self.total_timeout_secs)
    }
}

/// Longest duration any setting may hold: one year.
pub const MAX_DURATION_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Seconds to `Duration`, clamped into `[0, MAX_DURATION_SECS]`. NaN is zero.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_DURATION_SECS)).unwrap_or(Duration::ZERO)
}

impl SourceConfig {
    /// Every duration setting of the source, by config key.
    pub fn duration_settings(&self) -> [(&'static str, f64); 8] {
        [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
            ("total_timeout_secs", self.total_timeout_secs),
            ("retry.base_delay_secs", self.retry.base_delay_secs),
            ("retry.max_delay_secs", self.retry.max_delay_secs),
            ("circuit_breaker.recovery_timeout_secs", self.circuit_breaker.recovery_timeout_secs),
            ("connection_pool.keepalive_timeout_secs", self.connection_pool.keepalive_timeout_secs),
            ("connection_pool.total_timeout_secs", self.connection_pool.total_timeout_secs),
        ]
    }
}
