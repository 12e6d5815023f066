use std::collections::HashSet;
use crate::config::source::MAX_DURATION_SECS;
use crate::config::{EngineConfig, SourceConfig};
use crate::error::{Error, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub sources: Vec<SourceConfig>,
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(Environment::with_prefix("INGEST").separator("__"))
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let mut app: AppConfig = config.try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        app.resolve_api_keys(|var| std::env::var(var).ok());
        app.validate()?;
        Ok(app)
    }

    /// Fills missing keys from `{NAME}_API_KEY`. Values stay opaque.
    pub fn resolve_api_keys<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for source in &mut self.sources {
            if source.api_key.is_none() {
                let var = format!("{}_API_KEY", source.name.to_uppercase().replace('-', "_"));
                source.api_key = lookup(&var).filter(|k| !k.is_empty());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.queue_size == 0 {
            return Err(Error::ConfigError("engine.queue_size must be >= 1".into()));
        }
        if engine.batch_size == 0 {
            return Err(Error::ConfigError("engine.batch_size must be >= 1".into()));
        }
        if engine.max_workers == 0 || engine.workers_per_source == 0 {
            return Err(Error::ConfigError("engine worker counts must be >= 1".into()));
        }
        for (key, value) in engine.duration_settings() {
            check_duration("engine", key, value)?;
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(Error::ConfigError("source name must not be empty".into()));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(Error::ConfigError(format!("duplicate source: {}", source.name)));
            }
            if source.retry.max_attempts == 0 {
                return Err(Error::ConfigError(format!("{}: retry.max_attempts must be >= 1", source.name)));
            }
            if source.circuit_breaker.failure_threshold == 0 {
                return Err(Error::ConfigError(format!("{}: circuit_breaker.failure_threshold must be >= 1", source.name)));
            }
            if source.circuit_breaker.half_open_max_calls == 0 {
                return Err(Error::ConfigError(format!("{}: circuit_breaker.half_open_max_calls must be >= 1", source.name)));
            }
            if source.connection_pool.max_connections == 0 || source.connection_pool.limit_per_host == 0 {
                return Err(Error::ConfigError(format!("{}: connection limits must be >= 1", source.name)));
            }
            for (key, value) in source.duration_settings() {
                check_duration(&source.name, key, value)?;
            }
        }

        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn check_duration(scope: &str, key: &str, value: f64) -> Result<()> {
    if !(0.0..=MAX_DURATION_SECS).contains(&value) {
        return Err(Error::ConfigError(format!(
            "{}: {} must be between 0 and {} seconds, got {}",
            scope, key, MAX_DURATION_SECS, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_with(sources: Vec<SourceConfig>) -> AppConfig {
        AppConfig {
            engine: EngineConfig::default(),
            sources,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let app = app_with(vec![SourceConfig::new("binance", "https://api.binance.com")]);
        assert!(app.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let app = app_with(vec![
            SourceConfig::new("binance", "https://api.binance.com"),
            SourceConfig::new("binance", "https://api1.binance.com"),
        ]);
        assert!(matches!(app.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut source = SourceConfig::new("fred", "https://api.stlouisfed.org");
        source.retry.max_attempts = 0;
        assert!(app_with(vec![source]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_durations() {
        let mut source = SourceConfig::new("fred", "https://api.stlouisfed.org");
        source.circuit_breaker.recovery_timeout_secs = 1e20;
        assert!(matches!(app_with(vec![source]).validate(), Err(Error::ConfigError(msg)) if msg.contains("recovery_timeout_secs")));

        let mut source = SourceConfig::new("fred", "https://api.stlouisfed.org");
        source.retry.base_delay_secs = f64::NAN;
        assert!(app_with(vec![source]).validate().is_err());

        let mut app = app_with(vec![]);
        app.engine.shutdown_timeout_secs = -1.0;
        assert!(app.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut app = app_with(vec![]);
        app.engine.queue_size = 0;
        assert!(app.validate().is_err());
    }

    #[test]
    fn test_resolve_api_keys_from_lookup() {
        let mut keyed = SourceConfig::new("news-api", "https://newsapi.org");
        keyed.api_key = None;
        let mut preset = SourceConfig::new("polygon", "https://api.polygon.io");
        preset.api_key = Some("from-file".into());
        let mut app = app_with(vec![keyed, preset]);

        app.resolve_api_keys(|var| match var {
            "NEWS_API_API_KEY" => Some("from-env".to_string()),
            "POLYGON_API_KEY" => Some("ignored".to_string()),
            _ => None,
        });

        assert_eq!(app.sources[0].api_key.as_deref(), Some("from-env"));
        assert_eq!(app.sources[1].api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_enabled_sources_filters() {
        let mut disabled = SourceConfig::new("coinbase", "https://api.coinbase.com");
        disabled.enabled = false;
        let app = app_with(vec![SourceConfig::new("kraken", "https://api.kraken.com"), disabled]);
        let names: Vec<_> = app.enabled_sources().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["kraken"]);
    }
}
