use std::collections::HashMap;
use std::sync::Arc;
use crate::config::SourceConfig;
use crate::workers::SourceFetcher;
use crate::workers::providers::http_json::HttpJsonProvider;

pub type ProviderFactory = Arc<dyn Fn(&SourceConfig) -> Arc<dyn SourceFetcher> + Send + Sync>;

/// Source name → provider constructor, populated once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, source_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&SourceConfig) -> Arc<dyn SourceFetcher> + Send + Sync + 'static,
    {
        let name = source_name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!("Provider for {} registered twice, keeping the latest", name);
        }
        self
    }

    /// Registers the generic JSON provider under each name.
    pub fn with_http_json<I, S>(mut self, source_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in source_names {
            self.register(name, |config: &SourceConfig| -> Arc<dyn SourceFetcher> {
                Arc::new(HttpJsonProvider::from_config(config))
            });
        }
        self
    }

    pub fn build(&self, config: &SourceConfig) -> Option<Arc<dyn SourceFetcher>> {
        self.factories.get(&config.name).map(|factory| factory(config))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
