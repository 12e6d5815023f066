pub mod metrics;
pub mod pool;
pub mod providers;
pub mod registry;
pub mod worker;

use async_trait::async_trait;
use serde_json::Value;
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::http::ConnectionPoolManager;
use crate::types::FetchParams;

pub use metrics::{WorkerMetrics, WorkerSnapshot};
pub use pool::{PoolSnapshot, WorkerPool};
pub use registry::ProviderRegistry;
pub use worker::DataSourceWorker;

/// The wire-specific half of a provider.
///
/// One call performs exactly one logical request through the worker's pool
/// and returns a typed error for anything other than a usable 2xx response.
/// Rate limiting, retries and circuit breaking are applied around it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_internal(
        &self,
        http: &ConnectionPoolManager,
        config: &SourceConfig,
        params: &FetchParams,
    ) -> Result<Value, FetchError>;
}
