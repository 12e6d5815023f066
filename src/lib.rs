pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod observability;
pub mod resilience;
pub mod types;
pub mod utils;
pub mod workers;

pub use config::{AppConfig, EngineConfig, SourceConfig};
pub use engine::{IngestionEngine, MetricsSnapshot};
pub use error::{Error, FetchError, Result};
pub use types::{BufferItem, FetchParams, RequestSpec};
pub use workers::{ProviderRegistry, SourceFetcher};
