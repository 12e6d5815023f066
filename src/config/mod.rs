pub mod engine;
pub mod loader;
pub mod source;

pub use engine::EngineConfig;
pub use loader::AppConfig;
pub use source::{CircuitBreakerConfig, ConnectionPoolConfig, RetryConfig, SourceConfig};
