pub mod buffer;
pub mod ingestion;
pub mod metrics;

pub use buffer::ResultBuffer;
pub use ingestion::IngestionEngine;
pub use metrics::{EngineMetrics, IngestionMetrics, MetricsSnapshot, SlaReport};
