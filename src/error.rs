use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Fetch Errors
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    // Capacity Errors
    #[error("Unknown or disabled source: {0}")]
    UnknownSource(String),

    #[error("No available worker for source {source_name} within {waited_ms}ms")]
    NoAvailableWorker {
        source_name: String,
        waited_ms: u64,
    },

    #[error("Result buffer full, dropped item from {0}")]
    BufferFull(String),

    // Lifecycle Errors
    #[error("Ingestion engine is not running")]
    EngineNotRunning,

    #[error("Ingestion engine is already running")]
    EngineAlreadyRunning,

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    // Transport Errors
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure raised by a provider's fetch call.
///
/// The variant decides retry and circuit-breaker disposition; response bodies
/// are never inspected past this point.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Authentication failed (HTTP {status})")]
    Authentication { status: u16 },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Provider rate limit exceeded")]
    RateLimited,

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected HTTP status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Unexpected provider error: {0}")]
    Unexpected(String),

    #[error("Circuit open for source {source_name}")]
    CircuitOpen { source_name: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unsupported request: {0}")]
    UnsupportedRequest(String),
}

/// Flat classification of [`FetchError`], used as a metrics label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Client,
    Transient,
    CircuitOpen,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Client => "client",
            ErrorKind::Transient => "transient",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl FetchError {
    /// Auth, not-found and synthetic errors are final; everything else may
    /// succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FetchError::Authentication { .. }
                | FetchError::NotFound(_)
                | FetchError::CircuitOpen { .. }
                | FetchError::Cancelled
                | FetchError::UnsupportedRequest(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Authentication { .. }
            | FetchError::NotFound(_)
            | FetchError::UnsupportedRequest(_) => ErrorKind::Client,
            FetchError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            FetchError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Transient,
        }
    }

    /// Maps a non-2xx HTTP status to its typed error.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => FetchError::Authentication { status },
            404 => FetchError::NotFound(body),
            429 => FetchError::RateLimited,
            _ => FetchError::Http { status, body },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::from_status(status.as_u16(), e.to_string())
        } else if e.is_connect() || e.is_request() || e.is_body() {
            FetchError::Network(e.to_string())
        } else {
            FetchError::Unexpected(e.to_string())
        }
    }
}
