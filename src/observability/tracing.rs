use tracing::Span;
use tracing_subscriber::EnvFilter;
use crate::types::ids::RequestId;

pub fn trace_fetch(request_id: RequestId, source: &str, symbol: Option<&str>) -> Span {
    tracing::info_span!(
        "fetch",
        request_id = %request_id,
        source = %source,
        symbol = symbol.unwrap_or("-"),
    )
}

pub fn trace_batch(size: usize) -> Span {
    tracing::info_span!("fetch_batch", size)
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}
