use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use crate::config::ConnectionPoolConfig;
use crate::error::{Error, FetchError, Result};
use crate::observability::metrics::ACTIVE_CONNECTIONS;

/// A fully-read HTTP response. Permits are released once the body is in
/// memory, so holding one of these does not pin a connection.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts non-2xx into the matching [`FetchError`].
    pub fn error_for_status(self) -> std::result::Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::from_status(self.status, self.body))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, FetchError> {
        serde_json::from_str(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub available_permits: usize,
    pub total_requests: u64,
    pub errors: u64,
}

/// Bounded HTTP connection pool for a single worker.
///
/// `reqwest` owns keep-alive and idle recycling; the semaphores bound how
/// many requests may be outstanding in total and per host.
pub struct ConnectionPoolManager {
    source_name: String,
    config: ConnectionPoolConfig,
    client: RwLock<Option<Client>>,
    total_permits: Arc<Semaphore>,
    host_permits: DashMap<String, Arc<Semaphore>>,
    active_connections: AtomicUsize,
    total_requests: AtomicU64,
    errors: AtomicU64,
}

struct ActiveGuard<'a> {
    pool: &'a ConnectionPoolManager,
}

impl<'a> ActiveGuard<'a> {
    fn enter(pool: &'a ConnectionPoolManager) -> Self {
        pool.active_connections.fetch_add(1, Ordering::SeqCst);
        ACTIVE_CONNECTIONS.with_label_values(&[&pool.source_name]).inc();
        ActiveGuard { pool }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.pool.active_connections.fetch_sub(1, Ordering::SeqCst);
        ACTIVE_CONNECTIONS.with_label_values(&[&self.pool.source_name]).dec();
    }
}

impl ConnectionPoolManager {
    pub fn new(source_name: impl Into<String>, config: ConnectionPoolConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        ConnectionPoolManager {
            source_name: source_name.into(),
            total_permits: Arc::new(Semaphore::new(max_connections)),
            config,
            client: RwLock::new(None),
            host_permits: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Builds the underlying client. Calling it on an initialized pool is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.client.write().expect("connection pool lock poisoned");
        if slot.is_some() {
            return Ok(());
        }

        let client = Client::builder()
            .pool_max_idle_per_host(self.config.limit_per_host)
            .pool_idle_timeout(self.config.keepalive_timeout())
            .connect_timeout(self.config.connect_timeout())
            .tcp_keepalive(self.config.keepalive_timeout())
            .user_agent(concat!("ingest-infra/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpClient)?;

        *slot = Some(client);
        tracing::debug!(
            source = %self.source_name,
            max_connections = self.config.max_connections,
            limit_per_host = self.config.limit_per_host,
            "Connection pool initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.client.read().expect("connection pool lock poisoned").is_some()
    }

    /// Drops the client, releasing every pooled connection. Later requests fail
    /// until [`initialize`](Self::initialize) is called again.
    pub fn close(&self) {
        let previous = self.client.write().expect("connection pool lock poisoned").take();
        self.host_permits.clear();
        if previous.is_some() {
            tracing::debug!(source = %self.source_name, "Connection pool closed");
        }
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        headers: Option<HeaderMap>,
    ) -> std::result::Result<HttpResponse, FetchError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let result = self.execute(method, url, query, headers).await;
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// GET that requires a 2xx and decodes the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: Option<HeaderMap>,
    ) -> std::result::Result<T, FetchError> {
        let response = self.request(Method::GET, url, query, headers).await?;
        match response.error_for_status() {
            Ok(response) => response.json(),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Waiting for permits and the request itself share one `total_timeout`
    /// deadline.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        headers: Option<HeaderMap>,
    ) -> std::result::Result<HttpResponse, FetchError> {
        let client = self
            .client
            .read()
            .expect("connection pool lock poisoned")
            .clone()
            .ok_or_else(|| FetchError::Network(format!("connection pool for {} is closed", self.source_name)))?;

        let parsed = Url::parse(url)
            .map_err(|e| FetchError::UnsupportedRequest(format!("invalid url {}: {}", url, e)))?;

        let deadline = Instant::now() + self.config.total_timeout();
        let _permits = tokio::time::timeout_at(deadline, self.acquire_permits(&parsed))
            .await
            .map_err(|_| FetchError::Timeout)??;
        let _active = ActiveGuard::enter(self);

        let mut req = client.request(method, parsed);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(h) = headers {
            req = req.headers(h);
        }

        tokio::time::timeout_at(deadline, async {
            let response = req.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.text().await?;
            Ok::<_, FetchError>(HttpResponse { status, headers, body })
        })
        .await
        .map_err(|_| FetchError::Timeout)?
    }

    async fn acquire_permits(
        &self,
        url: &Url,
    ) -> std::result::Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let host_key = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        );
        let host = self
            .host_permits
            .entry(host_key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.limit_per_host.max(1))))
            .clone();

        let total = Arc::clone(&self.total_permits)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Network("connection pool shut down".into()))?;
        let per_host = host
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Network("connection pool shut down".into()))?;

        Ok((total, per_host))
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.active_connections.load(Ordering::SeqCst),
            available_permits: self.total_permits.available_permits(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
