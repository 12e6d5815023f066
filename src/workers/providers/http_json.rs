use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::http::ConnectionPoolManager;
use crate::types::FetchParams;
use crate::workers::SourceFetcher;

const RESERVED_PARAMS: [&str; 3] = ["path", "auth", "symbol_param"];

#[derive(Clone, Debug, PartialEq)]
enum AuthStyle {
    None,
    Bearer,
    Header(String),
    Query(String),
}

/// Generic REST/JSON provider driven entirely by `SourceConfig.params`:
///
/// - `path`: appended to `base_url`; `{symbol}` and `{data_type}` are substituted
/// - `auth`: `bearer`, `header:<name>` or `query:<param>`
/// - `symbol_param`: query parameter carrying the symbol when the path does
///   not (default `symbol`)
/// - any other key: a fixed query parameter sent on every request
pub struct HttpJsonProvider {
    path: String,
    auth: AuthStyle,
    symbol_param: String,
    static_query: Vec<(String, String)>,
}

impl HttpJsonProvider {
    pub fn from_config(config: &SourceConfig) -> Self {
        let auth = match config.params.get("auth").map(String::as_str) {
            Some("bearer") => AuthStyle::Bearer,
            Some(other) => {
                if let Some(name) = other.strip_prefix("header:") {
                    AuthStyle::Header(name.to_string())
                } else if let Some(name) = other.strip_prefix("query:") {
                    AuthStyle::Query(name.to_string())
                } else {
                    tracing::warn!(source = %config.name, "Unknown auth style {}, sending no credentials", other);
                    AuthStyle::None
                }
            }
            None => AuthStyle::None,
        };

        let mut static_query: Vec<(String, String)> = config
            .params
            .iter()
            .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        static_query.sort();

        HttpJsonProvider {
            path: config.params.get("path").cloned().unwrap_or_default(),
            auth,
            symbol_param: config
                .params
                .get("symbol_param")
                .cloned()
                .unwrap_or_else(|| "symbol".to_string()),
            static_query,
        }
    }

    fn url(&self, base_url: &str, params: &FetchParams) -> String {
        let path = self
            .path
            .replace("{symbol}", params.symbol.as_deref().unwrap_or_default())
            .replace("{data_type}", params.data_type.as_deref().unwrap_or_default());
        let base = base_url.trim_end_matches('/');
        match path.trim_start_matches('/') {
            "" => base.to_string(),
            p => format!("{}/{}", base, p),
        }
    }

    fn query(&self, params: &FetchParams, api_key: Option<&str>) -> Vec<(String, String)> {
        let mut query = self.static_query.clone();
        if let Some(symbol) = &params.symbol {
            if !self.path.contains("{symbol}") {
                query.push((self.symbol_param.clone(), symbol.clone()));
            }
        }
        query.extend(params.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let (AuthStyle::Query(name), Some(key)) = (&self.auth, api_key) {
            query.push((name.clone(), key.to_string()));
        }
        query
    }

    fn headers(&self, api_key: Option<&str>) -> Result<Option<HeaderMap>, FetchError> {
        let Some(key) = api_key else {
            return Ok(None);
        };

        let invalid = |_| FetchError::UnsupportedRequest("api key is not a valid header value".into());
        let mut headers = HeaderMap::new();
        match &self.auth {
            AuthStyle::Bearer => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            AuthStyle::Header(name) => {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| FetchError::UnsupportedRequest(format!("invalid header name {}", name)))?;
                let mut value = HeaderValue::from_str(key).map_err(invalid)?;
                value.set_sensitive(true);
                headers.insert(name, value);
            }
            AuthStyle::None | AuthStyle::Query(_) => return Ok(None),
        }
        Ok(Some(headers))
    }
}

#[async_trait]
impl SourceFetcher for HttpJsonProvider {
    async fn fetch_internal(
        &self,
        http: &ConnectionPoolManager,
        config: &SourceConfig,
        params: &FetchParams,
    ) -> Result<Value, FetchError> {
        let api_key = config.api_key.as_deref();
        let url = self.url(&config.base_url, params);
        let query = self.query(params, api_key);
        let headers = self.headers(api_key)?;

        http.get_json(&url, &query, headers).await
    }
}
