use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::types::ids::ItemId;

/// Parameters forwarded to a provider's fetch call.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FetchParams {
    pub symbol: Option<String>,
    pub data_type: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl FetchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One entry of a batch fetch.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RequestSpec {
    pub source: String,
    #[serde(flatten)]
    pub params: FetchParams,
}

impl RequestSpec {
    pub fn new(source: impl Into<String>, params: FetchParams) -> Self {
        RequestSpec {
            source: source.into(),
            params,
        }
    }
}

/// A successful fetch result awaiting the normalization layer.
#[derive(Clone, Debug, Serialize)]
pub struct BufferItem {
    pub id: ItemId,
    pub source: String,
    pub symbol: Option<String>,
    pub data_type: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: f64,
}

impl BufferItem {
    pub fn new(source: &str, params: &FetchParams, payload: Value, response_time_ms: f64) -> Self {
        BufferItem {
            id: ItemId::new(),
            source: source.to_string(),
            symbol: params.symbol.clone(),
            data_type: params.data_type.clone(),
            payload,
            timestamp: Utc::now(),
            response_time_ms,
        }
    }
}
