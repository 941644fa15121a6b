//! SQL client seam to the search engine
//!
//! Every State/Queue/Table/Cluster call goes through [`SqlClient`]. The
//! production implementation talks to the engine's HTTP SQL endpoint in raw
//! mode; tests substitute a scripted client.

use crate::config::EngineConfig;
use crate::error::{Result, ShardingError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// A single result row keyed by column name
pub type Row = Map<String, Value>;

/// Decoded response of one statement
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    /// Result rows (empty for DDL/DML)
    pub data: Vec<Row>,

    /// Rows matched by a SELECT or affected by a write
    pub total: u64,

    /// Non-fatal warning reported by the engine
    pub warning: Option<String>,
}

impl QueryResponse {
    /// Response carrying rows
    pub fn with_rows(data: Vec<Row>) -> Self {
        let total = data.len() as u64;
        Self {
            data,
            total,
            warning: None,
        }
    }

    /// Response of a write affecting `total` rows
    pub fn affected(total: u64) -> Self {
        Self {
            data: Vec::new(),
            total,
            warning: None,
        }
    }

    /// First row, if any
    pub fn first(&self) -> Option<&Row> {
        self.data.first()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Client used to send hand-built SQL to the local engine
#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Execute one statement. Engine-reported errors become `ShardingError::Query`.
    async fn send_request(&self, query: &str) -> Result<QueryResponse>;

    /// Whether a table exists on the local engine
    async fn has_table(&self, table: &str) -> Result<bool> {
        let query = format!(
            "SHOW TABLES LIKE {}",
            crate::sql::quote_string(table)
        );
        let response = self.send_request(&query).await?;
        Ok(response.data.iter().any(|row| {
            row.get("Table")
                .or_else(|| row.get("Index"))
                .and_then(Value::as_str)
                .map(|name| name == table)
                .unwrap_or(false)
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RawResultSet {
    #[serde(default)]
    data: Vec<Row>,
    #[serde(default)]
    total: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warning: Option<String>,
}

/// HTTP client for the engine's `/sql?mode=raw` endpoint
pub struct HttpSqlClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSqlClient {
    /// Create a new client from engine configuration
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/sql?mode=raw", self.base_url)
    }
}

#[async_trait]
impl SqlClient for HttpSqlClient {
    async fn send_request(&self, query: &str) -> Result<QueryResponse> {
        debug!(query = query, "Sending request to engine");

        let response = self
            .http
            .post(self.endpoint())
            .form(&[("query", query)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        match decode_raw_response(&body) {
            Ok(result) => Ok(result),
            Err(ShardingError::Serialization(_)) if !status.is_success() => {
                Err(ShardingError::Query(format!(
                    "HTTP {}: {}",
                    status,
                    body.chars().take(512).collect::<String>()
                )))
            }
            Err(e) => Err(e),
        }
    }
}

/// Decode a raw-mode body: an array of result sets (or a single object)
pub fn decode_raw_response(body: &str) -> Result<QueryResponse> {
    let value: Value = serde_json::from_str(body)?;
    let sets: Vec<RawResultSet> = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };

    let mut response = QueryResponse::default();
    for set in sets {
        if let Some(error) = set.error.filter(|e| !e.is_empty()) {
            return Err(ShardingError::Query(error));
        }
        response.total = set.total.as_ref().map(value_as_u64).unwrap_or(0);
        response.warning = set.warning.filter(|w| !w.is_empty());
        response.data.extend(set.data);
    }
    Ok(response)
}

/// Read an unsigned integer from a JSON value that may arrive as a string
pub fn value_as_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .or_else(|| n.as_f64().map(|v| v.max(0.0) as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        Value::Bool(b) => u64::from(*b),
        _ => 0,
    }
}

/// Read a column as u64, defaulting to 0
pub fn row_u64(row: &Row, column: &str) -> u64 {
    row.get(column).map(value_as_u64).unwrap_or(0)
}

/// Read a column as an owned string, defaulting to empty
pub fn row_string(row: &Row, column: &str) -> String {
    match row.get(column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Read a JSON column that the engine may return either as an object or as text
pub fn row_json(row: &Row, column: &str) -> Option<Value> {
    match row.get(column)? {
        Value::String(s) => serde_json::from_str(s).ok(),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_select() {
        let body = r#"[{"columns":[{"id":{"type":"long long"}}],"data":[{"id":1},{"id":2}],"total":2,"error":"","warning":""}]"#;
        let response = decode_raw_response(body).unwrap();
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.total, 2);
        assert!(response.warning.is_none());
    }

    #[test]
    fn test_decode_write() {
        let response = decode_raw_response(r#"[{"total":1,"error":"","warning":""}]"#).unwrap();
        assert!(response.is_empty());
        assert_eq!(response.total, 1);
    }

    #[test]
    fn test_decode_error() {
        let result = decode_raw_response(r#"[{"total":0,"error":"table t already exists","warning":""}]"#);
        assert!(matches!(result, Err(ShardingError::Query(msg)) if msg.contains("already exists")));
    }

    #[test]
    fn test_row_helpers() {
        let row: Row = serde_json::from_value(json!({
            "id": "42",
            "tries": 3,
            "value": "{\"a\":1}",
            "status": "created"
        }))
        .unwrap();

        assert_eq!(row_u64(&row, "id"), 42);
        assert_eq!(row_u64(&row, "tries"), 3);
        assert_eq!(row_u64(&row, "missing"), 0);
        assert_eq!(row_string(&row, "status"), "created");
        assert_eq!(row_json(&row, "value"), Some(json!({"a": 1})));
    }
}
