//! Durable key/value state shared by every coordinator
//!
//! Values are JSON documents stored in one engine table. Each key maps to a
//! stable document id, so [`State::set`] is a single `REPLACE` and concurrent
//! writers resolve as last-writer-wins.

use crate::client::{row_json, row_string, row_u64, SqlClient};
use crate::cluster::Cluster;
use crate::error::{Result, ShardingError};
use crate::sql::{quote_identifier, quote_string};
use crate::time::now_millis;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

const LIST_LIMIT: usize = 10_000;

/// One stored key with its value
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    /// Unix milliseconds of the last write
    pub updated_at: u64,
}

/// Fallback for keys that were never written
fn default_value(key: &str) -> Value {
    match key {
        "cluster" | "cluster_hash" | "master" => Value::String(String::new()),
        _ => Value::Null,
    }
}

/// Stable positive document id of a key
pub fn state_id(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let id = u64::from_be_bytes(bytes) & 0x7fff_ffff_ffff_ffff;
    id.max(1)
}

pub struct State {
    client: Arc<dyn SqlClient>,
    cluster: Arc<Cluster>,
    table: String,
}

impl State {
    pub fn new(
        client: Arc<dyn SqlClient>,
        cluster: Arc<Cluster>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cluster,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Write a value. Null values are rejected.
    pub async fn set(&self, key: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            return Err(ShardingError::InvalidOptions(format!(
                "state value for '{}' must not be null",
                key
            )));
        }

        let query = format!(
            "REPLACE INTO {} (id, `key`, value, updated_at) VALUES ({}, {}, {}, {})",
            self.cluster.table_ref(&self.table),
            state_id(key),
            quote_string(key),
            quote_string(&value.to_string()),
            now_millis()
        );
        self.client.send_request(&query).await?;
        debug!(key = key, "State updated");
        Ok(())
    }

    /// Fetch a value, falling back to the key's default
    pub async fn get(&self, key: &str) -> Result<Value> {
        let query = format!(
            "SELECT value FROM {} WHERE id = {} LIMIT 1",
            quote_identifier(&self.table),
            state_id(key)
        );
        let response = self.client.send_request(&query).await?;
        Ok(response
            .first()
            .and_then(|row| row_json(row, "value"))
            .filter(|value| !value.is_null())
            .unwrap_or_else(|| default_value(key)))
    }

    /// Fetch a string value; non-string values yield their JSON text
    pub async fn get_string(&self, key: &str) -> Result<String> {
        Ok(match self.get(key).await? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    /// Fetch and decode a typed value; `None` when unset
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Value::Null => Ok(None),
            value => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// Encode and write a typed value
    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, &value).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let query = format!(
            "DELETE FROM {} WHERE id = {}",
            self.cluster.table_ref(&self.table),
            state_id(key)
        );
        self.client.send_request(&query).await?;
        Ok(())
    }

    /// All entries whose key matches a regular expression, evaluated by the engine
    pub async fn list_regex(&self, pattern: &str) -> Result<Vec<StateEntry>> {
        let query = format!(
            "SELECT `key`, value, updated_at FROM {} WHERE REGEX(`key`, {}) LIMIT {}",
            quote_identifier(&self.table),
            quote_string(pattern),
            LIST_LIMIT
        );
        let response = self.client.send_request(&query).await?;
        let mut entries: Vec<StateEntry> = response
            .data
            .iter()
            .map(|row| StateEntry {
                key: row_string(row, "key"),
                value: row_json(row, "value").unwrap_or(Value::Null),
                updated_at: row_u64(row, "updated_at"),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Decode every entry under a key prefix, skipping entries that fail to decode
    pub async fn list_prefixed<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>> {
        let pattern = format!("^{}.+", regex::escape(prefix));
        Ok(self
            .list_regex(&pattern)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let name = entry.key.strip_prefix(prefix)?.to_string();
                serde_json::from_value(entry.value).ok().map(|v| (name, v))
            })
            .collect())
    }

    /// Create the backing table and attach it to the bound cluster
    pub async fn setup(&self) -> Result<()> {
        if self.is_active().await? {
            return Err(ShardingError::AlreadyInitialized(self.table.clone()));
        }

        let query = format!(
            "CREATE TABLE {} (`key` string, value json, updated_at bigint)",
            quote_identifier(&self.table)
        );
        self.client.send_request(&query).await?;
        self.cluster.attach_local(self.client.as_ref(), &self.table).await?;

        info!(table = %self.table, cluster = %self.cluster.name(), "State table created");
        Ok(())
    }

    /// Whether the backing table exists
    pub async fn is_active(&self) -> Result<bool> {
        self.client.has_table(&self.table).await
    }
}
