//! Structured records persisted in State
//!
//! Keys:
//! - `table:<name>` holds a [`TableRecord`]
//! - `rebalance:<name>` holds a [`RebalanceRecord`]
//! - `node:<id>` holds a [`crate::node::NodeRecord`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TABLE_PREFIX: &str = "table:";
pub const REBALANCE_PREFIX: &str = "rebalance:";

/// State key of a table progress record
pub fn table_key(name: &str) -> String {
    format!("{}{}", TABLE_PREFIX, name)
}

/// State key of a rebalance record
pub fn rebalance_key(name: &str) -> String {
    format!("{}{}", REBALANCE_PREFIX, name)
}

/// Kind of sharding operation tracked by a table record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Drop,
    Rebalance,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Drop => "drop",
            OperationType::Rebalance => "rebalance",
        }
    }
}

/// Progress of a sharding operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Processing,
    Done,
}

/// Progress record of a sharded table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    #[serde(default)]
    pub cluster: String,
    pub name: String,
    #[serde(default)]
    pub structure: String,
    #[serde(default)]
    pub extra: String,
    pub shards: u32,
    pub rf: usize,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub status: OperationStatus,
    #[serde(default)]
    pub queue_ids: Vec<u64>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub updated_at: u64,
}

impl TableRecord {
    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }

    /// Whether the table is currently sharded (created and not dropped)
    pub fn is_live(&self) -> bool {
        self.kind != OperationType::Drop
    }
}

/// Lifecycle of a table rebalance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl RebalanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceStatus::Idle => "idle",
            RebalanceStatus::Running => "running",
            RebalanceStatus::Completed => "completed",
            RebalanceStatus::Failed => "failed",
        }
    }
}

/// Rebalance progress of one table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    #[serde(default)]
    pub status: RebalanceStatus,
    /// Unix seconds
    #[serde(default)]
    pub started_at: u64,
    /// Unix seconds
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub queue_ids: Vec<u64>,
    #[serde(default)]
    pub operation_group: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_record_wire_format() {
        let record = TableRecord {
            cluster: "main".into(),
            name: "products".into(),
            structure: "title text".into(),
            extra: String::new(),
            shards: 4,
            rf: 2,
            kind: OperationType::Create,
            status: OperationStatus::Processing,
            queue_ids: vec![1, 2],
            result: Value::Null,
            updated_at: 10,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], json!("create"));
        assert_eq!(value["status"], json!("processing"));

        let back: TableRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
        assert!(back.is_live());
        assert!(!back.is_done());
    }

    #[test]
    fn test_rebalance_record_defaults() {
        let record: RebalanceRecord = serde_json::from_value(json!({})).unwrap();
        assert_eq!(record.status, RebalanceStatus::Idle);
        assert!(record.queue_ids.is_empty());
    }

    #[test]
    fn test_keys() {
        assert_eq!(table_key("t"), "table:t");
        assert_eq!(rebalance_key("t"), "rebalance:t");
    }
}
