//! Shard placement for sharded tables
//!
//! This module provides the schema types describing which node holds which
//! shard, and the pure algorithms that compute and repair those schemas.
//!
//! # Placement Strategy
//!
//! Placement is deterministic for a given node order:
//! 1. **Least loaded first**: every replica slot goes to a node with the
//!    lowest running shard count that does not already hold the shard
//! 2. **Rotating tie-break**: ties rotate with `(shard + slot)` so equal
//!    nodes take turns instead of the first one absorbing every shard
//!
//! # Example
//!
//! ```ignore
//! use shardline::placement::create_sharding_schema;
//!
//! let nodes = vec!["a:9308".to_string(), "b:9308".to_string()];
//! let schema = create_sharding_schema(&nodes, 4, 2)?;
//! assert_eq!(schema.replication_factor(), 2);
//! ```

mod algorithm;

pub use algorithm::{create_sharding_schema, rebalance_sharding_scheme, PlacementError};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One node's share of a sharded table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRow {
    /// Node id ("host:port")
    pub node: String,

    /// Shards held by this node
    pub shards: BTreeSet<u32>,

    /// Every node replicating any shard this node holds, itself included
    pub connections: BTreeSet<String>,
}

impl ShardRow {
    /// Create an empty row for a node
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            shards: BTreeSet::new(),
            connections: BTreeSet::new(),
        }
    }

    /// Create a row holding the given shards
    pub fn with_shards(node: impl Into<String>, shards: impl IntoIterator<Item = u32>) -> Self {
        Self {
            node: node.into(),
            shards: shards.into_iter().collect(),
            connections: BTreeSet::new(),
        }
    }
}

/// Shard-to-node assignment of one sharded table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingSchema {
    rows: Vec<ShardRow>,
}

impl ShardingSchema {
    /// Build a schema from rows, deriving connections from shared shards
    pub fn from_rows(rows: Vec<ShardRow>) -> Self {
        let mut schema = Self { rows };
        schema.refresh_connections();
        schema
    }

    /// Build a schema from rows, keeping connections exactly as given
    pub(crate) fn from_rows_raw(rows: Vec<ShardRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[ShardRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.shards.is_empty())
    }

    /// Get the row of a node
    pub fn row(&self, node: &str) -> Option<&ShardRow> {
        self.rows.iter().find(|row| row.node == node)
    }

    /// All nodes that appear in the schema
    pub fn nodes(&self) -> BTreeSet<String> {
        self.rows.iter().map(|row| row.node.clone()).collect()
    }

    /// All nodes holding at least one shard
    pub fn nodes_with_shards(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .filter(|row| !row.shards.is_empty())
            .map(|row| row.node.clone())
            .collect()
    }

    /// Union of every row's shards
    pub fn shards(&self) -> BTreeSet<u32> {
        self.rows
            .iter()
            .flat_map(|row| row.shards.iter().copied())
            .collect()
    }

    /// Number of shards of the table (highest shard id + 1)
    pub fn shard_count(&self) -> u32 {
        self.shards().iter().next_back().map(|max| max + 1).unwrap_or(0)
    }

    /// Nodes holding a given shard
    pub fn holders(&self, shard: u32) -> BTreeSet<String> {
        self.rows
            .iter()
            .filter(|row| row.shards.contains(&shard))
            .map(|row| row.node.clone())
            .collect()
    }

    /// Map of shard to the nodes holding it
    pub fn holders_by_shard(&self) -> BTreeMap<u32, BTreeSet<String>> {
        let mut map: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
        for row in &self.rows {
            for shard in &row.shards {
                map.entry(*shard).or_default().insert(row.node.clone());
            }
        }
        map
    }

    /// Highest number of copies any shard has
    pub fn replication_factor(&self) -> usize {
        self.holders_by_shard()
            .values()
            .map(BTreeSet::len)
            .max()
            .unwrap_or(0)
    }

    /// Recompute every row's connections from the shards it shares
    pub fn refresh_connections(&mut self) {
        let holders = self.holders_by_shard();
        for row in &mut self.rows {
            row.connections = row
                .shards
                .iter()
                .filter_map(|shard| holders.get(shard))
                .flat_map(|nodes| nodes.iter().cloned())
                .collect();
        }
    }
}
