//! Shard placement algorithms
//!
//! Implements deterministic placement and repair:
//! 1. `create_sharding_schema` spreads `shards × rf` replica slots evenly
//! 2. `rebalance_sharding_scheme` repairs a schema after topology changes

use super::{ShardRow, ShardingSchema};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors that can occur during placement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("Not enough nodes available: need {needed}, have {available}")]
    InsufficientNodes { needed: usize, available: usize },

    #[error("Replication factor must be at least 1")]
    InvalidReplicationFactor,
}

impl From<PlacementError> for crate::error::ShardingError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::InsufficientNodes { needed, available } => {
                crate::error::ShardingError::InsufficientNodes { needed, available }
            }
            PlacementError::InvalidReplicationFactor => {
                crate::error::ShardingError::InvalidOptions(err.to_string())
            }
        }
    }
}

/// Compute a fresh schema placing `shard_count` shards with `rf` copies each
///
/// # Arguments
/// * `nodes` - Candidate nodes; their order drives the deterministic tie-break
/// * `shard_count` - Number of shards of the table
/// * `rf` - Copies of every shard, each on a distinct node
///
/// # Returns
/// A schema with one row per node (rows may be empty when nodes outnumber slots)
pub fn create_sharding_schema(
    nodes: &[String],
    shard_count: u32,
    rf: usize,
) -> Result<ShardingSchema, PlacementError> {
    if rf == 0 {
        return Err(PlacementError::InvalidReplicationFactor);
    }

    let unique: Vec<&String> = {
        let mut seen = BTreeSet::new();
        nodes.iter().filter(|n| seen.insert(n.as_str())).collect()
    };

    if rf - 1 >= unique.len() {
        return Err(PlacementError::InsufficientNodes {
            needed: rf,
            available: unique.len(),
        });
    }

    let mut counts: BTreeMap<&str, usize> = unique.iter().map(|n| (n.as_str(), 0)).collect();
    let mut rows: Vec<ShardRow> = unique.iter().map(|n| ShardRow::new(n.as_str())).collect();

    for shard in 0..shard_count {
        let mut replicas: Vec<&str> = Vec::with_capacity(rf);

        for slot in 0..rf {
            let candidates: Vec<&str> = unique
                .iter()
                .map(|n| n.as_str())
                .filter(|n| !replicas.contains(n))
                .collect();

            let min = candidates
                .iter()
                .map(|n| counts[n])
                .min()
                .unwrap_or(0);

            let mut least_loaded: Vec<&str> = candidates
                .into_iter()
                .filter(|n| counts[n] == min)
                .collect();
            least_loaded.sort_unstable();

            let pick = least_loaded[(shard as usize + slot) % least_loaded.len()];
            replicas.push(pick);
            if let Some(count) = counts.get_mut(pick) {
                *count += 1;
            }
        }

        for row in rows.iter_mut() {
            if replicas.contains(&row.node.as_str()) {
                row.shards.insert(shard);
                row.connections.extend(replicas.iter().map(|n| n.to_string()));
            }
        }
    }

    Ok(ShardingSchema::from_rows_raw(rows))
}

/// Repair a schema for a new set of active nodes
///
/// Rows of nodes that are no longer active are removed and brand-new nodes
/// get empty rows. When new nodes appear the whole table is re-placed at the
/// same scale; otherwise only orphaned shards (held solely by removed nodes)
/// move, each to the surviving node holding the fewest shards.
pub fn rebalance_sharding_scheme(
    schema: &ShardingSchema,
    active_nodes: &BTreeSet<String>,
) -> Result<ShardingSchema, PlacementError> {
    let shard_count = schema.shard_count();
    let rf = schema.replication_factor();
    let current_nodes = schema.nodes();

    let mut rows: Vec<ShardRow> = schema
        .rows()
        .iter()
        .filter(|row| active_nodes.contains(&row.node))
        .cloned()
        .collect();

    let new_nodes: Vec<&String> = active_nodes
        .iter()
        .filter(|node| !current_nodes.contains(*node))
        .collect();
    rows.extend(new_nodes.iter().map(|node| ShardRow::new(node.as_str())));

    if !new_nodes.is_empty() && shard_count > 0 {
        let nodes: Vec<String> = rows.iter().map(|row| row.node.clone()).collect();
        let rf = rf.clamp(1, nodes.len().max(1));
        return create_sharding_schema(&nodes, shard_count, rf);
    }

    let held: BTreeSet<u32> = rows
        .iter()
        .flat_map(|row| row.shards.iter().copied())
        .collect();
    let orphaned: Vec<u32> = schema
        .shards()
        .into_iter()
        .filter(|shard| !held.contains(shard))
        .collect();

    if !orphaned.is_empty() && rows.is_empty() {
        return Err(PlacementError::InsufficientNodes {
            needed: 1,
            available: 0,
        });
    }

    for shard in orphaned {
        let target = rows
            .iter_mut()
            .filter(|row| !row.shards.contains(&shard))
            .min_by(|a, b| {
                a.shards
                    .len()
                    .cmp(&b.shards.len())
                    .then_with(|| a.node.cmp(&b.node))
            });

        if let Some(row) = target {
            row.shards.insert(shard);
        }
    }

    Ok(ShardingSchema::from_rows(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn node_set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_replica_round_robin() {
        let schema = create_sharding_schema(&nodes(&["a", "b", "c"]), 6, 1).unwrap();
        for row in schema.rows() {
            assert_eq!(row.shards.len(), 2);
            assert_eq!(row.connections.len(), 1);
        }
        assert_eq!(schema.shards(), (0..6).collect());
    }

    #[test]
    fn test_three_nodes_four_shards_rf2() {
        let schema = create_sharding_schema(&nodes(&["a", "b", "c"]), 4, 2).unwrap();

        let total: usize = schema.rows().iter().map(|r| r.shards.len()).sum();
        assert_eq!(total, 8);
        for row in schema.rows() {
            assert!(
                (2..=3).contains(&row.shards.len()),
                "{} holds {:?}",
                row.node,
                row.shards
            );
        }
        for shard in 0..4 {
            assert_eq!(schema.holders(shard).len(), 2);
        }
    }

    #[test]
    fn test_deterministic_assignment() {
        let schema = create_sharding_schema(&nodes(&["a", "b", "c"]), 4, 2).unwrap();
        assert_eq!(schema.holders(0), node_set(&["a", "c"]));
        assert_eq!(schema.holders(1), node_set(&["a", "b"]));
        assert_eq!(schema.holders(2), node_set(&["b", "c"]));
        assert_eq!(schema.holders(3), node_set(&["a", "b"]));
    }

    #[test]
    fn test_insufficient_nodes() {
        let result = create_sharding_schema(&nodes(&["a", "b"]), 4, 3);
        assert_eq!(
            result,
            Err(PlacementError::InsufficientNodes {
                needed: 3,
                available: 2
            })
        );
        assert!(create_sharding_schema(&[], 1, 1).is_err());
    }

    #[test]
    fn test_zero_rf_rejected() {
        assert_eq!(
            create_sharding_schema(&nodes(&["a"]), 1, 0),
            Err(PlacementError::InvalidReplicationFactor)
        );
    }

    #[test]
    fn test_rebalance_noop_for_same_nodes() {
        let schema = create_sharding_schema(&nodes(&["a", "b", "c"]), 5, 2).unwrap();
        let result = rebalance_sharding_scheme(&schema, &node_set(&["a", "b", "c"])).unwrap();
        assert_eq!(result, schema);
    }

    #[test]
    fn test_rebalance_moves_only_lost_shards_rf1() {
        let schema = create_sharding_schema(&nodes(&["a", "b", "c"]), 6, 1).unwrap();
        let lost = schema.row("c").unwrap().shards.clone();

        let result = rebalance_sharding_scheme(&schema, &node_set(&["a", "b"])).unwrap();

        assert!(result.row("c").is_none());
        assert_eq!(result.shards(), (0..6).collect());
        for shard in 0..6 {
            assert_eq!(result.holders(shard).len(), 1, "shard {} duplicated", shard);
        }
        for survivor in ["a", "b"] {
            let before = &schema.row(survivor).unwrap().shards;
            let after = &result.row(survivor).unwrap().shards;
            assert!(before.is_subset(after));
            assert!(after.difference(before).all(|s| lost.contains(s)));
        }
    }

    #[test]
    fn test_rebalance_to_single_survivor() {
        let schema = create_sharding_schema(&nodes(&["a", "b", "c"]), 4, 2).unwrap();
        let result = rebalance_sharding_scheme(&schema, &node_set(&["b"])).unwrap();

        assert_eq!(result.rows().len(), 1);
        assert_eq!(result.row("b").unwrap().shards, (0..4).collect());
    }

    #[test]
    fn test_rebalance_with_new_node_reshuffles() {
        let schema = create_sharding_schema(&nodes(&["a", "b"]), 4, 1).unwrap();
        let result = rebalance_sharding_scheme(&schema, &node_set(&["a", "c"])).unwrap();

        assert_eq!(result.nodes(), node_set(&["a", "c"]));
        assert_eq!(result.shards(), (0..4).collect());
        assert_eq!(result.row("c").unwrap().shards.len(), 2);
    }

    #[test]
    fn test_rebalance_keeps_rf_on_reshuffle() {
        let schema = create_sharding_schema(&nodes(&["a", "b", "c"]), 3, 2).unwrap();
        let result =
            rebalance_sharding_scheme(&schema, &node_set(&["a", "b", "d", "e"])).unwrap();
        for shard in 0..3 {
            assert_eq!(result.holders(shard).len(), 2);
        }
    }

    #[test]
    fn test_rebalance_no_survivors() {
        let schema = create_sharding_schema(&nodes(&["a"]), 2, 1).unwrap();
        assert!(rebalance_sharding_scheme(&schema, &BTreeSet::new()).is_err());
    }
}
