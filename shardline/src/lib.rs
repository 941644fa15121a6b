//! Shardline - Sharding coordination for SQL-over-HTTP search engine clusters
//!
//! A sidecar runs next to every engine node. Operators on all nodes coordinate
//! only through two replicated engine tables: a key-value State table and a
//! command Queue table. Every topology change becomes an ordered list of SQL
//! commands, each targeted at one node and executed by that node's operator.
//!
//! # Architecture
//!
//! - **Placement**: Deterministic shard-to-node assignment and rebalancing
//! - **State**: Replicated key-value store (master, cluster binding, records)
//! - **Node / Cluster**: Heartbeat membership and replication-group DDL
//! - **Queue**: Per-node FIFO of commands with retries, dependencies and rollback
//! - **Table**: Sharded table creation, drop and rebalance
//! - **Operator**: Tick loop, master election and request entry points
//! - **Health / Cleanup**: Diagnostics and garbage collection
//!
//! # Example
//!
//! ```no_run
//! use shardline::{HttpSqlClient, Operator, ShardingConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> shardline::Result<()> {
//! let config = ShardingConfig::default();
//! let client = Arc::new(HttpSqlClient::new(&config.engine)?);
//! let operator = Operator::new(config, client).await?;
//! let report = operator.tick().await;
//! println!("processed {} queue items", report.queue.processed);
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod node;
pub mod operator;
pub mod placement;
pub mod queue;
pub mod records;
pub mod rollback;
pub mod sql;
pub mod state;
pub mod table;

mod time;

#[cfg(test)]
mod testing;

pub use cleanup::{CleanupManager, CleanupReport};
pub use client::{HttpSqlClient, QueryResponse, Row, SqlClient};
pub use cluster::Cluster;
pub use config::ShardingConfig;
pub use error::{Result, ShardingError};
pub use health::{HealthMonitor, HealthReport, HealthStatus, RecoveryReport};
pub use node::Node;
pub use operator::{DropRequest, Operator, ShardOptions, ShardRequest, TickReport};
pub use placement::{
    create_sharding_schema, rebalance_sharding_scheme, PlacementError, ShardRow, ShardingSchema,
};
pub use queue::{CommandQueue, OperationGroup, Queue, QueueCommand, QueueStatus, RollbackReport};
pub use records::{OperationStatus, OperationType, RebalanceRecord, RebalanceStatus, TableRecord};
pub use rollback::RollbackCommandGenerator;
pub use state::State;
pub use table::Table;
