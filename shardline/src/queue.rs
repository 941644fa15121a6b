//! Durable per-node command queue
//!
//! Every DDL statement that changes cluster layout is written here first and
//! executed later by the coordinator running on the target node. Processing
//! is strictly FIFO per node:
//!
//! ```text
//! created → processing → processed
//!                      ↘ error → processing (retry with backoff, up to max_tries)
//! ```
//!
//! Cross-node ordering is expressed with `wait_for_id`; an item never starts
//! before the item it waits for is `processed`.

use crate::client::{row_string, row_u64, Row, SqlClient};
use crate::cluster::Cluster;
use crate::config::QueueConfig;
use crate::error::{Result, ShardingError};
use crate::metrics;
use crate::rollback::RollbackCommandGenerator;
use crate::sql::{quote_identifier, quote_string};
use crate::time::{now_micros, now_millis};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const GROUP_LIMIT: usize = 10_000;

/// Low id digits reserved for the enqueuing node
const ID_ORIGIN_SLOTS: u64 = 1024;

/// Status of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Created,
    Processing,
    Processed,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Created => "created",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(QueueStatus::Created),
            "processing" => Some(QueueStatus::Processing),
            "processed" => Some(QueueStatus::Processed),
            "error" => Some(QueueStatus::Error),
            _ => None,
        }
    }
}

/// One stored queue row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: u64,
    pub node: String,
    pub query: String,
    pub rollback_query: String,
    pub wait_for_id: u64,
    pub tries: u32,
    pub status: QueueStatus,
    /// Unix milliseconds
    pub created_at: u64,
    /// Unix milliseconds
    pub updated_at: u64,
    /// Execution time of the last attempt in milliseconds
    pub duration: u64,
    pub operation_group: String,
}

impl QueueItem {
    fn from_row(row: &Row) -> Self {
        Self {
            id: row_u64(row, "id"),
            node: row_string(row, "node"),
            query: row_string(row, "query"),
            rollback_query: row_string(row, "rollback_query"),
            wait_for_id: row_u64(row, "wait_for_id"),
            tries: row_u64(row, "tries") as u32,
            status: QueueStatus::parse(&row_string(row, "status")).unwrap_or(QueueStatus::Created),
            created_at: row_u64(row, "created_at"),
            updated_at: row_u64(row, "updated_at"),
            duration: row_u64(row, "duration"),
            operation_group: row_string(row, "operation_group"),
        }
    }
}

/// A command to enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCommand {
    /// Node that executes the command
    pub node: String,
    pub query: String,
    /// Inverse statement; empty when irreversible
    pub rollback_query: String,
    pub wait_for_id: Option<u64>,
    pub operation_group: Option<String>,
}

impl QueueCommand {
    /// Command with an explicit rollback text
    pub fn new(
        node: impl Into<String>,
        query: impl Into<String>,
        rollback_query: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            query: query.into(),
            rollback_query: rollback_query.into(),
            wait_for_id: None,
            operation_group: None,
        }
    }

    /// Command whose rollback text is generated from the query
    pub fn reversible(node: impl Into<String>, query: impl Into<String>) -> Self {
        let query = query.into();
        let rollback = RollbackCommandGenerator::generate_or_empty(&query);
        Self::new(node, query, rollback)
    }

    pub fn wait_for(mut self, id: impl Into<Option<u64>>) -> Self {
        self.wait_for_id = id.into().filter(|id| *id > 0);
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.operation_group = Some(group.into());
        self
    }
}

/// Anything commands can be enqueued into
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Enqueue a command and return its id
    async fn add(&self, command: QueueCommand) -> Result<u64>;
}

/// Stamps every command passing through with one operation group
pub struct OperationGroup<'a> {
    queue: &'a dyn CommandQueue,
    name: String,
}

impl<'a> OperationGroup<'a> {
    /// New group named `<kind>:<table>:<uuid>`
    pub fn new(queue: &'a dyn CommandQueue, kind: &str, table: &str) -> Self {
        Self {
            queue,
            name: format!("{}:{}:{}", kind, table, Uuid::new_v4()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl CommandQueue for OperationGroup<'_> {
    async fn add(&self, command: QueueCommand) -> Result<u64> {
        self.queue.add(command.in_group(self.name.clone())).await
    }
}

/// Outcome of one `process` pass over a node's queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Outcome of rolling back an operation group
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub group: String,
    /// Group stamped on the queued inverses
    pub rollback_group: String,
    /// Queued inverses, newest original first
    pub queue_ids: Vec<u64>,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Backoff before attempt number `tries + 1`, in milliseconds
pub fn backoff_delay_ms(base: f64, tries: u32) -> u64 {
    (base.powi(tries as i32) * 1000.0).ceil() as u64
}

pub struct Queue {
    client: Arc<dyn SqlClient>,
    cluster: Arc<Cluster>,
    table: String,
    config: QueueConfig,
    origin: u64,
    last_id: Mutex<u64>,
}

impl Queue {
    pub fn new(
        client: Arc<dyn SqlClient>,
        cluster: Arc<Cluster>,
        table: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        Self {
            client,
            cluster,
            table: table.into(),
            config,
            origin: 0,
            last_id: Mutex::new(0),
        }
    }

    /// Tag generated ids with the enqueuing node so concurrent enqueuers never collide
    pub fn with_origin(mut self, node: &str) -> Self {
        let digest = Sha256::digest(node.as_bytes());
        self.origin = u64::from(u16::from_be_bytes([digest[0], digest[1]])) % ID_ORIGIN_SLOTS;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn max_tries(&self) -> u32 {
        self.config.max_tries
    }

    /// `now_micros * ID_ORIGIN_SLOTS + origin`, strictly increasing per process
    ///
    /// Order across enqueuers follows their clocks.
    fn next_id(&self) -> u64 {
        let mut last = self.last_id.lock();
        let candidate = now_micros() * ID_ORIGIN_SLOTS + self.origin;
        *last = if candidate > *last {
            candidate
        } else {
            *last + ID_ORIGIN_SLOTS
        };
        *last
    }

    fn read_table(&self) -> String {
        quote_identifier(&self.table)
    }

    fn write_table(&self) -> String {
        self.cluster.table_ref(&self.table)
    }

    /// Items for `node` that still need work, oldest first
    pub async fn dequeue(&self, node: &str) -> Result<Vec<QueueItem>> {
        let query = format!(
            "SELECT * FROM {} WHERE node = {} AND status <> 'processed' AND tries < {} ORDER BY id ASC LIMIT {}",
            self.read_table(),
            quote_string(node),
            self.config.max_tries,
            self.config.batch_size
        );
        let response = self.client.send_request(&query).await?;
        Ok(response.data.iter().map(QueueItem::from_row).collect())
    }

    /// Execute ready items for `node` in id order
    ///
    /// Stops at the first item that cannot run yet or that fails, so no item
    /// ever overtakes an earlier one.
    pub async fn process(&self, node: &str) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();

        for item in self.dequeue(node).await? {
            if item.wait_for_id > 0
                && self.status(item.wait_for_id).await? != Some(QueueStatus::Processed)
            {
                debug!(id = item.id, wait_for_id = item.wait_for_id, "Waiting for dependency");
                metrics::record_queue_skip("dependency");
                report.skipped += 1;
                break;
            }

            if item.tries > 0 {
                let elapsed = now_millis().saturating_sub(item.created_at);
                if elapsed < backoff_delay_ms(self.config.backoff_base, item.tries) {
                    metrics::record_queue_skip("backoff");
                    report.skipped += 1;
                    break;
                }
            }

            if item.status == QueueStatus::Processing && !self.release_stale(&item).await? {
                metrics::record_queue_skip("in_progress");
                report.skipped += 1;
                break;
            }

            if !self.claim(item.id).await? {
                debug!(id = item.id, "Lost claim race");
                metrics::record_queue_skip("claimed");
                report.skipped += 1;
                break;
            }

            if self.execute(&item).await? == QueueStatus::Processed {
                report.processed += 1;
            } else {
                report.failed += 1;
                break;
            }
        }

        Ok(report)
    }

    /// Return an item stuck in `processing` past the stale timeout to `error`
    ///
    /// Covers a runner that died between claim and result. True when the
    /// item can be claimed again.
    async fn release_stale(&self, item: &QueueItem) -> Result<bool> {
        let cutoff = now_millis().saturating_sub(self.config.stale_processing_ms);
        if item.updated_at >= cutoff {
            return Ok(false);
        }
        let query = format!(
            "UPDATE {} SET status = 'error', updated_at = {} WHERE id = {} AND status = 'processing' AND updated_at < {}",
            self.write_table(),
            now_millis(),
            item.id,
            cutoff
        );
        let released = self.client.send_request(&query).await?.total == 1;
        if released {
            warn!(id = item.id, node = %item.node, "Released stale processing item");
        }
        Ok(released)
    }

    /// Conditional `created|error → processing`; true when this runner won
    async fn claim(&self, id: u64) -> Result<bool> {
        let query = format!(
            "UPDATE {} SET status = 'processing', updated_at = {} WHERE id = {} AND status IN ('created', 'error')",
            self.write_table(),
            now_millis(),
            id
        );
        Ok(self.client.send_request(&query).await?.total == 1)
    }

    async fn execute(&self, item: &QueueItem) -> Result<QueueStatus> {
        let started = Instant::now();
        let status = match self.client.send_request(&item.query).await {
            Ok(_) => {
                info!(id = item.id, node = %item.node, "Queue command processed");
                QueueStatus::Processed
            }
            Err(e) => {
                warn!(
                    id = item.id,
                    node = %item.node,
                    tries = item.tries + 1,
                    error = %e,
                    "Queue command failed"
                );
                QueueStatus::Error
            }
        };
        let duration = started.elapsed();

        let query = format!(
            "UPDATE {} SET status = {}, tries = {}, duration = {}, updated_at = {} WHERE id = {}",
            self.write_table(),
            quote_string(status.as_str()),
            item.tries + 1,
            duration.as_millis(),
            now_millis(),
            item.id
        );
        self.client.send_request(&query).await?;

        metrics::record_queue_command(&item.node, status.as_str(), duration);
        Ok(status)
    }

    /// Status of one item
    pub async fn status(&self, id: u64) -> Result<Option<QueueStatus>> {
        Ok(self.statuses(&[id]).await?.remove(&id))
    }

    /// Statuses of several items; unknown ids are absent
    pub async fn statuses(&self, ids: &[u64]) -> Result<BTreeMap<u64, QueueStatus>> {
        Ok(self
            .items(ids)
            .await?
            .into_iter()
            .map(|item| (item.id, item.status))
            .collect())
    }

    /// Full rows of several items
    pub async fn items(&self, ids: &[u64]) -> Result<Vec<QueueItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT * FROM {} WHERE id IN ({}) LIMIT {}",
            self.read_table(),
            list,
            ids.len()
        );
        let response = self.client.send_request(&query).await?;
        Ok(response.data.iter().map(QueueItem::from_row).collect())
    }

    /// Item count per status
    pub async fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        let query = format!(
            "SELECT status, COUNT(*) AS cnt FROM {} GROUP BY status",
            self.read_table()
        );
        let response = self.client.send_request(&query).await?;
        Ok(response
            .data
            .iter()
            .map(|row| (row_string(row, "status"), row_u64(row, "cnt")))
            .collect())
    }

    /// Items that still have attempts left
    pub async fn pending_depth(&self) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE status <> 'processed' AND tries < {}",
            self.read_table(),
            self.config.max_tries
        );
        let response = self.client.send_request(&query).await?;
        let depth = response.first().map(|row| row_u64(row, "cnt")).unwrap_or(0);
        metrics::update_queue_depth(depth);
        Ok(depth)
    }

    /// Items that exhausted every attempt
    pub async fn permanently_failed(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let query = format!(
            "SELECT * FROM {} WHERE status = 'error' AND tries >= {} ORDER BY id ASC LIMIT {}",
            self.read_table(),
            self.config.max_tries,
            limit
        );
        let response = self.client.send_request(&query).await?;
        Ok(response.data.iter().map(QueueItem::from_row).collect())
    }

    /// Groups holding a permanently failed item last touched before `before_ms`
    pub async fn failed_groups(&self, before_ms: u64) -> Result<Vec<String>> {
        let query = format!(
            "SELECT operation_group FROM {} WHERE status = 'error' AND tries >= {} AND updated_at < {} AND operation_group <> '' LIMIT {}",
            self.read_table(),
            self.config.max_tries,
            before_ms,
            GROUP_LIMIT
        );
        let response = self.client.send_request(&query).await?;
        let groups: BTreeSet<String> = response
            .data
            .iter()
            .map(|row| row_string(row, "operation_group"))
            .filter(|group| !group.is_empty())
            .collect();
        Ok(groups.into_iter().collect())
    }

    /// Delete every item of a group; returns the affected row count
    pub async fn delete_group(&self, group: &str) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE operation_group = {}",
            self.write_table(),
            quote_string(group)
        );
        Ok(self.client.send_request(&query).await?.total)
    }

    /// Delete finished items last touched before `before_ms`
    pub async fn delete_finished_before(&self, before_ms: u64) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE status IN ('processed', 'error') AND updated_at < {}",
            self.write_table(),
            before_ms
        );
        Ok(self.client.send_request(&query).await?.total)
    }

    /// Undo a group by queueing each stored inverse on the node that ran it
    ///
    /// Items of the group that never ran are retired first so they cannot
    /// execute after the rollback. Inverses are queued newest first, each
    /// waiting for the previous one, in a group named `rollback:<group>:<uuid>`.
    pub async fn rollback_operation_group(&self, group: &str) -> Result<RollbackReport> {
        let query = format!(
            "SELECT * FROM {} WHERE operation_group = {} ORDER BY id DESC LIMIT {}",
            self.read_table(),
            quote_string(group),
            GROUP_LIMIT
        );
        let items: Vec<QueueItem> = self
            .client
            .send_request(&query)
            .await?
            .data
            .iter()
            .map(QueueItem::from_row)
            .collect();

        let retire = format!(
            "UPDATE {} SET tries = {}, updated_at = {} WHERE operation_group = {} \
             AND status IN ('created', 'error')",
            self.write_table(),
            self.config.max_tries,
            now_millis(),
            quote_string(group)
        );
        self.client.send_request(&retire).await?;

        let undo = OperationGroup::new(self, "rollback", group);
        let mut report = RollbackReport {
            group: group.to_string(),
            rollback_group: undo.name().to_string(),
            ..RollbackReport::default()
        };

        let mut previous: Option<u64> = None;
        for item in items {
            if item.rollback_query.is_empty() || item.status == QueueStatus::Created {
                report.skipped += 1;
                continue;
            }
            let command = QueueCommand::new(item.node.as_str(), item.rollback_query.as_str(), "")
                .wait_for(previous);
            match undo.add(command).await {
                Ok(id) => {
                    report.queue_ids.push(id);
                    previous = Some(id);
                }
                Err(e) => {
                    error!(id = item.id, group = group, error = %e, "Could not queue rollback");
                    report.errors.push(format!("{}: {}", item.id, e));
                }
            }
        }

        metrics::record_rollback(report.queue_ids.len(), report.errors.len());
        info!(
            group = group,
            queued = report.queue_ids.len(),
            skipped = report.skipped,
            "Operation group rollback queued"
        );
        Ok(report)
    }

    /// Create the backing table and attach it to the bound cluster
    pub async fn setup(&self) -> Result<()> {
        if self.client.has_table(&self.table).await? {
            warn!(table = %self.table, "Queue table already exists");
            return Ok(());
        }
        let query = format!(
            "CREATE TABLE {} (node string, query string, rollback_query string, operation_group string, \
             wait_for_id bigint, tries int, status string, created_at bigint, updated_at bigint, duration int)",
            self.read_table()
        );
        self.client.send_request(&query).await?;
        self.cluster.attach_local(self.client.as_ref(), &self.table).await?;
        info!(table = %self.table, "Queue table created");
        Ok(())
    }
}

#[async_trait]
impl CommandQueue for Queue {
    async fn add(&self, command: QueueCommand) -> Result<u64> {
        if command.node.is_empty() {
            return Err(ShardingError::Internal("queue command without node".into()));
        }

        let id = self.next_id();
        let now = now_millis();
        let query = format!(
            "INSERT INTO {} (id, node, query, rollback_query, operation_group, wait_for_id, tries, status, created_at, updated_at, duration) \
             VALUES ({}, {}, {}, {}, {}, {}, 0, 'created', {}, {}, 0)",
            self.write_table(),
            id,
            quote_string(&command.node),
            quote_string(&command.query),
            quote_string(&command.rollback_query),
            quote_string(command.operation_group.as_deref().unwrap_or("")),
            command.wait_for_id.unwrap_or(0),
            now,
            now
        );
        self.client.send_request(&query).await?;
        debug!(id = id, node = %command.node, query = %command.query, "Command queued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryResponse;
    use crate::testing::{engine_error, rows, ScriptedClient};
    use serde_json::{json, Value};

    fn item(id: u64, query: &str, extra: Value) -> Value {
        let mut row = json!({
            "id": id,
            "node": "a:9308",
            "query": query,
            "rollback_query": "",
            "wait_for_id": 0,
            "tries": 0,
            "status": "created",
            "created_at": 0,
            "updated_at": 0,
            "duration": 0,
            "operation_group": ""
        });
        if let (Some(map), Value::Object(extra)) = (row.as_object_mut(), extra) {
            map.extend(extra);
        }
        row
    }

    fn queue_with(client: Arc<ScriptedClient>) -> Queue {
        Queue::new(
            client,
            Arc::new(Cluster::new("")),
            "system.sharding_queue",
            QueueConfig::default(),
        )
    }

    /// Engine double: fixed dequeue rows, statuses for lookups, and failing `BAD` statements
    fn engine(pending: Vec<Value>, lookups: Vec<Value>) -> Arc<ScriptedClient> {
        Arc::new(ScriptedClient::new(move |query| {
            if query.contains("ORDER BY id ASC LIMIT 1000") {
                Ok(rows(pending.clone()))
            } else if query.contains("WHERE id IN") {
                Ok(rows(lookups.clone()))
            } else if query.starts_with("UPDATE") {
                Ok(QueryResponse::affected(1))
            } else if query.starts_with("BAD") {
                engine_error("syntax error")
            } else {
                Ok(QueryResponse::default())
            }
        }))
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay_ms(1.21, 0), 1000);
        assert_eq!(backoff_delay_ms(1.21, 1), 1210);
        assert_eq!(backoff_delay_ms(1.21, 3), 1772);
    }

    #[test]
    fn test_command_builders() {
        let command = QueueCommand::reversible("a", "CREATE TABLE t (id bigint)")
            .wait_for(5)
            .in_group("create:t:1");
        assert_eq!(command.rollback_query, "DROP TABLE IF EXISTS t");
        assert_eq!(command.wait_for_id, Some(5));
        assert_eq!(command.operation_group.as_deref(), Some("create:t:1"));

        let command = QueueCommand::new("a", "DROP TABLE t", "").wait_for(None);
        assert_eq!(command.wait_for_id, None);
        assert_eq!(QueueCommand::new("a", "q", "").wait_for(0).wait_for_id, None);
    }

    #[tokio::test]
    async fn test_add_generates_increasing_ids() {
        let client = engine(vec![], vec![]);
        let queue = queue_with(client.clone());

        let first = queue
            .add(QueueCommand::reversible("a:9308", "CREATE TABLE t (id bigint)"))
            .await
            .unwrap();
        let second = queue
            .add(QueueCommand::new("a:9308", "DROP TABLE t", "").wait_for(first))
            .await
            .unwrap();

        assert!(second > first);
        let inserts = client.queries_matching("INSERT INTO system.sharding_queue");
        assert_eq!(inserts.len(), 2);
        assert!(inserts[0].contains("'DROP TABLE IF EXISTS t'"));
        assert!(inserts[1].contains(&format!(", {}, 0, 'created'", first)));
    }

    #[tokio::test]
    async fn test_add_rejects_empty_node() {
        let queue = queue_with(engine(vec![], vec![]));
        assert!(queue.add(QueueCommand::new("", "q", "")).await.is_err());
    }

    #[tokio::test]
    async fn test_process_in_order() {
        let client = engine(
            vec![
                item(1, "CREATE TABLE a (x int)", json!({})),
                item(2, "CREATE TABLE b (x int)", json!({})),
            ],
            vec![],
        );
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();

        assert_eq!(report.processed, 2);
        let executed: Vec<String> = client
            .queries()
            .into_iter()
            .filter(|q| q.starts_with("CREATE TABLE"))
            .collect();
        assert_eq!(executed, vec!["CREATE TABLE a (x int)", "CREATE TABLE b (x int)"]);
    }

    #[tokio::test]
    async fn test_error_blocks_later_items() {
        let client = engine(
            vec![item(1, "BAD STATEMENT", json!({})), item(2, "CREATE TABLE b (x int)", json!({}))],
            vec![],
        );
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();

        assert_eq!(report, ProcessReport { processed: 0, failed: 1, skipped: 0 });
        assert!(client.queries_matching("CREATE TABLE b").is_empty());
        let updates = client.queries_matching("SET status = 'error'");
        assert_eq!(updates.len(), 1);
        assert!(updates[0].contains("tries = 1"));
    }

    #[tokio::test]
    async fn test_wait_for_unprocessed_dependency() {
        let client = engine(
            vec![item(5, "JOIN CLUSTER c AT 'b:9308' 'c' as path", json!({"wait_for_id": 3}))],
            vec![item(3, "CREATE CLUSTER c 'c' as path", json!({"status": "processing"}))],
        );
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();

        assert_eq!(report.skipped, 1);
        assert!(client.queries_matching("SET status = 'processing'").is_empty());
        assert!(client.queries_matching("JOIN CLUSTER").is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_processed_dependency_runs() {
        let client = engine(
            vec![item(5, "JOIN CLUSTER c AT 'b:9308' 'c' as path", json!({"wait_for_id": 3}))],
            vec![item(3, "CREATE CLUSTER c 'c' as path", json!({"status": "processed"}))],
        );
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_backoff_skips_recent_retry() {
        let now = now_millis();
        let client = engine(
            vec![item(
                1,
                "CREATE TABLE a (x int)",
                json!({"tries": 3, "status": "error", "created_at": now - 1000}),
            )],
            vec![],
        );
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(client.queries_matching("CREATE TABLE a").is_empty());
    }

    #[tokio::test]
    async fn test_fresh_processing_item_blocks() {
        let now = now_millis();
        let client = engine(
            vec![item(
                1,
                "CREATE TABLE a (x int)",
                json!({"status": "processing", "updated_at": now}),
            )],
            vec![],
        );
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(client.queries_matching("UPDATE").is_empty());
    }

    #[tokio::test]
    async fn test_stale_processing_item_is_retried() {
        let client = engine(
            vec![item(
                1,
                "CREATE TABLE a (x int)",
                json!({"status": "processing", "updated_at": 1}),
            )],
            vec![],
        );
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(client.queries_matching("AND status = 'processing'").len(), 1);
    }

    #[tokio::test]
    async fn test_lost_claim_skips() {
        let client = Arc::new(ScriptedClient::new(|query| {
            if query.starts_with("SELECT") {
                Ok(rows(vec![item(1, "CREATE TABLE a (x int)", json!({}))]))
            } else {
                Ok(QueryResponse::affected(0))
            }
        }));
        let queue = queue_with(client.clone());

        let report = queue.process("a:9308").await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(client.queries_matching("CREATE TABLE a").is_empty());
    }

    #[tokio::test]
    async fn test_rollback_operation_group_queues_inverses_on_owning_nodes() {
        let client = Arc::new(ScriptedClient::new(|query| {
            if query.contains("ORDER BY id DESC") {
                Ok(rows(vec![
                    item(4, "DROP TABLE x", json!({"status": "processed"})),
                    item(
                        3,
                        "ALTER CLUSTER c ADD t",
                        json!({
                            "node": "b:9308",
                            "status": "processed",
                            "rollback_query": "ALTER CLUSTER c DROP t"
                        }),
                    ),
                    item(
                        2,
                        "CREATE CLUSTER c 'c' as path",
                        json!({"status": "error", "rollback_query": "DELETE CLUSTER c"}),
                    ),
                    item(
                        1,
                        "CREATE TABLE never (x int)",
                        json!({"node": "b:9308", "rollback_query": "DROP TABLE IF EXISTS never"}),
                    ),
                ]))
            } else {
                Ok(QueryResponse::affected(1))
            }
        }));
        let queue = queue_with(client.clone());

        let report = queue.rollback_operation_group("create:t:1").await.unwrap();

        assert_eq!(report.queue_ids.len(), 2);
        assert_eq!(report.skipped, 2);
        assert!(report.errors.is_empty());
        assert!(report.rollback_group.starts_with("rollback:create:t:1:"));

        // Inverses are queued, never run by the caller
        let queries = client.queries();
        assert!(queries[1].contains("SET tries = 10"));
        assert!(!queries.iter().any(|q| q == "ALTER CLUSTER c DROP t"));
        assert!(!queries.iter().any(|q| q == "DELETE CLUSTER c"));

        let inserts = client.queries_matching("INSERT INTO system.sharding_queue");
        assert_eq!(inserts.len(), 2);
        assert!(inserts[0].contains("'b:9308', 'ALTER CLUSTER c DROP t'"));
        assert!(inserts[0].contains(", 0, 0, 'created'"));
        assert!(inserts[1].contains("'a:9308', 'DELETE CLUSTER c'"));
        assert!(inserts[1].contains(&format!(", {}, 0, 'created'", report.queue_ids[0])));
        assert!(inserts
            .iter()
            .all(|insert| insert.contains(&format!("'{}'", report.rollback_group))));
        assert!(!inserts.iter().any(|insert| insert.contains("never")));
    }

    #[tokio::test]
    async fn test_rollback_collects_enqueue_failures() {
        let client = Arc::new(ScriptedClient::new(|query| {
            if query.contains("ORDER BY id DESC") {
                Ok(rows(vec![
                    item(
                        2,
                        "ALTER CLUSTER c ADD t",
                        json!({"status": "processed", "rollback_query": "ALTER CLUSTER c DROP t"}),
                    ),
                    item(
                        1,
                        "CREATE CLUSTER c 'c' as path",
                        json!({"status": "processed", "rollback_query": "DELETE CLUSTER c"}),
                    ),
                ]))
            } else if query.starts_with("INSERT") {
                engine_error("table is read only")
            } else {
                Ok(QueryResponse::affected(1))
            }
        }));
        let queue = queue_with(client.clone());

        let report = queue.rollback_operation_group("g").await.unwrap();

        assert!(report.queue_ids.is_empty());
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].starts_with("2: "));
        assert_eq!(client.queries_matching("INSERT").len(), 2);
    }

    #[test]
    fn test_ids_carry_enqueuer_origin() {
        let client = engine(vec![], vec![]);
        let a = queue_with(client.clone()).with_origin("a:9308");
        let b = queue_with(client).with_origin("b:9308");
        assert_ne!(a.origin, b.origin);

        let mut previous = 0;
        for _ in 0..100 {
            let id = a.next_id();
            assert!(id > previous);
            assert_eq!(id % ID_ORIGIN_SLOTS, a.origin);
            assert_ne!(id, b.next_id());
            previous = id;
        }
    }
}
