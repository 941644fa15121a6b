//! Per-process sharding coordinator
//!
//! One [`Operator`] runs on every node. Each tick it:
//! 1. Re-reads the cluster binding and heartbeats
//! 2. Checks mastership, taking over from a stale master when it is next in line
//! 3. On the master only: compares the topology hash and rebalances tables,
//!    then advances running rebalances
//! 4. Marks finished table operations done
//! 5. Drains its own node's command queue
//!
//! There is no RPC between operators; all coordination goes through the
//! replicated State and Queue tables.

use crate::client::SqlClient;
use crate::cluster::{get_nodes_hash, Cluster};
use crate::config::ShardingConfig;
use crate::error::{Result, ShardingError};
use crate::metrics;
use crate::node::{find_id, Node};
use crate::queue::{OperationGroup, ProcessReport, Queue, QueueStatus, RollbackReport};
use crate::records::{
    rebalance_key, table_key, OperationStatus, OperationType, RebalanceRecord, RebalanceStatus,
    TableRecord, REBALANCE_PREFIX, TABLE_PREFIX,
};
use crate::sql::validate_identifier;
use crate::state::State;
use crate::table::Table;
use crate::time::now_secs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sharding options of a create request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardOptions {
    pub shards: u32,

    #[serde(default = "default_rf")]
    pub rf: usize,

    /// Seconds to wait for completion; no wait when unset
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_rf() -> usize {
    1
}

/// Parsed `CREATE TABLE ... shards=N rf=M` request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardRequest {
    #[serde(default)]
    pub cluster: String,
    pub name: String,
    #[serde(default)]
    pub structure: String,
    #[serde(default)]
    pub extra: String,
    pub options: ShardOptions,
}

/// Parsed `DROP TABLE` request for a sharded table
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DropRequest {
    #[serde(default)]
    pub cluster: String,
    pub name: String,
}

/// What one tick did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub active: bool,
    pub is_master: bool,
    pub queue: ProcessReport,
    pub errors: Vec<String>,
}

/// Result of a balance check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalanceReport {
    /// Whether the topology hash differed from the stored one
    pub changed: bool,
    pub rebalanced: Vec<String>,
    /// Tables skipped because a rebalance is still running
    pub deferred: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Operator {
    config: ShardingConfig,
    client: Arc<dyn SqlClient>,
    node: Node,
    state: Arc<State>,
    cluster: Arc<Cluster>,
    queue: Arc<Queue>,
    master_stale_since: Mutex<Option<Instant>>,
}

impl Operator {
    /// Create an operator, discovering the node id from the engine when not configured
    pub async fn new(config: ShardingConfig, client: Arc<dyn SqlClient>) -> Result<Self> {
        let node_id = match &config.node.advertise_addr {
            Some(addr) => addr.clone(),
            None => find_id(client.as_ref()).await?,
        };
        let operator = Self::with_node_id(config, client, node_id);
        if let Err(e) = operator.refresh_binding().await {
            warn!(error = %e, "Could not read cluster binding");
        }
        info!(node = %operator.node_id(), "Sharding operator started");
        Ok(operator)
    }

    pub fn with_node_id(
        config: ShardingConfig,
        client: Arc<dyn SqlClient>,
        node_id: impl Into<String>,
    ) -> Self {
        let cluster = Arc::new(Cluster::from_config("", &config.cluster));
        let state = Arc::new(State::new(
            client.clone(),
            cluster.clone(),
            config.tables.state.clone(),
        ));
        let node_id = node_id.into();
        let queue = Arc::new(
            Queue::new(
                client.clone(),
                cluster.clone(),
                config.tables.queue.clone(),
                config.queue.clone(),
            )
            .with_origin(&node_id),
        );
        let node = Node::new(node_id, state.clone());

        Self {
            config,
            client,
            node,
            state,
            cluster,
            queue,
            master_stale_since: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        self.node.id()
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn SqlClient> {
        &self.client
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn table_from(&self, record: &TableRecord) -> Table {
        Table::from_record(
            self.client.clone(),
            self.cluster.clone(),
            self.config.tables.schema.clone(),
            record,
        )
    }

    /// Run one coordination round; step failures are logged and collected
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        match self.state.is_active().await {
            Ok(true) => report.active = true,
            Ok(false) => return report,
            Err(e) => {
                note_error(&mut report, "state", &e);
                return report;
            }
        }

        if let Err(e) = self.refresh_binding().await {
            note_error(&mut report, "binding", &e);
        }
        if let Err(e) = self.heartbeat().await {
            note_error(&mut report, "heartbeat", &e);
        }

        report.is_master = match self.check_master().await {
            Ok(is_master) => is_master,
            Err(e) => {
                note_error(&mut report, "master", &e);
                false
            }
        };

        if report.is_master {
            if let Err(e) = self.check_balance().await {
                note_error(&mut report, "balance", &e);
            }
            if let Err(e) = self.advance_rebalances().await {
                note_error(&mut report, "rebalance_status", &e);
            }
        }

        if let Err(e) = self.check_table_statuses().await {
            note_error(&mut report, "table_status", &e);
        }

        match self.process_queue().await {
            Ok(processed) => report.queue = processed,
            Err(e) => note_error(&mut report, "queue", &e),
        }

        if let Ok(active) = self.active_nodes().await {
            metrics::update_membership(report.is_master, active.len());
        }
        metrics::record_tick(started.elapsed());
        report
    }

    /// Bind the cluster name recorded in State
    async fn refresh_binding(&self) -> Result<()> {
        if !self.state.is_active().await? {
            return Ok(());
        }
        let name = self.state.get_string("cluster").await?;
        if name != self.cluster.name() {
            info!(cluster = %name, "Bound to cluster");
            self.cluster.set_name(name);
        }
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.node.heartbeat().await
    }

    /// Nodes considered alive, this node always included
    pub async fn active_nodes(&self) -> Result<BTreeSet<String>> {
        let mut nodes = if self.cluster.is_bound() {
            self.cluster.get_nodes(&self.state).await?
        } else {
            BTreeSet::new()
        };
        nodes.insert(self.node_id().to_string());
        Ok(nodes)
    }

    /// Nodes a new table may be placed on before State exists
    fn bootstrap_nodes(&self, cluster: &str) -> BTreeSet<String> {
        let mut nodes = BTreeSet::new();
        nodes.insert(self.node_id().to_string());
        if !cluster.is_empty() {
            nodes.extend(self.config.cluster.seed_nodes.iter().cloned());
        }
        nodes
    }

    pub async fn is_master(&self) -> Result<bool> {
        Ok(self.state.get_string("master").await? == self.node_id())
    }

    /// Confirm or take over mastership
    ///
    /// A stale master is replaced by the lowest active node id, but only after
    /// it has looked stale for the configured grace period.
    pub async fn check_master(&self) -> Result<bool> {
        let master = self.state.get_string("master").await?;
        if master == self.node_id() {
            *self.master_stale_since.lock() = None;
            return Ok(true);
        }

        let active = self.active_nodes().await?;
        if !master.is_empty() && active.contains(&master) {
            *self.master_stale_since.lock() = None;
            return Ok(false);
        }

        let stale_for = self
            .master_stale_since
            .lock()
            .get_or_insert_with(Instant::now)
            .elapsed();
        if stale_for < self.config.cluster.master_takeover_grace() {
            debug!(master = %master, stale_ms = stale_for.as_millis() as u64, "Master looks stale");
            return Ok(false);
        }

        if active.iter().next().map(String::as_str) != Some(self.node_id()) {
            return Ok(false);
        }

        self.state.set("master", &json!(self.node_id())).await?;
        *self.master_stale_since.lock() = None;
        metrics::record_master_takeover();
        info!(node = %self.node_id(), previous = %master, "Took over as master");
        Ok(true)
    }

    /// Rebalance every sharded table when the active node set changed
    pub async fn check_balance(&self) -> Result<BalanceReport> {
        let active = self.active_nodes().await?;
        let hash = get_nodes_hash(&active);
        let stored = self.state.get_string("cluster_hash").await?;

        let mut report = BalanceReport::default();
        if hash == stored {
            return Ok(report);
        }
        report.changed = true;
        info!(nodes = ?active, "Topology changed, checking table balance");

        let tables: Vec<(String, TableRecord)> = self.state.list_prefixed(TABLE_PREFIX).await?;
        for (name, record) in tables.into_iter().filter(|(_, r)| r.is_live()) {
            let rebalance: RebalanceRecord = self
                .state
                .get_as(&rebalance_key(&name))
                .await?
                .unwrap_or_default();
            if rebalance.status == RebalanceStatus::Running {
                debug!(table = %name, "Rebalance still running, deferring");
                report.deferred.push(name);
                continue;
            }

            let table = self.table_from(&record);
            let group = OperationGroup::new(self.queue.as_ref(), "rebalance", &name);
            let now = now_secs();

            match table.rebalance(&group, &active).await {
                Ok(Some(outcome)) => {
                    let running = RebalanceRecord {
                        status: RebalanceStatus::Running,
                        started_at: now,
                        updated_at: now,
                        queue_ids: outcome.queue_ids,
                        operation_group: group.name().to_string(),
                        error: None,
                    };
                    self.state.set_as(&rebalance_key(&name), &running).await?;
                    metrics::record_rebalance_started(&name);
                    report.rebalanced.push(name);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(table = %name, group = %group.name(), error = %e, "Rebalance failed");
                    let failed = RebalanceRecord {
                        status: RebalanceStatus::Failed,
                        started_at: now,
                        updated_at: now,
                        queue_ids: Vec::new(),
                        operation_group: group.name().to_string(),
                        error: Some(e.to_string()),
                    };
                    self.state.set_as(&rebalance_key(&name), &failed).await?;
                    report.failed.push(name);
                }
            }
        }

        if report.deferred.is_empty() {
            self.state.set("cluster_hash", &json!(hash)).await?;
        }
        Ok(report)
    }

    /// Move running rebalances to completed or failed once their commands settle
    pub async fn advance_rebalances(&self) -> Result<()> {
        let records: Vec<(String, RebalanceRecord)> =
            self.state.list_prefixed(REBALANCE_PREFIX).await?;

        for (name, mut record) in records
            .into_iter()
            .filter(|(_, r)| r.status == RebalanceStatus::Running)
        {
            let items = self.queue.items(&record.queue_ids).await?;
            let exhausted = items
                .iter()
                .find(|item| {
                    item.status == QueueStatus::Error && item.tries >= self.queue.max_tries()
                });
            let finished = items.len() == record.queue_ids.len()
                && items.iter().all(|item| item.status == QueueStatus::Processed);

            if let Some(item) = exhausted {
                record.status = RebalanceStatus::Failed;
                record.error = Some(format!(
                    "command {} failed permanently: {}",
                    item.id, item.query
                ));
            } else if finished {
                record.status = RebalanceStatus::Completed;
            } else {
                continue;
            }

            let now = now_secs();
            record.updated_at = now;
            self.state.set_as(&rebalance_key(&name), &record).await?;

            let success = record.status == RebalanceStatus::Completed;
            metrics::record_rebalance_completion(
                success,
                Duration::from_secs(now.saturating_sub(record.started_at)),
            );
            info!(table = %name, status = record.status.as_str(), "Rebalance finished");
        }
        Ok(())
    }

    /// Mark a table operation done once none of its commands is still waiting
    pub async fn check_table_status(&self, name: &str) -> Result<Option<TableRecord>> {
        let Some(mut record) = self.state.get_as::<TableRecord>(&table_key(name)).await? else {
            return Ok(None);
        };
        if record.is_done() {
            return Ok(Some(record));
        }

        let statuses = self.queue.statuses(&record.queue_ids).await?;
        let waiting = record
            .queue_ids
            .iter()
            .any(|id| statuses.get(id).map_or(true, |s| *s == QueueStatus::Created));
        if waiting {
            return Ok(Some(record));
        }

        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for status in statuses.values() {
            *counts.entry(status.as_str()).or_default() += 1;
        }
        let mut result = match record.result.take() {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        result.insert("statuses".to_string(), json!(counts));

        record.result = Value::Object(result);
        record.status = OperationStatus::Done;
        record.updated_at = now_secs();
        self.state.set_as(&table_key(name), &record).await?;

        metrics::record_table_operation(record.kind.as_str(), "done");
        info!(table = %name, kind = record.kind.as_str(), "Table operation done");
        Ok(Some(record))
    }

    async fn check_table_statuses(&self) -> Result<()> {
        let records: Vec<(String, TableRecord)> = self.state.list_prefixed(TABLE_PREFIX).await?;
        for (name, _) in records.into_iter().filter(|(_, r)| !r.is_done()) {
            self.check_table_status(&name).await?;
        }
        Ok(())
    }

    /// Execute this node's ready queue items
    pub async fn process_queue(&self) -> Result<ProcessReport> {
        self.queue.process(self.node_id()).await
    }

    /// Current progress record of a table
    pub async fn table_status(&self, name: &str) -> Result<Option<TableRecord>> {
        self.state.get_as(&table_key(name)).await
    }

    async fn check_cluster_binding(&self, requested: &str) -> Result<()> {
        let bound = self.state.get_string("cluster").await?;
        if bound != requested {
            return Err(ShardingError::ClusterMismatch {
                bound,
                requested: requested.to_string(),
            });
        }
        Ok(())
    }

    fn validate_names(cluster: &str, name: &str) -> Result<()> {
        validate_identifier(name)?;
        if !cluster.is_empty() {
            validate_identifier(cluster)?;
        }
        Ok(())
    }

    /// Create the State, Queue and schema tables and claim mastership
    async fn bootstrap(&self, cluster: &str) -> Result<()> {
        self.cluster.set_name(cluster);
        self.state.setup().await?;
        self.queue.setup().await?;
        Table::setup_schema_table(self.client.as_ref(), &self.cluster, &self.config.tables.schema)
            .await?;

        self.state.set("cluster", &json!(cluster)).await?;
        self.heartbeat().await?;
        self.state.set("master", &json!(self.node_id())).await?;
        let hash = get_nodes_hash(&self.active_nodes().await?);
        self.state.set("cluster_hash", &json!(hash)).await?;

        info!(cluster = %cluster, node = %self.node_id(), "Sharding initialized");
        Ok(())
    }

    /// Validate a create request and queue the sharded table
    pub async fn shard_table(&self, request: &ShardRequest) -> Result<TableRecord> {
        Self::validate_names(&request.cluster, &request.name)?;
        let options = &request.options;
        if options.shards == 0 {
            return Err(ShardingError::InvalidOptions("shards must be at least 1".into()));
        }
        if options.rf == 0 {
            return Err(ShardingError::InvalidOptions("rf must be at least 1".into()));
        }
        if options.rf > 1 && request.cluster.is_empty() {
            return Err(ShardingError::InvalidOptions(
                "rf greater than 1 requires a cluster".into(),
            ));
        }

        let initialized = self.state.is_active().await?;
        let nodes = if initialized {
            self.check_cluster_binding(&request.cluster).await?;
            let existing: Option<TableRecord> = self.state.get_as(&table_key(&request.name)).await?;
            if existing.is_some_and(|record| record.is_live()) {
                return Err(ShardingError::TableExists(request.name.clone()));
            }
            self.active_nodes().await?
        } else {
            self.bootstrap_nodes(&request.cluster)
        };

        if options.rf > nodes.len() {
            return Err(ShardingError::InsufficientNodes {
                needed: options.rf,
                available: nodes.len(),
            });
        }

        if !initialized {
            self.bootstrap(&request.cluster).await?;
        }

        let table = Table::new(
            self.client.clone(),
            self.cluster.clone(),
            self.config.tables.schema.clone(),
            request.name.clone(),
            request.structure.clone(),
            request.extra.clone(),
        );
        let group = OperationGroup::new(self.queue.as_ref(), "create", &request.name);
        let node_list: Vec<String> = nodes.into_iter().collect();

        let outcome = match table.shard(&group, &node_list, options.shards, options.rf).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(table = %request.name, group = %group.name(), error = %e, "Sharding failed");
                metrics::record_table_operation("create", "failed");
                return Err(e);
            }
        };

        let record = TableRecord {
            cluster: request.cluster.clone(),
            name: request.name.clone(),
            structure: request.structure.clone(),
            extra: request.extra.clone(),
            shards: options.shards,
            rf: options.rf,
            kind: OperationType::Create,
            status: OperationStatus::Processing,
            queue_ids: outcome.queue_ids,
            result: json!({ "operation_group": group.name(), "nodes": outcome.nodes }),
            updated_at: now_secs(),
        };
        self.state.set_as(&table_key(&request.name), &record).await?;
        self.state.delete(&rebalance_key(&request.name)).await?;

        metrics::record_table_operation("create", "queued");
        Ok(record)
    }

    /// Validate a drop request and queue removal of the sharded table
    pub async fn drop_table(&self, request: &DropRequest) -> Result<TableRecord> {
        Self::validate_names(&request.cluster, &request.name)?;
        if !self.state.is_active().await? {
            return Err(ShardingError::TableNotFound(request.name.clone()));
        }
        self.check_cluster_binding(&request.cluster).await?;

        let Some(mut record) = self
            .state
            .get_as::<TableRecord>(&table_key(&request.name))
            .await?
            .filter(TableRecord::is_live)
        else {
            return Err(ShardingError::TableNotFound(request.name.clone()));
        };

        let table = self.table_from(&record);
        let group = OperationGroup::new(self.queue.as_ref(), "drop", &request.name);
        let outcome = table.drop(&group).await?;

        record.kind = OperationType::Drop;
        record.status = OperationStatus::Processing;
        record.queue_ids = outcome.queue_ids;
        record.result = json!({ "operation_group": group.name(), "nodes": outcome.nodes });
        record.updated_at = now_secs();
        self.state.set_as(&table_key(&request.name), &record).await?;
        self.state.delete(&rebalance_key(&request.name)).await?;

        metrics::record_table_operation("drop", "queued");
        Ok(record)
    }

    /// Poll a table record until it is done or `timeout` expires
    ///
    /// Expiry does not stop the queue; the operation keeps going in the background.
    pub async fn wait_for_table(&self, name: &str, timeout: Duration) -> Result<TableRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.check_table_status(name).await? {
                Some(record) if record.is_done() => return Ok(record),
                Some(_) => {}
                None => return Err(ShardingError::TableNotFound(name.to_string())),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ShardingError::WaitTimeout(format!("table {}", name)));
            }
            let poll = self.config.cluster.wait_poll_interval().min(deadline - now);
            tokio::time::sleep(poll).await;
        }
    }

    /// Queue a sharded table and wait for it when the request carries a timeout
    pub async fn create_table(&self, request: &ShardRequest) -> Result<TableRecord> {
        let record = self.shard_table(request).await?;
        match request.options.timeout {
            Some(secs) => {
                self.wait_for_table(&request.name, Duration::from_secs(secs))
                    .await
            }
            None => Ok(record),
        }
    }

    pub async fn rollback_operation_group(&self, group: &str) -> Result<RollbackReport> {
        self.queue.rollback_operation_group(group).await
    }
}

fn note_error(report: &mut TickReport, step: &'static str, error: &ShardingError) {
    warn!(step = step, error = %error, "Tick step failed");
    metrics::record_tick_error(step, error.error_type());
    report.errors.push(format!("{}: {}", step, error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryResponse;
    use crate::state::state_id;
    use crate::testing::{rows, ScriptedClient};
    use crate::time::now_millis;

    const SELF_ID: &str = "10.0.0.1:9308";

    fn operator(client: Arc<ScriptedClient>, config: ShardingConfig) -> Operator {
        Operator::with_node_id(config, client, SELF_ID)
    }

    fn request(cluster: &str, name: &str, shards: u32, rf: usize) -> ShardRequest {
        ShardRequest {
            cluster: cluster.to_string(),
            name: name.to_string(),
            structure: "title text".to_string(),
            extra: String::new(),
            options: ShardOptions {
                shards,
                rf,
                timeout: None,
            },
        }
    }

    fn value_row(value: Value) -> QueryResponse {
        rows(vec![json!({ "value": value.to_string() })])
    }

    fn is_lookup(query: &str, key: &str) -> bool {
        query.starts_with("SELECT value") && query.contains(&format!("id = {}", state_id(key)))
    }

    #[tokio::test]
    async fn test_validation_rejects_before_queueing() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(QueryResponse::default())));
        let operator = operator(client.clone(), ShardingConfig::default());

        let cases = vec![
            request("", "bad name", 2, 1),
            request("", "t", 0, 1),
            request("", "t", 2, 0),
            request("", "t", 2, 2),
            request("main", "t", 2, 3),
        ];
        for case in cases {
            let err = operator.shard_table(&case).await.unwrap_err();
            assert!(err.is_validation(), "{:?} gave {}", case, err);
        }
        assert!(client.queries_matching("INSERT INTO").is_empty());
        assert!(client.queries_matching("CREATE TABLE").is_empty());
    }

    #[tokio::test]
    async fn test_first_table_bootstraps_single_node() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(QueryResponse::affected(1))));
        let operator = operator(client.clone(), ShardingConfig::default());

        let record = operator.shard_table(&request("", "products", 3, 1)).await.unwrap();

        assert_eq!(record.kind, OperationType::Create);
        assert_eq!(record.status, OperationStatus::Processing);
        assert_eq!(record.queue_ids.len(), 4);
        assert!(record.result["operation_group"]
            .as_str()
            .unwrap()
            .starts_with("create:products:"));

        assert_eq!(client.queries_matching("CREATE TABLE sharding_state").len(), 1);
        assert_eq!(client.queries_matching("CREATE TABLE system.sharding_queue").len(), 1);
        assert_eq!(client.queries_matching("CREATE TABLE system.sharding_table").len(), 1);
        assert!(client.queries_matching("ALTER CLUSTER").is_empty());

        let queued = client.queries_matching("INSERT INTO system.sharding_queue");
        assert_eq!(queued.len(), 4);
        assert!(queued.iter().all(|q| q.contains("'10.0.0.1:9308'")));
    }

    #[tokio::test]
    async fn test_drop_unknown_table() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(QueryResponse::default())));
        let operator = operator(client, ShardingConfig::default());

        let result = operator
            .drop_table(&DropRequest {
                cluster: String::new(),
                name: "t".into(),
            })
            .await;
        assert!(matches!(result, Err(ShardingError::TableNotFound(_))));
    }

    #[tokio::test]
    async fn test_cluster_mismatch() {
        let client = Arc::new(ScriptedClient::new(|query| {
            if query.starts_with("SHOW TABLES") {
                Ok(rows(vec![json!({"Table": "sharding_state"})]))
            } else if is_lookup(query, "cluster") {
                Ok(value_row(json!("main")))
            } else {
                Ok(QueryResponse::default())
            }
        }));
        let operator = operator(client, ShardingConfig::default());

        let result = operator.shard_table(&request("other", "t", 2, 1)).await;
        assert!(matches!(result, Err(ShardingError::ClusterMismatch { .. })));
    }

    fn master_engine(master: &'static str, master_seen_at: u64) -> Arc<ScriptedClient> {
        let now = now_millis();
        Arc::new(ScriptedClient::new(move |query| {
            if is_lookup(query, "master") {
                Ok(value_row(json!(master)))
            } else if query.contains("'^node:.+'") {
                Ok(rows(vec![
                    json!({"key": format!("node:{}", SELF_ID), "value": json!({"seen_at": now, "status": "online"}).to_string()}),
                    json!({"key": format!("node:{}", master), "value": json!({"seen_at": master_seen_at, "status": "online"}).to_string()}),
                ]))
            } else {
                Ok(QueryResponse::affected(1))
            }
        }))
    }

    #[tokio::test]
    async fn test_takeover_after_grace() {
        let client = master_engine("10.0.0.9:9308", 1);
        let mut config = ShardingConfig::default();
        config.cluster.master_takeover_grace_ms = 0;
        let operator = operator(client.clone(), config);
        operator.cluster().set_name("main");

        assert!(operator.check_master().await.unwrap());
        let writes = client.queries_matching("REPLACE INTO main:sharding_state");
        assert_eq!(writes.len(), 1);
        assert!(writes[0].contains(&state_id("master").to_string()));
    }

    #[tokio::test]
    async fn test_no_takeover_within_grace() {
        let client = master_engine("10.0.0.9:9308", 1);
        let operator = operator(client.clone(), ShardingConfig::default());
        operator.cluster().set_name("main");

        assert!(!operator.check_master().await.unwrap());
        assert!(client.queries_matching("REPLACE INTO").is_empty());
    }

    #[tokio::test]
    async fn test_live_master_is_kept() {
        let client = master_engine("10.0.0.0:9308", now_millis());
        let mut config = ShardingConfig::default();
        config.cluster.master_takeover_grace_ms = 0;
        let operator = operator(client.clone(), config);
        operator.cluster().set_name("main");

        assert!(!operator.check_master().await.unwrap());
        assert!(client.queries_matching("REPLACE INTO").is_empty());
    }

    fn status_engine(status: &'static str) -> Arc<ScriptedClient> {
        Arc::new(ScriptedClient::new(move |query| {
            if is_lookup(query, "table:products") {
                Ok(value_row(json!({
                    "cluster": "",
                    "name": "products",
                    "shards": 2,
                    "rf": 1,
                    "type": "create",
                    "status": "processing",
                    "queue_ids": [1, 2],
                    "result": {"operation_group": "create:products:x"}
                })))
            } else if query.contains("WHERE id IN") {
                Ok(rows(vec![
                    json!({"id": 1, "status": "processed"}),
                    json!({"id": 2, "status": status}),
                ]))
            } else {
                Ok(QueryResponse::affected(1))
            }
        }))
    }

    #[tokio::test]
    async fn test_table_done_when_nothing_waits() {
        let client = status_engine("processing");
        let operator = operator(client.clone(), ShardingConfig::default());

        let record = operator.check_table_status("products").await.unwrap().unwrap();

        assert!(record.is_done());
        assert_eq!(record.result["statuses"]["processed"], json!(1));
        assert_eq!(record.result["operation_group"], json!("create:products:x"));
        assert_eq!(client.queries_matching("REPLACE INTO").len(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_while_created() {
        let client = status_engine("created");
        let mut config = ShardingConfig::default();
        config.cluster.wait_poll_interval_ms = 5;
        let operator = operator(client, config);

        let result = operator
            .wait_for_table("products", Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(ShardingError::WaitTimeout(_))));
    }

    #[tokio::test]
    async fn test_tick_idle_before_initialization() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(QueryResponse::default())));
        let operator = operator(client.clone(), ShardingConfig::default());

        let report = operator.tick().await;
        assert!(!report.active);
        assert_eq!(client.queries().len(), 1);
    }
}
