//! Sharded table orchestration
//!
//! Turns a placement into queued DDL: per-shard local tables, replication
//! groups for shards with more than one copy, and a distributed routing table
//! on every node. Nothing runs here directly; every statement goes through a
//! [`CommandQueue`] and is executed by the coordinator of the target node.
//!
//! # Naming
//!
//! - Shard table: `system.<name>_s<shard>`
//! - Replication group: `c_<16 hex of sha256(sorted peers)>`, so every node
//!   computing the same peer set derives the same name
//! - Temporary copy group: `temp_move_<shard>_<unix secs>`

use crate::client::{row_string, Row, SqlClient};
use crate::cluster::{temp_move_name, Cluster};
use crate::error::Result;
use crate::placement::{create_sharding_schema, rebalance_sharding_scheme, ShardRow, ShardingSchema};
use crate::queue::{CommandQueue, QueueCommand};
use crate::records::{OperationStatus, OperationType, TableRecord};
use crate::sql::{quote_identifier, quote_string};
use crate::time::now_secs;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info};

const SCHEMA_LIMIT: usize = 10_000;

/// Replication group name of a peer set
pub fn get_cluster_name(connections: &BTreeSet<String>) -> String {
    let joined = connections
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let digest = hex::encode(Sha256::digest(joined.as_bytes()));
    format!("c_{}", &digest[..16])
}

/// What an orchestration run queued
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardingOutcome {
    pub status: OperationStatus,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub nodes: BTreeSet<String>,
    pub queue_ids: Vec<u64>,
}

impl ShardingOutcome {
    fn processing(kind: OperationType, nodes: BTreeSet<String>, queue_ids: Vec<u64>) -> Self {
        Self {
            status: OperationStatus::Processing,
            kind,
            nodes,
            queue_ids,
        }
    }
}

fn parse_shards(value: Option<&Value>) -> BTreeSet<u32> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_u64().or_else(|| v.as_str()?.trim().parse().ok()))
            .map(|v| v as u32)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect(),
        Some(Value::Number(n)) => n.as_u64().map(|v| v as u32).into_iter().collect(),
        _ => BTreeSet::new(),
    }
}

fn drop_table_query(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_identifier(table))
}

/// One sharded table
pub struct Table {
    client: Arc<dyn SqlClient>,
    cluster: Arc<Cluster>,
    schema_table: String,
    name: String,
    structure: String,
    extra: String,
}

impl Table {
    pub fn new(
        client: Arc<dyn SqlClient>,
        cluster: Arc<Cluster>,
        schema_table: impl Into<String>,
        name: impl Into<String>,
        structure: impl Into<String>,
        extra: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cluster,
            schema_table: schema_table.into(),
            name: name.into(),
            structure: structure.into(),
            extra: extra.into(),
        }
    }

    /// Rebuild a table handle from its progress record
    pub fn from_record(
        client: Arc<dyn SqlClient>,
        cluster: Arc<Cluster>,
        schema_table: impl Into<String>,
        record: &TableRecord,
    ) -> Self {
        Self::new(
            client,
            cluster,
            schema_table,
            record.name.clone(),
            record.structure.clone(),
            record.extra.clone(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local table holding one shard
    pub fn shard_table_name(&self, shard: u32) -> String {
        format!("system.{}_s{}", self.name, shard)
    }

    fn create_shard_table_query(&self, shard: u32) -> String {
        let mut query = format!(
            "CREATE TABLE IF NOT EXISTS {}",
            quote_identifier(&self.shard_table_name(shard))
        );
        let structure = self.structure.trim();
        if !structure.is_empty() {
            query.push_str(&format!(" ({})", structure));
        }
        let extra = self.extra.trim();
        if !extra.is_empty() {
            query.push(' ');
            query.push_str(extra);
        }
        query
    }

    /// Routing table for `node`: local shards by name, remote shards as agents
    fn distributed_table_query(&self, node: &str, schema: &ShardingSchema) -> String {
        let mut query = format!("CREATE TABLE {} type='distributed'", quote_identifier(&self.name));
        for (shard, holders) in schema.holders_by_shard() {
            let table = self.shard_table_name(shard);
            if holders.contains(node) {
                query.push_str(&format!(" local={}", quote_string(&table)));
            } else {
                let mirrors = holders
                    .iter()
                    .map(|holder| format!("{}:{}", holder, table))
                    .collect::<Vec<_>>()
                    .join("|");
                query.push_str(&format!(" agent={}", quote_string(&mirrors)));
            }
        }
        query
    }

    /// Create the schema table and attach it to the bound cluster
    pub async fn setup_schema_table(
        client: &dyn SqlClient,
        cluster: &Cluster,
        schema_table: &str,
    ) -> Result<()> {
        if client.has_table(schema_table).await? {
            return Ok(());
        }
        let query = format!(
            "CREATE TABLE {} (cluster string, node string, `table` string, shards multi)",
            quote_identifier(schema_table)
        );
        client.send_request(&query).await?;
        cluster.attach_local(client, schema_table).await
    }

    fn schema_filter(&self) -> String {
        format!(
            "cluster = {} AND `table` = {}",
            quote_string(&self.cluster.name()),
            quote_string(&self.name)
        )
    }

    /// Read the persisted placement of this table
    pub async fn get_shard_schema(&self) -> Result<ShardingSchema> {
        let query = format!(
            "SELECT node, shards FROM {} WHERE {} LIMIT {}",
            quote_identifier(&self.schema_table),
            self.schema_filter(),
            SCHEMA_LIMIT
        );
        let response = self.client.send_request(&query).await?;

        let mut rows: BTreeMap<String, ShardRow> = BTreeMap::new();
        for row in &response.data {
            let node = row_string(row, "node");
            let shards = shards_of(row);
            rows.entry(node.clone())
                .or_insert_with(|| ShardRow::new(node))
                .shards
                .extend(shards);
        }
        Ok(ShardingSchema::from_rows(rows.into_values().collect()))
    }

    async fn delete_schema(&self) -> Result<()> {
        let query = format!(
            "DELETE FROM {} WHERE {}",
            self.cluster.table_ref(&self.schema_table),
            self.schema_filter()
        );
        self.client.send_request(&query).await?;
        Ok(())
    }

    async fn persist_schema(&self, schema: &ShardingSchema) -> Result<()> {
        self.delete_schema().await?;

        let values: Vec<String> = schema
            .rows()
            .iter()
            .filter(|row| !row.shards.is_empty())
            .map(|row| {
                let shards = row
                    .shards
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    "({}, {}, {}, ({}))",
                    quote_string(&self.cluster.name()),
                    quote_string(&row.node),
                    quote_string(&self.name),
                    shards
                )
            })
            .collect();
        if values.is_empty() {
            return Ok(());
        }

        let query = format!(
            "INSERT INTO {} (cluster, node, `table`, shards) VALUES {}",
            self.cluster.table_ref(&self.schema_table),
            values.join(", ")
        );
        self.client.send_request(&query).await?;
        Ok(())
    }

    /// Queue creation of the routing table on every node in `nodes`
    async fn queue_routing(
        &self,
        queue: &dyn CommandQueue,
        schema: &ShardingSchema,
        nodes: &BTreeSet<String>,
        replace: bool,
        wait_for: Option<u64>,
        queue_ids: &mut Vec<u64>,
    ) -> Result<()> {
        for node in nodes {
            if replace {
                let command = QueueCommand::new(node.as_str(), drop_table_query(&self.name), "")
                    .wait_for(wait_for);
                queue_ids.push(queue.add(command).await?);
            }
            let command =
                QueueCommand::reversible(node.as_str(), self.distributed_table_query(node, schema))
                    .wait_for(wait_for);
            queue_ids.push(queue.add(command).await?);
        }
        Ok(())
    }

    /// Place the table on `nodes` and queue everything needed to create it
    pub async fn shard(
        &self,
        queue: &dyn CommandQueue,
        nodes: &[String],
        shard_count: u32,
        rf: usize,
    ) -> Result<ShardingOutcome> {
        let schema = create_sharding_schema(nodes, shard_count, rf)?;
        self.persist_schema(&schema).await?;

        let mut queue_ids = Vec::new();
        for row in schema.rows() {
            for shard in &row.shards {
                let query = self.create_shard_table_query(*shard);
                let command = QueueCommand::reversible(row.node.as_str(), query);
                queue_ids.push(queue.add(command).await?);
            }
        }

        if rf > 1 {
            let mut groups: BTreeMap<String, (Cluster, u64)> = BTreeMap::new();
            for (shard, holders) in schema.holders_by_shard() {
                let Some(creator) = holders.iter().next().cloned() else {
                    continue;
                };
                let name = get_cluster_name(&holders);
                if !groups.contains_key(&name) {
                    let cluster = Cluster::new(name.clone());
                    let create_id = cluster.create(queue, &creator, None).await?;
                    let peers: Vec<String> = holders.iter().cloned().collect();
                    let joins = cluster.add_node_ids(queue, &creator, create_id, &peers).await?;
                    queue_ids.push(create_id);
                    queue_ids.extend(&joins);
                    let ready = joins.last().copied().unwrap_or(create_id);
                    groups.insert(name.clone(), (cluster, ready));
                }
                if let Some((cluster, ready)) = groups.get(&name) {
                    let table = self.shard_table_name(shard);
                    let attached = cluster
                        .attach_table(queue, &creator, &table, Some(*ready))
                        .await?;
                    queue_ids.extend(attached);
                }
            }
            debug!(table = %self.name, groups = groups.len(), "Replication groups queued");
        }

        let ready = queue_ids.iter().max().copied();
        let routed = schema.nodes_with_shards();
        self.queue_routing(queue, &schema, &routed, false, ready, &mut queue_ids)
            .await?;

        info!(
            table = %self.name,
            shards = shard_count,
            rf = rf,
            commands = queue_ids.len(),
            "Sharded table creation queued"
        );
        Ok(ShardingOutcome::processing(
            OperationType::Create,
            schema.nodes_with_shards(),
            queue_ids,
        ))
    }

    /// Queue removal of every shard, group and routing table
    pub async fn drop(&self, queue: &dyn CommandQueue) -> Result<ShardingOutcome> {
        let schema = self.get_shard_schema().await?;
        let holders = schema.holders_by_shard();
        let mut queue_ids = Vec::new();

        for node in schema.nodes_with_shards() {
            let id = queue
                .add(QueueCommand::reversible(node.as_str(), drop_table_query(&self.name)))
                .await?;
            queue_ids.push(id);
        }

        // detach each physical table once, then dissolve its group
        let mut processed_tables: BTreeSet<String> = BTreeSet::new();
        let mut groups: BTreeMap<String, (String, u64)> = BTreeMap::new();
        for (shard, nodes) in holders.iter().filter(|(_, nodes)| nodes.len() > 1) {
            let table = self.shard_table_name(*shard);
            if !processed_tables.insert(table.clone()) {
                continue;
            }
            let Some(creator) = nodes.iter().next() else {
                continue;
            };
            let cluster = Cluster::new(get_cluster_name(nodes));
            let previous = groups.get(&cluster.name()).map(|(_, id)| *id);
            let ids = cluster.remove_tables(queue, creator, &[table], previous).await?;
            queue_ids.extend(&ids);
            if let Some(last) = ids.last() {
                groups.insert(cluster.name(), (creator.clone(), *last));
            }
        }

        let mut dissolved: BTreeMap<String, u64> = BTreeMap::new();
        for (name, (creator, last)) in &groups {
            let id = Cluster::new(name.clone()).delete(queue, creator, Some(*last)).await?;
            queue_ids.push(id);
            dissolved.insert(name.clone(), id);
        }

        for row in schema.rows() {
            for shard in &row.shards {
                let wait_for = holders
                    .get(shard)
                    .filter(|nodes| nodes.len() > 1)
                    .and_then(|nodes| dissolved.get(&get_cluster_name(nodes)))
                    .copied();
                let command = QueueCommand::reversible(
                    row.node.as_str(),
                    drop_table_query(&self.shard_table_name(*shard)),
                )
                .wait_for(wait_for);
                queue_ids.push(queue.add(command).await?);
            }
        }

        self.delete_schema().await?;
        info!(table = %self.name, commands = queue_ids.len(), "Sharded table drop queued");
        Ok(ShardingOutcome::processing(
            OperationType::Drop,
            schema.nodes(),
            queue_ids,
        ))
    }

    /// Move shards off inactive nodes
    ///
    /// Returns `None` when no node of the current placement is inactive.
    pub async fn rebalance(
        &self,
        queue: &dyn CommandQueue,
        active: &BTreeSet<String>,
    ) -> Result<Option<ShardingOutcome>> {
        let schema = self.get_shard_schema().await?;
        if schema.is_empty() {
            return Ok(None);
        }
        let inactive: BTreeSet<String> = schema.nodes().difference(active).cloned().collect();
        if inactive.is_empty() {
            debug!(table = %self.name, "No inactive nodes, nothing to rebalance");
            return Ok(None);
        }

        let target = rebalance_sharding_scheme(&schema, active)?;
        let before = schema.holders_by_shard();
        let after = target.holders_by_shard();

        let mut run = RebalanceRun {
            existing: before
                .values()
                .filter(|nodes| nodes.len() > 1 && nodes.is_subset(active))
                .map(get_cluster_name)
                .collect(),
            formed: BTreeMap::new(),
            queue_ids: Vec::new(),
        };
        let mut retired: BTreeMap<String, (String, u64)> = BTreeMap::new();
        let started = now_secs();

        for (shard, old) in &before {
            let new = after.get(shard).cloned().unwrap_or_default();
            if *old == new {
                continue;
            }
            let table = self.shard_table_name(*shard);

            for dead in old.difference(active) {
                // unreachable nodes run this only if they come back
                queue
                    .add(QueueCommand::new(dead.as_str(), drop_table_query(&table), ""))
                    .await?;
            }

            let surviving: BTreeSet<String> = old.intersection(active).cloned().collect();
            let Some(source) = surviving.iter().next().cloned() else {
                error!(
                    table = %self.name,
                    shard = shard,
                    lost = ?old,
                    "No surviving replica, shard recreated empty"
                );
                for node in &new {
                    let query = self.create_shard_table_query(*shard);
                    let command = QueueCommand::reversible(node.as_str(), query);
                    run.queue_ids.push(queue.add(command).await?);
                }
                if let Some(creator) = new.iter().next().cloned() {
                    if new.len() > 1 {
                        self.form_group(queue, &mut run, &new, &creator, &table, None).await?;
                    }
                }
                continue;
            };

            let mut last: Option<u64> = None;
            let mut old_name: Option<String> = None;
            if old.len() > 1 {
                let old_group = Cluster::new(get_cluster_name(old));
                let primary = old_group.make_primary(queue, &source, None).await?;
                run.queue_ids.push(primary);
                let detached = old_group
                    .remove_tables(queue, &source, &[table.clone()], Some(primary))
                    .await?;
                run.queue_ids.extend(&detached);
                last = detached.last().copied().or(Some(primary));

                // detached copies on other survivors are replaced by a fresh copy
                let mut dropped = Vec::new();
                for other in surviving.iter().filter(|node| **node != source) {
                    let command = QueueCommand::new(other.as_str(), drop_table_query(&table), "")
                        .wait_for(last);
                    dropped.push(queue.add(command).await?);
                }
                run.queue_ids.extend(&dropped);
                last = dropped.iter().max().copied().or(last);

                if let Some(id) = last {
                    let name = old_group.name();
                    retire(&mut retired, &name, &source, id);
                    old_name = Some(name);
                }
            }

            if new.contains(&source) {
                if new.len() > 1 {
                    let attached = self
                        .form_group(queue, &mut run, &new, &source, &table, last)
                        .await?;
                    if let (Some(name), Some(id)) = (&old_name, attached) {
                        retire(&mut retired, name, &source, id);
                    }
                }
                continue;
            }

            let temp = Cluster::new(temp_move_name(*shard, started));
            let create_id = temp.create(queue, &source, last).await?;
            let attached = temp
                .attach_table(queue, &source, &table, Some(create_id))
                .await?
                .unwrap_or(create_id);
            let receivers: Vec<String> = new.iter().cloned().collect();
            let joins = temp.add_node_ids(queue, &source, attached, &receivers).await?;
            let copied = joins.last().copied().unwrap_or(attached);
            let detached = temp
                .remove_tables(queue, &source, &[table.clone()], Some(copied))
                .await?;
            let deleted = temp.delete(queue, &source, detached.last().copied()).await?;
            let dropped = queue
                .add(
                    QueueCommand::new(source.as_str(), drop_table_query(&table), "")
                        .wait_for(deleted),
                )
                .await?;

            run.queue_ids.push(create_id);
            run.queue_ids.push(attached);
            run.queue_ids.extend(&joins);
            run.queue_ids.extend(&detached);
            run.queue_ids.push(deleted);
            run.queue_ids.push(dropped);
            info!(
                table = %self.name,
                shard = shard,
                from = %source,
                to = ?new,
                "Shard move queued"
            );

            let mut settled = dropped;
            if let Some(creator) = new.iter().next().cloned() {
                if new.len() > 1 {
                    let attached = self
                        .form_group(queue, &mut run, &new, &creator, &table, Some(deleted))
                        .await?;
                    settled = attached.map_or(settled, |id| id.max(settled));
                }
            }
            if let Some(name) = &old_name {
                retire(&mut retired, name, &source, settled);
            }
        }

        let target_groups: BTreeSet<String> = after
            .values()
            .filter(|nodes| nodes.len() > 1)
            .map(get_cluster_name)
            .collect();
        for (name, (member, last)) in retired {
            if target_groups.contains(&name) {
                continue;
            }
            let id = Cluster::new(name).delete(queue, &member, Some(last)).await?;
            run.queue_ids.push(id);
        }

        let ready = run.queue_ids.iter().max().copied();
        let mut queue_ids = run.queue_ids;
        self.queue_routing(queue, &target, &target.nodes(), true, ready, &mut queue_ids)
            .await?;
        self.persist_schema(&target).await?;

        info!(
            table = %self.name,
            inactive = ?inactive,
            commands = queue_ids.len(),
            "Rebalance queued"
        );
        Ok(Some(ShardingOutcome::processing(
            OperationType::Rebalance,
            target.nodes(),
            queue_ids,
        )))
    }

    /// Make `holders` one replication group carrying `table`
    ///
    /// Reuses a group that already exists or was formed earlier in this run.
    /// Returns the id after which `table` is attached.
    async fn form_group(
        &self,
        queue: &dyn CommandQueue,
        run: &mut RebalanceRun,
        holders: &BTreeSet<String>,
        creator: &str,
        table: &str,
        wait_for: Option<u64>,
    ) -> Result<Option<u64>> {
        let name = get_cluster_name(holders);

        if run.existing.contains(&name) {
            let cluster = Cluster::new(name);
            let attached = cluster.attach_table(queue, creator, table, wait_for).await?;
            run.queue_ids.extend(attached);
            return Ok(attached.or(wait_for));
        }

        if !run.formed.contains_key(&name) {
            let cluster = Cluster::new(name.clone());
            let create_id = cluster.create(queue, creator, wait_for).await?;
            let peers: Vec<String> = holders.iter().cloned().collect();
            let joins = cluster.add_node_ids(queue, creator, create_id, &peers).await?;
            run.queue_ids.push(create_id);
            run.queue_ids.extend(&joins);
            let ready = joins.last().copied().unwrap_or(create_id);
            run.formed.insert(name.clone(), (cluster, ready));
        }

        let Some((cluster, ready)) = run.formed.get(&name) else {
            return Ok(wait_for);
        };
        let after = wait_for.map_or(*ready, |id| id.max(*ready));
        let attached = cluster.attach_table(queue, creator, table, Some(after)).await?;
        run.queue_ids.extend(attached);
        Ok(attached.or(Some(after)))
    }
}

/// Track the member and latest id a retired group must wait for before deletion
fn retire(retired: &mut BTreeMap<String, (String, u64)>, group: &str, member: &str, id: u64) {
    retired
        .entry(group.to_string())
        .and_modify(|(_, last)| *last = (*last).max(id))
        .or_insert_with(|| (member.to_string(), id));
}

/// Bookkeeping of one rebalance pass
struct RebalanceRun {
    /// Groups that already run in the engine and survive the rebalance
    existing: BTreeSet<String>,
    /// Groups created in this run, with the id their members are ready after
    formed: BTreeMap<String, (Cluster, u64)>,
    queue_ids: Vec<u64>,
}

fn shards_of(row: &Row) -> BTreeSet<u32> {
    parse_shards(row.get("shards"))
}
