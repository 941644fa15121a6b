//! Replication groups
//!
//! A [`Cluster`] is one replication group of the engine. The coordinator's own
//! cluster (the one its State/Queue tables replicate through) also answers
//! membership questions; per-shard groups created during orchestration only
//! emit DDL through the command queue.

use crate::client::{row_string, SqlClient};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::node::Node;
use crate::queue::{CommandQueue, QueueCommand};
use crate::sql::{quote_identifier, quote_string};
use crate::state::State;
use crate::time::now_millis;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Name prefix of clusters created only to copy a shard between nodes
pub const TEMP_MOVE_PREFIX: &str = "temp_move_";

/// Name of a temporary move cluster for `shard` created at `unix_secs`
pub fn temp_move_name(shard: u32, unix_secs: u64) -> String {
    format!("{}{}_{}", TEMP_MOVE_PREFIX, shard, unix_secs)
}

/// Creation time embedded in a temporary move cluster name
pub fn temp_move_created_at(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(TEMP_MOVE_PREFIX)?;
    let (_, ts) = rest.rsplit_once('_')?;
    ts.parse().ok()
}

/// Stable hash of a node set, independent of input order
pub fn get_nodes_hash<'a>(nodes: impl IntoIterator<Item = &'a String>) -> String {
    let sorted: BTreeSet<&String> = nodes.into_iter().collect();
    let joined = sorted
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Cluster names known to the local engine
pub async fn list_engine_clusters(client: &dyn SqlClient) -> Result<Vec<String>> {
    let response = client
        .send_request("SHOW STATUS LIKE 'cluster_%_name'")
        .await?;
    Ok(response
        .data
        .iter()
        .map(|row| row_string(row, "Value"))
        .filter(|name| !name.is_empty())
        .collect())
}

pub struct Cluster {
    name: RwLock<String>,
    seed_nodes: Vec<String>,
    heartbeat_timeout_ms: u64,
    pending_tables: Mutex<BTreeSet<String>>,
}

impl Cluster {
    /// A replication group with default membership settings
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &ClusterConfig::default())
    }

    pub fn from_config(name: impl Into<String>, config: &ClusterConfig) -> Self {
        Self {
            name: RwLock::new(name.into()),
            seed_nodes: config.seed_nodes.clone(),
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            pending_tables: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Bind to a cluster name read back from State
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn is_bound(&self) -> bool {
        !self.name.read().is_empty()
    }

    /// Render a table reference for replicated writes (`cluster:table`)
    pub fn table_ref(&self, table: &str) -> String {
        let name = self.name.read();
        if name.is_empty() {
            quote_identifier(table)
        } else {
            format!("{}:{}", quote_identifier(&name), quote_identifier(table))
        }
    }

    pub fn has_pending_table(&self, table: &str) -> bool {
        self.pending_tables.lock().contains(table)
    }

    pub fn add_pending_table(&self, table: &str) {
        self.pending_tables.lock().insert(table.to_string());
    }

    /// Attach a local table right away, bypassing the queue (bootstrap only)
    pub async fn attach_local(&self, client: &dyn SqlClient, table: &str) -> Result<()> {
        if !self.is_bound() {
            return Ok(());
        }
        let query = format!(
            "ALTER CLUSTER {} ADD {}",
            quote_identifier(&self.name()),
            quote_identifier(table)
        );
        client.send_request(&query).await?;
        Ok(())
    }

    /// Enqueue cluster creation on `node`; returns the queue id to chain on
    pub async fn create(
        &self,
        queue: &dyn CommandQueue,
        node: &str,
        wait_for: Option<u64>,
    ) -> Result<u64> {
        let name = self.name();
        let query = format!(
            "CREATE CLUSTER {} {} as path",
            quote_identifier(&name),
            quote_string(&name)
        );
        let id = queue
            .add(QueueCommand::reversible(node, query).wait_for(wait_for))
            .await?;
        info!(cluster = %name, node = node, "Cluster creation queued");
        Ok(id)
    }

    /// Enqueue a join for every peer other than the creator
    pub async fn add_node_ids(
        &self,
        queue: &dyn CommandQueue,
        creator: &str,
        create_id: u64,
        peers: &[String],
    ) -> Result<Vec<u64>> {
        let name = self.name();
        let mut ids = Vec::with_capacity(peers.len());
        for peer in peers.iter().filter(|peer| peer.as_str() != creator) {
            let query = format!(
                "JOIN CLUSTER {} AT {} {} as path",
                quote_identifier(&name),
                quote_string(creator),
                quote_string(&name)
            );
            let id = queue
                .add(QueueCommand::reversible(peer.as_str(), query).wait_for(create_id))
                .await?;
            ids.push(id);
        }
        debug!(cluster = %name, joins = ids.len(), "Cluster joins queued");
        Ok(ids)
    }

    /// Enqueue `ALTER CLUSTER .. ADD` once per table per run
    ///
    /// Returns `None` when the table is already pending attach.
    pub async fn attach_table(
        &self,
        queue: &dyn CommandQueue,
        node: &str,
        table: &str,
        wait_for: Option<u64>,
    ) -> Result<Option<u64>> {
        if self.has_pending_table(table) {
            return Ok(None);
        }
        let query = format!(
            "ALTER CLUSTER {} ADD {}",
            quote_identifier(&self.name()),
            quote_identifier(table)
        );
        let id = queue
            .add(QueueCommand::reversible(node, query).wait_for(wait_for))
            .await?;
        self.add_pending_table(table);
        Ok(Some(id))
    }

    /// Force the group on `node` to bootstrap as primary component
    pub async fn make_primary(
        &self,
        queue: &dyn CommandQueue,
        node: &str,
        wait_for: Option<u64>,
    ) -> Result<u64> {
        let query = format!(
            "SET CLUSTER {} GLOBAL 'pc.bootstrap' = 1",
            quote_identifier(&self.name())
        );
        queue
            .add(QueueCommand::new(node, query, "").wait_for(wait_for))
            .await
    }

    /// Detach tables from the group, each waiting for the previous one
    pub async fn remove_tables(
        &self,
        queue: &dyn CommandQueue,
        node: &str,
        tables: &[String],
        wait_for: Option<u64>,
    ) -> Result<Vec<u64>> {
        let name = self.name();
        let mut ids = Vec::with_capacity(tables.len());
        let mut last = wait_for;
        for table in tables {
            let query = format!(
                "ALTER CLUSTER {} DROP {}",
                quote_identifier(&name),
                quote_identifier(table)
            );
            let id = queue
                .add(QueueCommand::reversible(node, query).wait_for(last))
                .await?;
            self.pending_tables.lock().remove(table);
            ids.push(id);
            last = Some(id);
        }
        Ok(ids)
    }

    /// Enqueue deletion of the group
    pub async fn delete(
        &self,
        queue: &dyn CommandQueue,
        node: &str,
        wait_for: Option<u64>,
    ) -> Result<u64> {
        let query = format!("DELETE CLUSTER {}", quote_identifier(&self.name()));
        queue
            .add(QueueCommand::reversible(node, query).wait_for(wait_for))
            .await
    }

    /// Every known node: heartbeat records plus configured seeds
    pub async fn all_nodes(&self, state: &State) -> Result<BTreeSet<String>> {
        let mut nodes: BTreeSet<String> = Node::list(state).await?.into_keys().collect();
        nodes.extend(self.seed_nodes.iter().cloned());
        Ok(nodes)
    }

    /// Nodes that heartbeated recently; seeds without a record count as active
    pub async fn get_nodes(&self, state: &State) -> Result<BTreeSet<String>> {
        let records = Node::list(state).await?;
        let now = now_millis();

        let mut active: BTreeSet<String> = records
            .iter()
            .filter(|(_, record)| record.is_active(now, self.heartbeat_timeout_ms))
            .map(|(id, _)| id.clone())
            .collect();
        active.extend(
            self.seed_nodes
                .iter()
                .filter(|seed| !records.contains_key(*seed))
                .cloned(),
        );
        Ok(active)
    }

    /// Known nodes whose heartbeat is stale
    pub async fn get_inactive_nodes(&self, state: &State) -> Result<BTreeSet<String>> {
        let all = self.all_nodes(state).await?;
        let active = self.get_nodes(state).await?;
        Ok(all.difference(&active).cloned().collect())
    }
}
