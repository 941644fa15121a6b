//! Best-effort garbage collection of sharding leftovers
//!
//! Every sweep is independent; a failing sweep records its error in the
//! report and the others still run.

use crate::client::SqlClient;
use crate::cluster::{list_engine_clusters, temp_move_created_at, TEMP_MOVE_PREFIX};
use crate::config::CleanupConfig;
use crate::error::Result;
use crate::metrics;
use crate::queue::Queue;
use crate::records::{rebalance_key, RebalanceRecord, RebalanceStatus, REBALANCE_PREFIX};
use crate::sql::quote_identifier;
use crate::state::State;
use crate::time::{now_millis, now_secs};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub orphaned_clusters_removed: u64,
    pub failed_groups_removed: u64,
    pub queue_rows_removed: u64,
    pub state_entries_removed: u64,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn total_removed(&self) -> u64 {
        self.orphaned_clusters_removed
            + self.failed_groups_removed
            + self.queue_rows_removed
            + self.state_entries_removed
    }
}

pub struct CleanupManager {
    client: Arc<dyn SqlClient>,
    state: Arc<State>,
    queue: Arc<Queue>,
    config: CleanupConfig,
    orphan_cluster_age_secs: u64,
}

impl CleanupManager {
    pub fn new(
        client: Arc<dyn SqlClient>,
        state: Arc<State>,
        queue: Arc<Queue>,
        config: CleanupConfig,
        orphan_cluster_age_secs: u64,
    ) -> Self {
        Self {
            client,
            state,
            queue,
            config,
            orphan_cluster_age_secs,
        }
    }

    /// Run every sweep once
    pub async fn perform_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        report.orphaned_clusters_removed = self
            .clean_orphaned_clusters(now_secs(), &mut report.errors)
            .await;
        report.failed_groups_removed = self
            .clean_failed_operation_groups(now_millis(), &mut report.errors)
            .await;
        report.queue_rows_removed = self
            .clean_old_queue_items(now_millis(), &mut report.errors)
            .await;
        report.state_entries_removed = self
            .clean_stale_error_state(now_secs(), &mut report.errors)
            .await;

        metrics::record_cleanup("orphaned_clusters", report.orphaned_clusters_removed);
        metrics::record_cleanup("failed_groups", report.failed_groups_removed);
        metrics::record_cleanup("queue_rows", report.queue_rows_removed);
        metrics::record_cleanup("state_entries", report.state_entries_removed);

        info!(
            removed = report.total_removed(),
            errors = report.errors.len(),
            "Cleanup finished"
        );
        report
    }

    /// Delete temporary move clusters older than the orphan age
    pub async fn clean_orphaned_clusters(&self, now: u64, errors: &mut Vec<String>) -> u64 {
        let clusters = match list_engine_clusters(self.client.as_ref()).await {
            Ok(clusters) => clusters,
            Err(e) => {
                errors.push(format!("listing clusters: {}", e));
                return 0;
            }
        };

        let mut removed = 0;
        for name in clusters.iter().filter(|name| name.starts_with(TEMP_MOVE_PREFIX)) {
            let Some(created_at) = temp_move_created_at(name) else {
                warn!(cluster = %name, "Temporary cluster without timestamp");
                continue;
            };
            if now.saturating_sub(created_at) <= self.orphan_cluster_age_secs {
                continue;
            }

            let query = format!("DELETE CLUSTER {}", quote_identifier(name));
            match self.client.send_request(&query).await {
                Ok(_) => {
                    removed += 1;
                    info!(cluster = %name, "Removed orphaned temporary cluster");
                }
                Err(e) => errors.push(format!("deleting cluster {}: {}", name, e)),
            }
        }
        removed
    }

    /// Roll back and delete groups whose failure is older than the threshold
    pub async fn clean_failed_operation_groups(
        &self,
        now_ms: u64,
        errors: &mut Vec<String>,
    ) -> u64 {
        let before = now_ms.saturating_sub(self.config.failed_group_age_secs * 1000);
        let groups = match self.queue.failed_groups(before).await {
            Ok(groups) => groups,
            Err(e) => {
                errors.push(format!("listing failed groups: {}", e));
                return 0;
            }
        };

        let mut removed = 0;
        for group in groups {
            match self.queue.rollback_operation_group(&group).await {
                Ok(rollback) => errors.extend(
                    rollback
                        .errors
                        .into_iter()
                        .map(|e| format!("rollback of {}: {}", group, e)),
                ),
                Err(e) => {
                    errors.push(format!("rollback of {}: {}", group, e));
                    continue;
                }
            }

            match self.queue.delete_group(&group).await {
                Ok(rows) => {
                    removed += 1;
                    debug!(group = %group, rows = rows, "Removed failed operation group");
                }
                Err(e) => errors.push(format!("deleting group {}: {}", group, e)),
            }
        }
        removed
    }

    /// Delete finished queue rows past retention
    pub async fn clean_old_queue_items(&self, now_ms: u64, errors: &mut Vec<String>) -> u64 {
        let before = now_ms.saturating_sub(self.config.queue_retention_secs * 1000);
        match self.queue.delete_finished_before(before).await {
            Ok(rows) => rows,
            Err(e) => {
                errors.push(format!("deleting old queue rows: {}", e));
                0
            }
        }
    }

    /// Delete failed rebalance records past retention
    pub async fn clean_stale_error_state(&self, now: u64, errors: &mut Vec<String>) -> u64 {
        let records = match self.failed_rebalances().await {
            Ok(records) => records,
            Err(e) => {
                errors.push(format!("listing rebalance records: {}", e));
                return 0;
            }
        };

        let cutoff = now.saturating_sub(self.config.error_state_retention_secs);
        let mut removed = 0;
        for (name, _) in records.iter().filter(|(_, r)| r.updated_at < cutoff) {
            match self.state.delete(&rebalance_key(name)).await {
                Ok(()) => removed += 1,
                Err(e) => errors.push(format!("deleting rebalance record of {}: {}", name, e)),
            }
        }
        removed
    }

    async fn failed_rebalances(&self) -> Result<Vec<(String, RebalanceRecord)>> {
        let records: Vec<(String, RebalanceRecord)> =
            self.state.list_prefixed(REBALANCE_PREFIX).await?;
        Ok(records
            .into_iter()
            .filter(|(_, r)| r.status == RebalanceStatus::Failed)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryResponse;
    use crate::cluster::{temp_move_name, Cluster};
    use crate::config::QueueConfig;
    use crate::state::state_id;
    use crate::testing::{engine_error, rows, ScriptedClient};
    use serde_json::json;

    fn manager(client: Arc<ScriptedClient>) -> CleanupManager {
        let cluster = Arc::new(Cluster::new(""));
        let state = Arc::new(State::new(client.clone(), cluster.clone(), "sharding_state"));
        let queue = Arc::new(Queue::new(
            client.clone(),
            cluster,
            "system.sharding_queue",
            QueueConfig::default(),
        ));
        CleanupManager::new(client, state, queue, CleanupConfig::default(), 3600)
    }

    #[tokio::test]
    async fn test_only_old_temp_clusters_removed() {
        let now = now_secs();
        let old = temp_move_name(1, now - 7200);
        let fresh = temp_move_name(2, now - 60);
        let listed = vec![
            json!({"Counter": "cluster_a_name", "Value": old.clone()}),
            json!({"Counter": "cluster_b_name", "Value": fresh.clone()}),
            json!({"Counter": "cluster_c_name", "Value": "c_0011223344556677"}),
        ];
        let client = Arc::new(ScriptedClient::new(move |query| {
            if query.starts_with("SHOW STATUS") {
                Ok(rows(listed.clone()))
            } else {
                Ok(QueryResponse::affected(1))
            }
        }));
        let mut errors = Vec::new();

        let removed = manager(client.clone()).clean_orphaned_clusters(now, &mut errors).await;

        assert_eq!(removed, 1);
        assert!(errors.is_empty());
        let deletes = client.queries_matching("DELETE CLUSTER");
        assert_eq!(deletes, vec![format!("DELETE CLUSTER {}", old)]);
    }

    #[tokio::test]
    async fn test_failed_groups_rolled_back_and_deleted() {
        let client = Arc::new(ScriptedClient::new(|query| {
            if query.starts_with("SELECT operation_group") {
                Ok(rows(vec![
                    json!({"operation_group": "create:t:1"}),
                    json!({"operation_group": "create:t:1"}),
                ]))
            } else if query.starts_with("SELECT *") {
                Ok(QueryResponse::default())
            } else {
                Ok(QueryResponse::affected(2))
            }
        }));
        let mut errors = Vec::new();

        let removed = manager(client.clone())
            .clean_failed_operation_groups(now_millis(), &mut errors)
            .await;

        assert_eq!(removed, 1);
        assert!(errors.is_empty());
        assert_eq!(
            client
                .queries_matching("DELETE FROM system.sharding_queue WHERE operation_group = 'create:t:1'")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_error_state_removed() {
        let now = now_secs();
        let month = 30 * 24 * 3600;
        let client = Arc::new(ScriptedClient::new(move |query| {
            if query.contains("'^rebalance:.+'") {
                Ok(rows(vec![
                    json!({"key": "rebalance:old", "value": json!({"status": "failed", "updated_at": now - month - 10}).to_string()}),
                    json!({"key": "rebalance:new", "value": json!({"status": "failed", "updated_at": now - 10}).to_string()}),
                    json!({"key": "rebalance:run", "value": json!({"status": "running", "updated_at": 1}).to_string()}),
                ]))
            } else {
                Ok(QueryResponse::affected(1))
            }
        }));
        let mut errors = Vec::new();

        let removed = manager(client.clone()).clean_stale_error_state(now, &mut errors).await;

        assert_eq!(removed, 1);
        let deletes = client.queries_matching("DELETE FROM sharding_state");
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].ends_with(&state_id("rebalance:old").to_string()));
    }

    #[tokio::test]
    async fn test_sweep_errors_are_collected() {
        let client = Arc::new(ScriptedClient::new(|query| {
            if query.starts_with("SHOW STATUS") {
                engine_error("no such status")
            } else {
                Ok(QueryResponse::affected(0))
            }
        }));

        let report = manager(client).perform_cleanup().await;

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("listing clusters"));
        assert_eq!(report.total_removed(), 0);
    }
}
