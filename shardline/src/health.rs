//! Health reporting and auto-recovery for the sharding subsystem
//!
//! Four independent checks feed one report:
//!
//! ```text
//!   stuck_rebalances    running rebalance older than the threshold
//!   failed_operations   failed rebalance records, permanently failed queue items
//!   orphaned_clusters   temp_move_* clusters older than the orphan age
//!   queue_depth         pending queue items above the threshold
//! ```
//!
//! A check that cannot run counts as failed; the remaining checks still run.

use crate::cleanup::{CleanupManager, CleanupReport};
use crate::client::SqlClient;
use crate::cluster::{list_engine_clusters, temp_move_created_at, TEMP_MOVE_PREFIX};
use crate::config::HealthConfig;
use crate::error::Result;
use crate::metrics;
use crate::queue::Queue;
use crate::records::{rebalance_key, RebalanceRecord, RebalanceStatus, REBALANCE_PREFIX};
use crate::state::State;
use crate::time::now_secs;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const FAILED_ITEM_LIMIT: usize = 100;

/// Overall verdict of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Outcome of one named check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    /// Queue item count per status
    pub queue: BTreeMap<String, u64>,
    /// Unix seconds
    pub timestamp: u64,
}

impl HealthReport {
    fn new(timestamp: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
            warnings: Vec::new(),
            recommendations: Vec::new(),
            queue: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    fn record(&mut self, name: &'static str, outcome: Result<Finding>) {
        let passed = match outcome {
            Ok(finding) if finding.problems.is_empty() => true,
            Ok(finding) => {
                self.warnings.extend(finding.problems);
                let advice = finding.recommendation.to_string();
                if !self.recommendations.contains(&advice) {
                    self.recommendations.push(advice);
                }
                false
            }
            Err(e) => {
                self.warnings.push(format!("{} check failed: {}", name, e));
                false
            }
        };
        if !passed {
            self.status = HealthStatus::Unhealthy;
        }
        self.checks.push(HealthCheck { name, passed });
    }
}

/// Problems found by one check
struct Finding {
    problems: Vec<String>,
    recommendation: &'static str,
}

impl Finding {
    fn new(recommendation: &'static str) -> Self {
        Self {
            problems: Vec::new(),
            recommendation,
        }
    }
}

/// What auto-recovery changed
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub rebalances_reset: Vec<String>,
    pub cleanup: CleanupReport,
    pub errors: Vec<String>,
}

pub struct HealthMonitor {
    client: Arc<dyn SqlClient>,
    state: Arc<State>,
    queue: Arc<Queue>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        client: Arc<dyn SqlClient>,
        state: Arc<State>,
        queue: Arc<Queue>,
        config: HealthConfig,
    ) -> Self {
        Self {
            client,
            state,
            queue,
            config,
        }
    }

    pub async fn perform_health_check(&self) -> HealthReport {
        let now = now_secs();
        let mut report = HealthReport::new(now);

        report.record("stuck_rebalances", self.check_stuck_rebalances(now).await);
        report.record("failed_operations", self.check_failed_operations().await);
        report.record("orphaned_clusters", self.check_orphaned_clusters(now).await);
        report.record("queue_depth", self.check_queue_depth().await);

        match self.queue.count_by_status().await {
            Ok(counts) => report.queue = counts,
            Err(e) => warn!(error = %e, "Could not count queue items"),
        }

        metrics::update_health(report.is_healthy(), report.warnings.len());
        if !report.is_healthy() {
            warn!(warnings = report.warnings.len(), "Sharding unhealthy");
        }
        report
    }

    async fn rebalances(&self) -> Result<Vec<(String, RebalanceRecord)>> {
        self.state.list_prefixed(REBALANCE_PREFIX).await
    }

    fn is_stuck(&self, record: &RebalanceRecord, now: u64) -> bool {
        record.status == RebalanceStatus::Running
            && now.saturating_sub(record.started_at) > self.config.stuck_rebalance_secs
    }

    async fn check_stuck_rebalances(&self, now: u64) -> Result<Finding> {
        let mut finding = Finding::new("Run auto-recovery to reset stuck rebalances");
        for (name, record) in self.rebalances().await? {
            if self.is_stuck(&record, now) {
                finding.problems.push(format!(
                    "rebalance of {} running for {}s",
                    name,
                    now.saturating_sub(record.started_at)
                ));
            }
        }
        Ok(finding)
    }

    async fn check_failed_operations(&self) -> Result<Finding> {
        let mut finding = Finding::new("Roll back failed operation groups or run cleanup");
        for (name, record) in self.rebalances().await? {
            if record.status == RebalanceStatus::Failed {
                finding.problems.push(format!(
                    "rebalance of {} failed: {}",
                    name,
                    record.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        for item in self.queue.permanently_failed(FAILED_ITEM_LIMIT).await? {
            finding.problems.push(format!(
                "queue item {} on {} failed permanently (group '{}'): {}",
                item.id, item.node, item.operation_group, item.query
            ));
        }
        Ok(finding)
    }

    async fn check_orphaned_clusters(&self, now: u64) -> Result<Finding> {
        let mut finding = Finding::new("Run cleanup to remove orphaned temporary clusters");
        for name in list_engine_clusters(self.client.as_ref()).await? {
            if !name.starts_with(TEMP_MOVE_PREFIX) {
                continue;
            }
            let age = temp_move_created_at(&name).map(|created| now.saturating_sub(created));
            if age.map_or(true, |age| age > self.config.orphan_cluster_age_secs) {
                finding
                    .problems
                    .push(format!("temporary cluster {} looks orphaned", name));
            }
        }
        Ok(finding)
    }

    async fn check_queue_depth(&self) -> Result<Finding> {
        let mut finding =
            Finding::new("Check that every node runs its operator and can reach the engine");
        let depth = self.queue.pending_depth().await?;
        if depth > self.config.queue_depth_threshold {
            finding.problems.push(format!(
                "{} pending queue items (threshold {})",
                depth, self.config.queue_depth_threshold
            ));
        }
        Ok(finding)
    }

    /// Reset stuck and failed rebalances, then run cleanup
    ///
    /// Reset tables are picked up again by the master's next balance check.
    pub async fn perform_auto_recovery(&self, cleanup: &CleanupManager) -> RecoveryReport {
        let now = now_secs();
        let mut report = RecoveryReport::default();

        match self.rebalances().await {
            Ok(records) => {
                for (name, record) in records {
                    if !self.is_stuck(&record, now) && record.status != RebalanceStatus::Failed {
                        continue;
                    }
                    let idle = RebalanceRecord {
                        updated_at: now,
                        ..RebalanceRecord::default()
                    };
                    match self.state.set_as(&rebalance_key(&name), &idle).await {
                        Ok(()) => {
                            info!(
                                table = %name,
                                previous = record.status.as_str(),
                                "Rebalance reset"
                            );
                            report.rebalances_reset.push(name);
                        }
                        Err(e) => report.errors.push(format!("resetting {}: {}", name, e)),
                    }
                }
            }
            Err(e) => report.errors.push(format!("listing rebalance records: {}", e)),
        }

        if !report.rebalances_reset.is_empty() {
            if let Err(e) = self.state.set("cluster_hash", &json!("")).await {
                report.errors.push(format!("clearing topology hash: {}", e));
            }
        }

        report.cleanup = cleanup.perform_cleanup().await;
        report
    }
}
