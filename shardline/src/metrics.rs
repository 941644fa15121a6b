//! Coordinator observability metrics
//!
//! Provides Prometheus-compatible metrics for sharding coordination including:
//! - Queue command outcomes and execution time
//! - Tick duration and per-step failures
//! - Mastership and active node count
//! - Table and rebalance operations
//! - Health and cleanup sweeps

use std::time::Duration;

/// Record the outcome of one executed queue command
pub fn record_queue_command(node: &str, status: &str, duration: Duration) {
    metrics::counter!(
        "shardline_queue_commands_total",
        "node" => node.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);

    metrics::histogram!("shardline_queue_command_duration_seconds")
        .record(duration.as_secs_f64());
}

/// Record a queue item that was not attempted this tick
pub fn record_queue_skip(reason: &'static str) {
    metrics::counter!("shardline_queue_skips_total", "reason" => reason).increment(1);
}

/// Update the pending queue depth gauge
pub fn update_queue_depth(depth: u64) {
    metrics::gauge!("shardline_queue_depth").set(depth as f64);
}

/// Record a completed coordinator tick
pub fn record_tick(duration: Duration) {
    metrics::counter!("shardline_ticks_total").increment(1);
    metrics::histogram!("shardline_tick_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed tick step
pub fn record_tick_error(step: &'static str, error_type: &str) {
    metrics::counter!(
        "shardline_tick_errors_total",
        "step" => step,
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Update mastership and membership gauges
pub fn update_membership(is_master: bool, active_nodes: usize) {
    metrics::gauge!("shardline_is_master").set(if is_master { 1.0 } else { 0.0 });
    metrics::gauge!("shardline_active_nodes").set(active_nodes as f64);
}

/// Record a master takeover by this node
pub fn record_master_takeover() {
    metrics::counter!("shardline_master_takeovers_total").increment(1);
}

/// Record a sharded table request
pub fn record_table_operation(kind: &str, status: &str) {
    metrics::counter!(
        "shardline_table_operations_total",
        "type" => kind.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Record a rebalance being enqueued
pub fn record_rebalance_started(table: &str) {
    metrics::counter!(
        "shardline_rebalance_operations_total",
        "table" => table.to_string(),
    )
    .increment(1);
}

/// Record rebalance completion
pub fn record_rebalance_completion(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    metrics::counter!(
        "shardline_rebalance_completed_total",
        "status" => status,
    )
    .increment(1);

    metrics::histogram!("shardline_rebalance_duration_seconds").record(duration.as_secs_f64());
}

/// Record inverse commands queued by a rollback
pub fn record_rollback(queued: usize, failed: usize) {
    metrics::counter!("shardline_rollback_commands_total", "status" => "queued")
        .increment(queued as u64);
    metrics::counter!("shardline_rollback_commands_total", "status" => "error")
        .increment(failed as u64);
}

/// Update health gauges after a health check
pub fn update_health(healthy: bool, warnings: usize) {
    metrics::gauge!("shardline_healthy").set(if healthy { 1.0 } else { 0.0 });
    metrics::gauge!("shardline_health_warnings").set(warnings as f64);
}

/// Record items removed by a cleanup sweep
pub fn record_cleanup(kind: &'static str, removed: u64) {
    metrics::counter!("shardline_cleanup_removed_total", "kind" => kind).increment(removed);
}
