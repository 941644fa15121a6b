//! Sharding error types

use thiserror::Error;

/// Errors that can occur during sharding coordination
#[derive(Error, Debug, Clone)]
pub enum ShardingError {
    #[error("Query error: {0}")]
    Query(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Not enough nodes available: need {needed}, have {available}")]
    InsufficientNodes { needed: usize, available: usize },

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Sharding is bound to cluster '{bound}', request used '{requested}'")]
    ClusterMismatch { bound: String, requested: String },

    #[error("Sharding state is not initialized")]
    StateNotActive,

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Cannot determine node id: {0}")]
    NodeId(String),

    #[error("Waiting timeout exceeded: {0}")]
    WaitTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardingError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ShardingError::Query(_) => "query",
            ShardingError::Transport(_) => "transport",
            ShardingError::Serialization(_) => "serialization",
            ShardingError::Config(_) => "config",
            ShardingError::InvalidIdentifier(_) => "invalid_identifier",
            ShardingError::InvalidOptions(_) => "invalid_options",
            ShardingError::InsufficientNodes { .. } => "insufficient_nodes",
            ShardingError::TableExists(_) => "table_exists",
            ShardingError::TableNotFound(_) => "table_not_found",
            ShardingError::ClusterMismatch { .. } => "cluster_mismatch",
            ShardingError::StateNotActive => "state_not_active",
            ShardingError::AlreadyInitialized(_) => "already_initialized",
            ShardingError::NodeId(_) => "node_id",
            ShardingError::WaitTimeout(_) => "wait_timeout",
            ShardingError::Internal(_) => "internal",
        }
    }

    /// Validation failures are rejected before anything is queued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ShardingError::InvalidIdentifier(_)
                | ShardingError::InvalidOptions(_)
                | ShardingError::InsufficientNodes { .. }
                | ShardingError::TableExists(_)
                | ShardingError::TableNotFound(_)
                | ShardingError::ClusterMismatch { .. }
        )
    }
}

impl From<std::io::Error> for ShardingError {
    fn from(err: std::io::Error) -> Self {
        ShardingError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ShardingError {
    fn from(err: reqwest::Error) -> Self {
        ShardingError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ShardingError {
    fn from(err: serde_json::Error) -> Self {
        ShardingError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ShardingError {
    fn from(err: toml::de::Error) -> Self {
        ShardingError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShardingError>;
