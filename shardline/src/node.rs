//! Node identity and heartbeat
//!
//! A node is identified by the canonical `host:port` of its engine's HTTP
//! listener. Liveness is a `node:<id>` record in State, refreshed every tick.

use crate::client::{row_string, SqlClient};
use crate::error::{Result, ShardingError};
use crate::state::State;
use crate::time::now_millis;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

pub const NODE_PREFIX: &str = "node:";

/// Liveness of a node as last reported by itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Online,
    Offline,
}

/// Heartbeat record stored under `node:<id>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unix milliseconds of the last heartbeat
    #[serde(default)]
    pub seen_at: u64,
    #[serde(default)]
    pub status: NodeStatus,
}

impl NodeRecord {
    /// Whether the node heartbeated within `timeout_ms` of `now`
    pub fn is_active(&self, now: u64, timeout_ms: u64) -> bool {
        self.status == NodeStatus::Online && now.saturating_sub(self.seen_at) < timeout_ms
    }
}

fn listen_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:([^:\s]+):)?(\d{1,5})(?::([A-Za-z_]+))?$").expect("listen pattern is valid")
    })
}

/// Parse one listen directive (`[host:]port[:proto]`) into a node id
///
/// Returns `None` for non-http listeners and unparseable input.
pub fn parse_node_id(line: &str) -> Option<String> {
    let caps = listen_regex().captures(line.trim())?;

    if let Some(proto) = caps.get(3) {
        if !proto.as_str().eq_ignore_ascii_case("http") {
            return None;
        }
    }

    let port: u16 = caps[2].parse().ok()?;
    let host = match caps.get(1).map(|m| m.as_str()) {
        None => "127.0.0.1".to_string(),
        Some("0.0.0.0") => resolve_machine_ip(port)?,
        Some(host) => host.to_string(),
    };

    Some(format!("{}:{}", host, port))
}

fn machine_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn resolve_machine_ip(port: u16) -> Option<String> {
    let hostname = machine_hostname()?;
    let addrs: Vec<IpAddr> = (hostname.as_str(), port)
        .to_socket_addrs()
        .ok()?
        .map(|addr| addr.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
        .or_else(|| addrs.first())
        .map(IpAddr::to_string)
}

/// Determine this node's id from the engine's listen settings
///
/// Candidates with fewer colons are tried first.
pub async fn find_id(client: &dyn SqlClient) -> Result<String> {
    let response = client.send_request("SHOW SETTINGS").await?;
    let mut candidates: Vec<String> = response
        .data
        .iter()
        .filter(|row| row_string(row, "Setting_name") == "searchd.listen")
        .map(|row| row_string(row, "Value"))
        .collect();
    candidates.sort_by_key(|line| line.matches(':').count());

    candidates
        .iter()
        .find_map(|line| parse_node_id(line))
        .ok_or_else(|| {
            ShardingError::NodeId(format!(
                "no http listener among {} listen directives",
                candidates.len()
            ))
        })
}

/// This process's node
pub struct Node {
    id: String,
    state: Arc<State>,
}

impl Node {
    pub fn new(id: impl Into<String>, state: Arc<State>) -> Self {
        Self {
            id: id.into(),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> String {
        format!("{}{}", NODE_PREFIX, self.id)
    }

    /// Load this node's stored record
    pub async fn load(&self) -> Result<NodeRecord> {
        Ok(self.state.get_as(&self.key()).await?.unwrap_or_default())
    }

    /// Merge fields into the stored record (read, merge, write)
    pub async fn update(&self, fields: Map<String, Value>) -> Result<()> {
        let key = self.key();
        let mut record = match self.state.get(&key).await? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        record.extend(fields);
        self.state.set(&key, &Value::Object(record)).await
    }

    /// Mark this node online now
    pub async fn heartbeat(&self) -> Result<()> {
        let fields = match json!({ "seen_at": now_millis(), "status": NodeStatus::Online }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.update(fields).await?;
        debug!(node = %self.id, "Heartbeat");
        Ok(())
    }

    /// Every node record in State
    pub async fn list(state: &State) -> Result<BTreeMap<String, NodeRecord>> {
        let mut nodes = BTreeMap::new();
        for entry in state.list_regex(&format!("^{}.+", NODE_PREFIX)).await? {
            let Some(id) = entry.key.strip_prefix(NODE_PREFIX) else {
                continue;
            };
            match serde_json::from_value::<NodeRecord>(entry.value) {
                Ok(record) => {
                    nodes.insert(id.to_string(), record);
                }
                Err(e) => warn!(node = id, error = %e, "Skipping malformed node record"),
            }
        }
        Ok(nodes)
    }
}
