//! Test doubles for the client and command-queue seams

use crate::client::{QueryResponse, Row, SqlClient};
use crate::error::{Result, ShardingError};
use crate::queue::{CommandQueue, QueueCommand};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

type Handler = Box<dyn Fn(&str) -> Result<QueryResponse> + Send + Sync>;

/// SQL client answering from a closure and logging every statement
pub struct ScriptedClient {
    handler: Handler,
    log: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(handler: impl Fn(&str) -> Result<QueryResponse> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Client that accepts every statement with an empty result
    pub fn accepting() -> Self {
        Self::new(|_| Ok(QueryResponse::affected(1)))
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn queries_matching(&self, needle: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|q| q.contains(needle))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SqlClient for ScriptedClient {
    async fn send_request(&self, query: &str) -> Result<QueryResponse> {
        self.log.lock().push(query.to_string());
        (self.handler)(query)
    }
}

/// Build a row from a JSON object literal
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Response carrying the given JSON rows
pub fn rows(values: Vec<Value>) -> QueryResponse {
    QueryResponse::with_rows(values.into_iter().map(row).collect())
}

/// Engine error response
pub fn engine_error(message: &str) -> Result<QueryResponse> {
    Err(ShardingError::Query(message.to_string()))
}

/// Command queue that records commands and hands out sequential ids
#[derive(Default)]
pub struct RecordingQueue {
    commands: Mutex<Vec<(u64, QueueCommand)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<(u64, QueueCommand)> {
        self.commands.lock().clone()
    }

    /// Commands for one node, in enqueue order
    pub fn for_node(&self, node: &str) -> Vec<(u64, QueueCommand)> {
        self.commands
            .lock()
            .iter()
            .filter(|(_, c)| c.node == node)
            .cloned()
            .collect()
    }

    /// Commands whose query contains `needle`
    pub fn matching(&self, needle: &str) -> Vec<(u64, QueueCommand)> {
        self.commands
            .lock()
            .iter()
            .filter(|(_, c)| c.query.contains(needle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }
}

#[async_trait]
impl CommandQueue for RecordingQueue {
    async fn add(&self, command: QueueCommand) -> Result<u64> {
        let mut commands = self.commands.lock();
        let id = commands.len() as u64 + 1;
        commands.push((id, command));
        Ok(id)
    }
}
