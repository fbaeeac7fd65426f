//! Node registry - peers that introduced themselves over HTTP

use super::{ApiError, AppState};

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A node as it describes itself. Nothing here is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,

    #[serde(alias = "api_port", default)]
    pub api_address: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredNode {
    #[serde(flatten)]
    pub record: NodeRecord,
    pub registered_at: DateTime<Utc>,
}

/// In-memory id → node table; re-registering replaces the entry
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<String, RegisteredNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: NodeRecord) {
        tracing::debug!(node = %record.id, address = %record.address, "Registered node");
        self.nodes.write().insert(
            record.id.clone(),
            RegisteredNode {
                record,
                registered_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<RegisteredNode> {
        self.nodes.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<RegisteredNode> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

/// POST /nodes/register
pub(super) async fn register_node(
    State(state): State<AppState>,
    body: Result<Json<NodeRecord>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(record) = body.map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e.body_text())))?;

    if record.id.trim().is_empty() {
        return Err(ApiError::bad_request("Node id must not be empty"));
    }

    let node_id = record.id.clone();
    state.registry.register(record);

    Ok(Json(json!({
        "message": "Node registered successfully",
        "node_id": node_id,
    })))
}

/// GET /nodes
pub(super) async fn list_nodes(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "nodes": state.registry.all() }))
}
