//! HTTP status API and loopback demo for a PeerSync node.

pub mod demo;

use axum::{Router, extract::State, response::Json, routing::get};
use peersync_sync::{SyncOrchestrator, SyncStatistics};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub device_id: String,
    pub device_name: String,
    pub connections: usize,
    pub statistics: SyncStatistics,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub document_id: String,
    pub document_type: String,
    pub operations: usize,
    pub fields: Map<String, Value>,
}

async fn status_handler(State(node): State<Arc<SyncOrchestrator>>) -> Json<StatusResponse> {
    let local = node.local_device();
    Json(StatusResponse {
        device_id: local.device_id.to_string(),
        device_name: local.device_name.clone(),
        connections: node.connections().await.len(),
        statistics: node.get_sync_statistics().await,
    })
}

async fn documents_handler(
    State(node): State<Arc<SyncOrchestrator>>,
) -> Json<Vec<DocumentSummary>> {
    let engine = node.engine();
    let policy = engine.config().conflict_policy;
    let mut documents = Vec::new();
    for id in engine.document_ids().await {
        if let Some(document) = engine.document(&id).await {
            documents.push(DocumentSummary {
                document_id: id.to_string(),
                document_type: document.document_type().to_string(),
                operations: document.len(),
                fields: document.snapshot(policy),
            });
        }
    }
    Json(documents)
}

/// Build the HTTP API router for one node.
pub fn build_router(node: Arc<SyncOrchestrator>) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/documents", get(documents_handler))
        .with_state(node)
}
