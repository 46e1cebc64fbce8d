//! Service metadata handlers.
//!
//! # Purpose
//! Lightweight endpoints for liveness checks and cluster discovery. The
//! cluster listing exposes configuration only; credentials never appear here.
use crate::app::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ClusterInfo {
    pub name: String,
    pub issuer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
    pub remote: bool,
}

#[derive(Debug, Serialize)]
pub struct ClustersResponse {
    pub clusters: Vec<ClusterInfo>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn list_clusters(State(state): State<AppState>) -> Json<ClustersResponse> {
    let clusters = state
        .config
        .clusters
        .iter()
        .map(|(name, cluster)| ClusterInfo {
            name: name.clone(),
            issuer: cluster.issuer.clone(),
            api_server: cluster.api_server.clone(),
            remote: cluster.is_remote(),
        })
        .collect();
    Json(ClustersResponse { clusters })
}
