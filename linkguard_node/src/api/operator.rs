// Operator read handlers
//
// Read-only views of the cluster set for internal tooling. Served on the
// operator listener behind bearer token authentication.

use crate::api::OperatorState;
use crate::error::{LinkGuardError, Result};
use crate::types::{AttributeKind, ClusterRecord, StoreStats};
use axum::extract::{Json, Query, State};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Paging for cluster listings
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Point lookup by attribute value
#[derive(Debug, Deserialize)]
pub struct LookupParams {
    pub value: String,
    pub kind: Option<AttributeKind>,
}

/// List clusters in ascending id order.
pub async fn list_clusters(
    State(state): State<Arc<OperatorState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ClusterRecord>>> {
    let limit = params.limit.map(|limit| limit.min(state.max_page_size));
    let clusters = state.store.list(limit, params.offset).await?;
    debug!("Listing {} clusters", clusters.len());

    Ok(Json(clusters.into_iter().map(ClusterRecord::from).collect()))
}

/// Cluster owning a fingerprint, account id or ip.
pub async fn lookup_cluster(
    State(state): State<Arc<OperatorState>>,
    Query(params): Query<LookupParams>,
) -> Result<Json<ClusterRecord>> {
    match state.store.lookup(params.kind, &params.value).await? {
        Some(cluster) => Ok(Json(ClusterRecord::from(cluster))),
        None => Err(LinkGuardError::NotFound("Cluster not found".to_string())),
    }
}

/// Cluster and index counts.
pub async fn store_stats(State(state): State<Arc<OperatorState>>) -> Result<Json<StoreStats>> {
    Ok(Json(state.store.stats().await?))
}
