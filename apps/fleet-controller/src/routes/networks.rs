use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use fleet_proto::{
    NetworkCreate, NetworkCreateResponse, NetworkList, NetworkListResponse, NetworkRemove,
    NetworksPrune, NetworksPruneResponse,
};
use tracing::info;

use super::{dispatch, parse_node, ApiError, ApiResult};
use crate::state::AppState;

pub async fn create_network(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    body: Result<Json<NetworkCreate>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<NetworkCreateResponse>)> {
    let node = parse_node(&node_id)?;
    let Json(mut req) = body.map_err(|err| ApiError::invalid(err.body_text()))?;
    req.name = req.name.trim().to_string();
    if req.name.is_empty() {
        return Err(ApiError::invalid("network name must not be empty"));
    }
    let name = req.name.clone();
    let created = dispatch(&state, node, req).await?;
    info!(%node, network = %name, id = %created.id, "network created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_networks(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<NetworkListResponse>> {
    let node = parse_node(&node_id)?;
    Ok(Json(dispatch(&state, node, NetworkList {}).await?))
}

pub async fn remove_network(
    State(state): State<AppState>,
    Path((node_id, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let node = parse_node(&node_id)?;
    if id.trim().is_empty() {
        return Err(ApiError::invalid("network id must not be empty"));
    }
    dispatch(&state, node, NetworkRemove { id: id.clone() }).await?;
    info!(%node, network = %id, "network removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn prune_networks(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<NetworksPruneResponse>> {
    let node = parse_node(&node_id)?;
    let pruned = dispatch(&state, node, NetworksPrune {}).await?;
    info!(%node, deleted = pruned.networks_deleted.len(), "networks pruned");
    Ok(Json(pruned))
}
