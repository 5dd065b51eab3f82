use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use fleet_proto::{
    VolumeCreate, VolumeCreateResponse, VolumeList, VolumeListResponse, VolumeRemove,
    VolumesPrune, VolumesPruneResponse,
};
use serde::Deserialize;
use tracing::info;

use super::{dispatch, parse_node, ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RemoveParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PruneParams {
    #[serde(default)]
    all: bool,
}

pub async fn create_volume(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    body: Result<Json<VolumeCreate>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<VolumeCreateResponse>)> {
    let node = parse_node(&node_id)?;
    let Json(mut req) = body.map_err(|err| ApiError::invalid(err.body_text()))?;
    req.name = req.name.trim().to_string();
    let created = dispatch(&state, node, req).await?;
    info!(%node, volume = %created.name, driver = %created.driver, "volume created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_volumes(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<VolumeListResponse>> {
    let node = parse_node(&node_id)?;
    Ok(Json(dispatch(&state, node, VolumeList {}).await?))
}

pub async fn remove_volume(
    State(state): State<AppState>,
    Path((node_id, name)): Path<(String, String)>,
    params: Result<Query<RemoveParams>, QueryRejection>,
) -> ApiResult<StatusCode> {
    let node = parse_node(&node_id)?;
    let Query(params) = params.map_err(|err| ApiError::invalid(err.body_text()))?;
    if name.trim().is_empty() {
        return Err(ApiError::invalid("volume name must not be empty"));
    }
    dispatch(
        &state,
        node,
        VolumeRemove {
            name: name.clone(),
            force: params.force,
        },
    )
    .await?;
    info!(%node, volume = %name, force = params.force, "volume removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn prune_volumes(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    params: Result<Query<PruneParams>, QueryRejection>,
) -> ApiResult<Json<VolumesPruneResponse>> {
    let node = parse_node(&node_id)?;
    let Query(params) = params.map_err(|err| ApiError::invalid(err.body_text()))?;
    let pruned = dispatch(&state, node, VolumesPrune { all: params.all }).await?;
    info!(
        %node,
        deleted = pruned.volumes_deleted.len(),
        reclaimed = %pruned.space_reclaimed,
        "volumes pruned"
    );
    Ok(Json(pruned))
}
