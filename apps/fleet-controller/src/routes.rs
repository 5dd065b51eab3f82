use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use fleet_engine::Command;
use fleet_proto::NodeId;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::DispatchError;
use crate::metrics;
use crate::state::AppState;

pub mod agents;
pub mod networks;
pub mod volumes;

/// HTTP face of a [`DispatchError`].
#[derive(Debug)]
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError(DispatchError::InvalidInput(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        if self.0.is_internal() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        (
            status,
            Json(ApiErrorBody {
                error: self.0.kind(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn parse_node(raw: &str) -> ApiResult<NodeId> {
    raw.parse::<NodeId>()
        .map_err(|err| ApiError::invalid(err.to_string()))
}

/// Dispatch with the configured deadline. Commands that declare themselves
/// idempotent are re-sent after a timeout, up to `dispatch_retries` times.
pub(crate) async fn dispatch<C>(state: &AppState, node: NodeId, command: C) -> ApiResult<C::Response>
where
    C: Command + Clone,
{
    let mut retries_left = if C::IDEMPOTENT {
        state.dispatch_retries()
    } else {
        0
    };
    loop {
        match state
            .dispatcher()
            .execute(node, command.clone(), state.default_timeout())
            .await
        {
            Err(err @ DispatchError::DispatchTimeout { .. }) if retries_left > 0 => {
                retries_left -= 1;
                warn!(%node, error = %err, retries_left, "retrying idempotent command");
            }
            other => return other.map_err(ApiError::from),
        }
    }
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    connected_agents: usize,
    pending_calls: usize,
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        connected_agents: state.bus().connected_nodes().len(),
        pending_calls: state.dispatcher().calls().len(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(ready))
        .route("/metrics", get(metrics_handler))
        .route("/agents", get(agents::list_agents))
        .route("/agents/:node_id/ws", get(agents::agent_socket))
        .route(
            "/nodes/:node_id/networks",
            post(networks::create_network).get(networks::list_networks),
        )
        .route("/nodes/:node_id/networks/prune", post(networks::prune_networks))
        .route("/nodes/:node_id/networks/:id", delete(networks::remove_network))
        .route(
            "/nodes/:node_id/volumes",
            post(volumes::create_volume).get(volumes::list_volumes),
        )
        .route("/nodes/:node_id/volumes/prune", post(volumes::prune_volumes))
        .route("/nodes/:node_id/volumes/:name", delete(volumes::remove_volume))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
