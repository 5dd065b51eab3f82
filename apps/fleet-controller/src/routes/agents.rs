//! Websocket carrier for remote agents.
//!
//! Each connection attaches its node to the controller's [`LocalBus`]:
//! command envelopes queued for the node go out as text frames and every
//! frame the agent sends back is published as a reply. A reconnecting agent
//! replaces its previous link, which closes the older socket.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    Json,
};
use bytes::Bytes;
use fleet_proto::NodeId;
use futures_util::{SinkExt, StreamExt};
use node_bus::NodeLink;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{parse_node, ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub nodes: Vec<u32>,
}

pub async fn list_agents(State(state): State<AppState>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        nodes: state.bus().connected_nodes(),
    })
}

pub async fn agent_socket(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let node = parse_node(&node_id)?;
    if node.is_controller() {
        return Err(ApiError::invalid(
            "node 1 is the controller and cannot attach as an agent",
        ));
    }
    let bus = state.bus().clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let link = bus.attach(node.get());
        handle_socket(socket, node, link).await;
    }))
}

async fn handle_socket(socket: WebSocket, node: NodeId, mut link: NodeLink) {
    metrics::AGENT_CONNECTIONS.inc();
    info!(%node, "agent connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outbound = link.recv() => match outbound {
                Some(frame) => {
                    let text = String::from_utf8_lossy(&frame).into_owned();
                    if let Err(err) = sender.send(Message::Text(text)).await {
                        warn!(%node, error = %err, "failed to forward command to agent");
                        break;
                    }
                }
                None => {
                    info!(%node, "agent link replaced by a newer connection");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => publish(&link, node, Bytes::from(text)),
                Some(Ok(Message::Binary(data))) => publish(&link, node, Bytes::from(data)),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%node, error = %err, "agent socket error");
                    break;
                }
            },
        }
    }

    drop(link);
    metrics::AGENT_CONNECTIONS.dec();
    info!(%node, "agent disconnected");
}

fn publish(link: &NodeLink, node: NodeId, frame: Bytes) {
    if let Err(err) = link.reply(frame) {
        debug!(%node, error = %err, "no reply subscribers; frame dropped");
    }
}
