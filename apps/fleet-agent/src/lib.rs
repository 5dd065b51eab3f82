//! Remote agent: executes command envelopes on the node's own engine and
//! answers with correlated reply envelopes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use fleet_engine::{run_wire, DockerEngine};
use fleet_proto::{CallId, CommandEnvelope, NodeId, ReplyEnvelope, ReplyOutcome};
use futures_util::{SinkExt, StreamExt};
use node_bus::NodeLink;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub struct AgentRuntime {
    node_id: NodeId,
    engine: Arc<dyn DockerEngine>,
}

// Enough of an envelope to answer a command this agent cannot decode.
#[derive(Deserialize)]
struct CallHeader {
    call_id: CallId,
}

impl AgentRuntime {
    pub fn new(node_id: NodeId, engine: Arc<dyn DockerEngine>) -> Self {
        Self { node_id, engine }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Execute one inbound frame. Returns the encoded reply, or `None` when
    /// the frame carries no call id to answer.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<Bytes> {
        let envelope = match serde_json::from_slice::<CommandEnvelope>(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                let Ok(header) = serde_json::from_slice::<CallHeader>(frame) else {
                    warn!(error = %err, "dropping undecodable frame");
                    return None;
                };
                warn!(call_id = %header.call_id, error = %err, "unsupported command");
                return encode_reply(
                    header.call_id,
                    ReplyOutcome::error(format!("unsupported command: {err}")),
                );
            }
        };

        let call_id = envelope.call_id;
        if envelope.node_id != self.node_id {
            warn!(%call_id, target = %envelope.node_id, node = %self.node_id, "misrouted command");
            return encode_reply(
                call_id,
                ReplyOutcome::error(format!(
                    "command addressed to node {} reached node {}",
                    envelope.node_id, self.node_id
                )),
            );
        }

        let kind = envelope.command.kind();
        let outcome = match run_wire(self.engine.as_ref(), envelope.command).await {
            Ok(payload) => {
                debug!(%call_id, kind, "command succeeded");
                ReplyOutcome::Ok { payload }
            }
            Err(err) => {
                info!(%call_id, kind, error = %err, "command failed");
                ReplyOutcome::error(err.to_string())
            }
        };
        encode_reply(call_id, outcome)
    }
}

fn encode_reply(call_id: CallId, outcome: ReplyOutcome) -> Option<Bytes> {
    match serde_json::to_vec(&ReplyEnvelope { call_id, outcome }) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(err) => {
            warn!(%call_id, error = %err, "failed to encode reply");
            None
        }
    }
}

/// Serve commands arriving on an in-process bus link until it is dropped or
/// replaced. Each command runs on its own task.
pub async fn serve_link(runtime: Arc<AgentRuntime>, mut link: NodeLink) {
    let replier = link.replier();
    while let Some(frame) = link.recv().await {
        let runtime = Arc::clone(&runtime);
        let replier = replier.clone();
        tokio::spawn(async move {
            if let Some(reply) = runtime.handle_frame(&frame).await {
                if let Err(err) = replier.reply(reply) {
                    debug!(error = %err, "reply dropped");
                }
            }
        });
    }
}

// Runs one command from the socket and queues its reply for the writer. The
// queue is gone once the connection has ended.
async fn forward_reply(
    runtime: Arc<AgentRuntime>,
    frame: Bytes,
    replies: mpsc::UnboundedSender<Bytes>,
) {
    if let Some(reply) = runtime.handle_frame(&frame).await {
        if let Err(err) = replies.send(reply) {
            debug!(error = %err, "reply dropped; connection closed");
        }
    }
}

/// `ws://host:port/agents/{node}/ws` for a controller base URL given as
/// http(s) or ws(s).
pub fn agent_socket_url(controller_url: &str, node_id: NodeId) -> String {
    let base = controller_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/agents/{node_id}/ws")
}

/// One websocket session with the controller. Returns `Ok` when the
/// controller closes the socket.
pub async fn run_connection(url: &str, runtime: Arc<AgentRuntime>) -> Result<()> {
    let (stream, _) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(url, node = %runtime.node_id(), "connected to controller");
    let (mut write, mut read) = stream.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();

    loop {
        tokio::select! {
            Some(reply) = reply_rx.recv() => {
                let text = String::from_utf8_lossy(&reply).into_owned();
                write
                    .send(Message::Text(text.into()))
                    .await
                    .context("failed to send reply")?;
            }
            inbound = read.next() => {
                let frame = match inbound {
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(Message::Binary(data))) => Bytes::from(data.to_vec()),
                    Some(Ok(Message::Close(_))) | None => {
                        info!(url, "controller closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err).context("websocket error"),
                };
                let runtime = Arc::clone(&runtime);
                let reply_tx = reply_tx.clone();
                tokio::spawn(forward_reply(runtime, frame, reply_tx));
            }
        }
    }
}

/// Keep a connection to the controller alive, reconnecting after
/// `reconnect_delay` whenever it drops.
pub async fn run_forever(url: String, runtime: Arc<AgentRuntime>, reconnect_delay: Duration) {
    loop {
        match run_connection(&url, Arc::clone(&runtime)).await {
            Ok(()) => info!(url = %url, "connection closed; reconnecting"),
            Err(err) => warn!(url = %url, error = %format!("{err:#}"), "connection failed"),
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_engine::MemoryEngine;
    use fleet_proto::{DockerCommand, VolumeCreate, VolumeCreateResponse};
    use node_bus::{LocalBus, NodeBus};

    fn runtime(node: u32) -> AgentRuntime {
        AgentRuntime::new(NodeId::new(node).unwrap(), Arc::new(MemoryEngine::new()))
    }

    fn envelope(call_id: u64, node: u32, command: DockerCommand) -> Vec<u8> {
        serde_json::to_vec(&CommandEnvelope {
            call_id: CallId(call_id),
            node_id: NodeId::new(node).unwrap(),
            command,
        })
        .unwrap()
    }

    fn decode(reply: Bytes) -> ReplyEnvelope {
        serde_json::from_slice(&reply).unwrap()
    }

    #[tokio::test]
    async fn executes_command_and_correlates_reply() {
        let agent = runtime(7);
        let frame = envelope(
            42,
            7,
            VolumeCreate {
                name: "v1".into(),
                ..Default::default()
            }
            .into(),
        );
        let reply = decode(agent.handle_frame(&frame).await.unwrap());
        assert_eq!(reply.call_id, CallId(42));
        let ReplyOutcome::Ok { payload } = reply.outcome else {
            panic!("expected ok outcome");
        };
        let created: VolumeCreateResponse = serde_json::from_value(payload).unwrap();
        assert_eq!(created.name, "v1");
    }

    #[tokio::test]
    async fn engine_failure_becomes_error_outcome() {
        let agent = runtime(3);
        let frame = envelope(
            5,
            3,
            fleet_proto::NetworkRemove { id: "n1".into() }.into(),
        );
        let reply = decode(agent.handle_frame(&frame).await.unwrap());
        assert_eq!(reply.call_id, CallId(5));
        assert!(matches!(reply.outcome, ReplyOutcome::Error { .. }));
    }

    #[tokio::test]
    async fn misaddressed_envelope_is_refused() {
        let agent = runtime(3);
        let frame = envelope(9, 4, fleet_proto::NetworkList {}.into());
        let reply = decode(agent.handle_frame(&frame).await.unwrap());
        assert_eq!(
            reply.outcome,
            ReplyOutcome::error("command addressed to node 4 reached node 3")
        );
    }

    #[tokio::test]
    async fn unknown_command_kind_still_answers() {
        let agent = runtime(3);
        let frame = br#"{"call_id": 11, "node_id": 3, "command": {"kind": "container_kill", "payload": {}}}"#;
        let reply = decode(agent.handle_frame(frame).await.unwrap());
        assert_eq!(reply.call_id, CallId(11));
        assert!(matches!(reply.outcome, ReplyOutcome::Error { .. }));
        assert!(agent.handle_frame(b"garbage").await.is_none());
    }

    #[tokio::test]
    async fn serves_commands_over_a_bus_link() {
        let bus = LocalBus::new();
        let mut replies = bus.subscribe_replies();
        let link = bus.attach(7);
        let task = tokio::spawn(serve_link(Arc::new(runtime(7)), link));

        bus.send(7, envelope(1, 7, fleet_proto::VolumeList {}.into()).into())
            .unwrap();
        let msg = replies.recv().await.unwrap();
        assert_eq!(msg.node_id, 7);
        assert_eq!(decode(msg.payload).call_id, CallId(1));
        task.abort();
    }

    #[tokio::test]
    async fn reply_after_connection_closed_is_dropped_quietly() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let frame = envelope(2, 7, fleet_proto::VolumeList {}.into());
        forward_reply(Arc::new(runtime(7)), frame.into(), tx).await;
    }

    #[tokio::test]
    async fn forwarded_reply_reaches_the_writer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frame = envelope(3, 7, fleet_proto::VolumeList {}.into());
        forward_reply(Arc::new(runtime(7)), frame.into(), tx).await;
        assert_eq!(decode(rx.recv().await.unwrap()).call_id, CallId(3));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn builds_socket_url_from_http_base() {
        let node = NodeId::new(7).unwrap();
        assert_eq!(
            agent_socket_url("http://10.0.0.1:8080/", node),
            "ws://10.0.0.1:8080/agents/7/ws"
        );
        assert_eq!(
            agent_socket_url("wss://fleet.example", node),
            "wss://fleet.example/agents/7/ws"
        );
    }
}
