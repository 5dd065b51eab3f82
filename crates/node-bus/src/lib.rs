//! Node-addressed message transport between the controller and its agents.
//!
//! A [`NodeBus`] carries opaque frames to a specific node and hands every
//! reply frame back to whoever subscribed. It knows nothing about calls,
//! commands or encodings; those live one layer up.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Raw node identifier as seen by the transport.
pub type NodeKey = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub node_id: NodeKey,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("node {0} is not connected")]
    NodeUnreachable(NodeKey),
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait NodeBus: Send + Sync {
    /// Best-effort enqueue of a frame for `node_id`. Fails synchronously when
    /// the node has no live link.
    fn send(&self, node_id: NodeKey, payload: Bytes) -> BusResult<()>;
    /// Stream of reply frames from every node. Each subscriber receives
    /// every frame published after it subscribed; none are dropped.
    fn subscribe_replies(&self) -> ReplyStream;
}

pub type ReplyStream = mpsc::UnboundedReceiver<BusMessage>;

type LinkTable = Arc<RwLock<HashMap<NodeKey, mpsc::UnboundedSender<Bytes>>>>;
type ReplySubscribers = Arc<RwLock<Vec<mpsc::UnboundedSender<BusMessage>>>>;

/// In-process hub: each connected node holds a [`NodeLink`] attached here.
///
/// Physical carriers (the controller's websocket endpoint) attach a link per
/// connection; tests attach links directly.
#[derive(Debug, Clone)]
pub struct LocalBus {
    links: LinkTable,
    replies: ReplySubscribers,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            replies: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Attach `node_id`, replacing any previous link for the same node.
    pub fn attach(&self, node_id: NodeKey) -> NodeLink {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox_tx = tx.downgrade();
        let replaced = self.links.write().insert(node_id, tx).is_some();
        if replaced {
            debug!(node_id, "replaced existing node link");
        }
        NodeLink {
            node_id,
            inbox: rx,
            inbox_tx,
            links: Arc::clone(&self.links),
            replier: NodeReplier {
                node_id,
                replies: Arc::clone(&self.replies),
            },
        }
    }

    pub fn is_connected(&self, node_id: NodeKey) -> bool {
        self.links
            .read()
            .get(&node_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn connected_nodes(&self) -> Vec<NodeKey> {
        let mut nodes: Vec<NodeKey> = self
            .links
            .read()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(id, _)| *id)
            .collect();
        nodes.sort_unstable();
        nodes
    }
}

impl NodeBus for LocalBus {
    fn send(&self, node_id: NodeKey, payload: Bytes) -> BusResult<()> {
        let sender = self
            .links
            .read()
            .get(&node_id)
            .cloned()
            .ok_or(BusError::NodeUnreachable(node_id))?;
        if sender.send(payload).is_err() {
            let mut guard = self.links.write();
            if guard.get(&node_id).is_some_and(|tx| tx.same_channel(&sender)) {
                guard.remove(&node_id);
            }
            return Err(BusError::NodeUnreachable(node_id));
        }
        Ok(())
    }

    fn subscribe_replies(&self) -> ReplyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replies.write().push(tx);
        rx
    }
}

/// Cloneable handle for publishing replies on behalf of one node.
#[derive(Debug, Clone)]
pub struct NodeReplier {
    node_id: NodeKey,
    replies: ReplySubscribers,
}

impl NodeReplier {
    pub fn node_id(&self) -> NodeKey {
        self.node_id
    }

    /// Publish a reply to every live subscriber. Fails with
    /// [`BusError::Closed`] when nobody is listening.
    pub fn reply(&self, payload: Bytes) -> BusResult<()> {
        let msg = BusMessage {
            node_id: self.node_id,
            payload,
        };
        let mut delivered = false;
        let mut stale = false;
        for tx in self.replies.read().iter() {
            if tx.send(msg.clone()).is_ok() {
                delivered = true;
            } else {
                stale = true;
            }
        }
        if stale {
            self.replies.write().retain(|tx| !tx.is_closed());
        }
        if delivered {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }
}

/// One node's attachment to a [`LocalBus`]. Dropping it detaches the node,
/// unless a newer link has replaced it in the meantime.
#[derive(Debug)]
pub struct NodeLink {
    node_id: NodeKey,
    inbox: mpsc::UnboundedReceiver<Bytes>,
    inbox_tx: mpsc::WeakUnboundedSender<Bytes>,
    links: LinkTable,
    replier: NodeReplier,
}

impl NodeLink {
    pub fn node_id(&self) -> NodeKey {
        self.node_id
    }

    /// Next frame addressed to this node. `None` once the bus has dropped
    /// the link (replaced by a reconnect).
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbox.recv().await
    }

    pub fn reply(&self, payload: Bytes) -> BusResult<()> {
        self.replier.reply(payload)
    }

    pub fn replier(&self) -> NodeReplier {
        self.replier.clone()
    }
}

impl Drop for NodeLink {
    fn drop(&mut self) {
        let Some(own) = self.inbox_tx.upgrade() else {
            return;
        };
        let mut guard = self.links.write();
        if guard
            .get(&self.node_id)
            .is_some_and(|tx| tx.same_channel(&own))
        {
            guard.remove(&self.node_id);
            debug!(node_id = self.node_id, "node link detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_attached_node() {
        let bus = LocalBus::new();
        let mut link = bus.attach(7);
        bus.send(7, Bytes::from_static(b"ping")).expect("send ok");
        let frame = link.recv().await.expect("frame");
        assert_eq!(frame, Bytes::from_static(b"ping"));
    }

    #[test]
    fn send_to_unknown_node_is_unreachable() {
        let bus = LocalBus::new();
        let err = bus.send(9, Bytes::from_static(b"ping")).unwrap_err();
        assert!(matches!(err, BusError::NodeUnreachable(9)));
    }

    #[tokio::test]
    async fn replies_carry_node_identity() {
        let bus = LocalBus::new();
        let mut replies = bus.subscribe_replies();
        let link = bus.attach(3);
        link.reply(Bytes::from_static(b"pong")).expect("reply ok");
        let msg = replies.recv().await.expect("reply");
        assert_eq!(msg.node_id, 3);
        assert_eq!(msg.payload, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn reply_burst_beyond_any_buffer_is_not_dropped() {
        let bus = LocalBus::new();
        let mut replies = bus.subscribe_replies();
        let link = bus.attach(7);
        for i in 0..5_000u32 {
            link.reply(Bytes::from(i.to_string())).expect("reply ok");
        }
        for i in 0..5_000u32 {
            let msg = replies.recv().await.expect("reply");
            assert_eq!(msg.payload, Bytes::from(i.to_string()));
        }
        assert!(replies.try_recv().is_err());
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let bus = LocalBus::new();
        let link = bus.attach(2);
        let gone = bus.subscribe_replies();
        let mut live = bus.subscribe_replies();
        drop(gone);
        link.reply(Bytes::from_static(b"a")).expect("live subscriber");
        assert_eq!(bus.replies.read().len(), 1);
        assert_eq!(live.try_recv().unwrap().payload, Bytes::from_static(b"a"));
        drop(live);
        assert!(matches!(
            link.reply(Bytes::from_static(b"b")),
            Err(BusError::Closed)
        ));
    }

    #[test]
    fn dropping_link_detaches_node() {
        let bus = LocalBus::new();
        let link = bus.attach(4);
        assert!(bus.is_connected(4));
        drop(link);
        assert!(!bus.is_connected(4));
        assert!(matches!(
            bus.send(4, Bytes::new()),
            Err(BusError::NodeUnreachable(4))
        ));
    }

    #[tokio::test]
    async fn stale_link_drop_keeps_replacement() {
        let bus = LocalBus::new();
        let mut stale = bus.attach(5);
        let mut fresh = bus.attach(5);
        assert_eq!(stale.recv().await, None);
        drop(stale);
        assert_eq!(bus.connected_nodes(), vec![5]);
        bus.send(5, Bytes::from_static(b"after")).expect("send ok");
        assert_eq!(fresh.recv().await, Some(Bytes::from_static(b"after")));
    }
}
