use std::sync::Arc;

use fleet_proto::{NodeId, ReplyEnvelope};
use node_bus::{BusMessage, ReplyStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;
use crate::registry::PendingCalls;

/// Decode one reply frame and hand it to the registry. Returns whether a
/// pending call was completed.
pub fn ingest_reply(msg: &BusMessage, calls: &PendingCalls) -> bool {
    let envelope = match serde_json::from_slice::<ReplyEnvelope>(&msg.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(node = msg.node_id, error = %err, "failed to parse reply envelope");
            metrics::REPLY_FRAMES_DROPPED
                .with_label_values(&["malformed"])
                .inc();
            return false;
        }
    };
    let Some(origin) = NodeId::new(msg.node_id) else {
        warn!(node = msg.node_id, "reply from invalid node id");
        metrics::REPLY_FRAMES_DROPPED
            .with_label_values(&["malformed"])
            .inc();
        return false;
    };
    let call_id = envelope.call_id;
    if calls.complete_from(origin, call_id, envelope.outcome) {
        true
    } else {
        debug!(node = %origin, %call_id, "reply for a call that is no longer pending");
        metrics::LATE_REPLIES.inc();
        false
    }
}

/// Drain reply frames from the bus into the pending-call table until the bus
/// closes.
pub fn start_reply_pump(mut replies: ReplyStream, calls: Arc<PendingCalls>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = replies.recv().await {
            ingest_reply(&msg, &calls);
        }
        debug!("reply bus closed; pump exiting");
    })
}
