//! Pending-call table that turns asynchronous replies into awaited results.
//!
//! Every remote dispatch registers its call id here and awaits the returned
//! receiver. The reply pump, the dispatcher's deadline and an abandoned
//! caller all race to remove the entry; whoever removes it first decides the
//! outcome and everybody else becomes a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use fleet_proto::{CallId, NodeId, ReplyOutcome};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::metrics;

pub type PendingReply = oneshot::Receiver<ReplyOutcome>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("call id {0} is already pending")]
    DuplicateCallId(CallId),
}

#[derive(Debug)]
struct PendingEntry {
    node: NodeId,
    responder: oneshot::Sender<ReplyOutcome>,
}

/// Call ids are allocated by the table itself, so every dispatcher sharing
/// one table draws from the same sequence.
#[derive(Debug)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CallId, PendingEntry>>,
    next_id: AtomicU64,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh call id and register it for `node`.
    pub fn register_next(&self, node: NodeId) -> Result<(CallId, PendingReply), RegistryError> {
        let call_id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.register(call_id, node).map(|reply| (call_id, reply))
    }

    pub fn register(&self, call_id: CallId, node: NodeId) -> Result<PendingReply, RegistryError> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&call_id) {
            return Err(RegistryError::DuplicateCallId(call_id));
        }
        let (responder, receiver) = oneshot::channel();
        calls.insert(call_id, PendingEntry { node, responder });
        metrics::PENDING_CALLS.inc();
        Ok(receiver)
    }

    /// Deliver `outcome` to the waiting caller. Returns false when the call is
    /// unknown, e.g. a reply arriving after its deadline.
    pub fn complete(&self, call_id: CallId, outcome: ReplyOutcome) -> bool {
        self.resolve(None, call_id, outcome)
    }

    /// Like [`complete`](Self::complete), but only for replies coming from the
    /// node the call was sent to. Replies from any other node leave the entry
    /// untouched.
    pub fn complete_from(&self, origin: NodeId, call_id: CallId, outcome: ReplyOutcome) -> bool {
        self.resolve(Some(origin), call_id, outcome)
    }

    fn resolve(&self, origin: Option<NodeId>, call_id: CallId, outcome: ReplyOutcome) -> bool {
        let mut calls = self.calls.lock();
        let Some(entry) = calls.get(&call_id) else {
            return false;
        };
        if let Some(origin) = origin.filter(|origin| *origin != entry.node) {
            warn!(
                %call_id,
                expected = %entry.node,
                %origin,
                "ignoring reply from a node the call was not sent to"
            );
            return false;
        }
        match calls.remove(&call_id) {
            Some(entry) => {
                deliver(call_id, entry, outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the entry without delivering anything.
    pub fn cancel(&self, call_id: CallId) -> bool {
        let removed = self.calls.lock().remove(&call_id).is_some();
        if removed {
            metrics::PENDING_CALLS.dec();
        }
        removed
    }

    pub fn contains(&self, call_id: CallId) -> bool {
        self.calls.lock().contains_key(&call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Called with the table lock held: once the entry is gone the value is observable.
fn deliver(call_id: CallId, entry: PendingEntry, outcome: ReplyOutcome) {
    metrics::PENDING_CALLS.dec();
    if entry.responder.send(outcome).is_err() {
        debug!(%call_id, "caller dropped before reply delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: u32) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn ok(payload: serde_json::Value) -> ReplyOutcome {
        ReplyOutcome::Ok { payload }
    }

    #[tokio::test]
    async fn complete_delivers_once_and_removes() {
        let calls = PendingCalls::new();
        let rx = calls.register(CallId(1), node(7)).unwrap();
        assert!(calls.complete(CallId(1), ok(serde_json::json!({"name": "v1"}))));
        assert!(!calls.contains(CallId(1)));
        assert!(!calls.complete(CallId(1), ok(serde_json::Value::Null)));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, ok(serde_json::json!({"name": "v1"})));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let calls = PendingCalls::new();
        let _rx = calls.register(CallId(5), node(2)).unwrap();
        assert_eq!(
            calls.register(CallId(5), node(3)).unwrap_err(),
            RegistryError::DuplicateCallId(CallId(5))
        );
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn cancel_beats_late_reply() {
        let calls = PendingCalls::new();
        let mut rx = calls.register(CallId(2), node(3)).unwrap();
        assert!(calls.cancel(CallId(2)));
        assert!(!calls.cancel(CallId(2)));
        assert!(!calls.complete(CallId(2), ReplyOutcome::error("too late")));
        assert!(rx.try_recv().is_err());
        assert!(calls.is_empty());
    }

    #[test]
    fn unknown_reply_is_a_no_op() {
        let calls = PendingCalls::new();
        let _rx = calls.register(CallId(3), node(4)).unwrap();
        assert!(!calls.complete(CallId(99), ok(serde_json::Value::Null)));
        assert!(calls.contains(CallId(3)));
    }

    #[tokio::test]
    async fn reply_from_wrong_node_is_ignored() {
        let calls = PendingCalls::new();
        let rx = calls.register(CallId(4), node(7)).unwrap();
        assert!(!calls.complete_from(node(8), CallId(4), ReplyOutcome::error("spoofed")));
        assert!(calls.contains(CallId(4)));
        assert!(calls.complete_from(node(7), CallId(4), ok(serde_json::Value::Null)));
        assert_eq!(rx.await.unwrap(), ok(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn wrong_origin_keeps_entry_for_plain_complete() {
        let calls = PendingCalls::new();
        let rx = calls.register(CallId(8), node(3)).unwrap();
        assert!(!calls.complete_from(node(4), CallId(8), ReplyOutcome::error("spoofed")));
        assert_eq!(calls.len(), 1);
        assert!(calls.complete(CallId(8), ok(serde_json::json!(8))));
        assert!(!calls.complete_from(node(3), CallId(8), ok(serde_json::Value::Null)));
        assert_eq!(rx.await.unwrap(), ok(serde_json::json!(8)));
    }

    #[test]
    fn register_next_allocates_distinct_ids() {
        let calls = PendingCalls::new();
        let (first, _a) = calls.register_next(node(2)).unwrap();
        let (second, _b) = calls.register_next(node(2)).unwrap();
        assert_eq!(first, CallId(1));
        assert_eq!(second, CallId(2));
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn register_next_reports_an_occupied_id() {
        let calls = PendingCalls::new();
        let _held = calls.register(CallId(1), node(2)).unwrap();
        assert_eq!(
            calls.register_next(node(2)).unwrap_err(),
            RegistryError::DuplicateCallId(CallId(1))
        );
        let (next, _rx) = calls.register_next(node(2)).unwrap();
        assert_eq!(next, CallId(2));
    }

    #[tokio::test]
    async fn completion_after_caller_dropped_still_removes() {
        let calls = PendingCalls::new();
        let rx = calls.register(CallId(6), node(2)).unwrap();
        drop(rx);
        assert!(calls.complete(CallId(6), ok(serde_json::Value::Null)));
        assert!(calls.is_empty());
    }
}
