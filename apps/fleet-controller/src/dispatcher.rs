//! Node-targeted command dispatch.
//!
//! [`Dispatcher::execute`] is the single entry point for every command type:
//! node 1 runs the command on the controller's own engine, any other node
//! gets a [`CommandEnvelope`] over the bus and the caller awaits the
//! correlated reply, bounded by a deadline.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_engine::{Command, DockerEngine};
use fleet_proto::{CallId, CommandEnvelope, NodeId, ReplyOutcome};
use node_bus::NodeBus;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::metrics;
use crate::pump;
use crate::registry::{PendingCalls, PendingReply};

pub struct Dispatcher {
    engine: Arc<dyn DockerEngine>,
    bus: Arc<dyn NodeBus>,
    calls: Arc<PendingCalls>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn DockerEngine>, bus: Arc<dyn NodeBus>) -> Self {
        Self::with_registry(engine, bus, Arc::new(PendingCalls::new()))
    }

    /// Dispatchers sharing `calls` also share its call-id sequence.
    pub fn with_registry(
        engine: Arc<dyn DockerEngine>,
        bus: Arc<dyn NodeBus>,
        calls: Arc<PendingCalls>,
    ) -> Self {
        Self { engine, bus, calls }
    }

    pub fn calls(&self) -> &Arc<PendingCalls> {
        &self.calls
    }

    /// Subscribe to the bus's replies and feed them into the pending-call
    /// table. The subscription is taken before this returns, so replies to
    /// calls dispatched afterwards are never missed.
    pub fn spawn_reply_pump(&self) -> JoinHandle<()> {
        pump::start_reply_pump(self.bus.subscribe_replies(), Arc::clone(&self.calls))
    }

    pub async fn execute<C: Command>(
        &self,
        node: NodeId,
        command: C,
        timeout: Duration,
    ) -> DispatchResult<C::Response> {
        let (path, result) = if node.is_controller() {
            ("local", self.execute_local(node, command).await)
        } else {
            ("remote", self.execute_remote(node, command, timeout).await)
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::DISPATCH_TOTAL
            .with_label_values(&[path, outcome])
            .inc();
        result
    }

    async fn execute_local<C: Command>(&self, node: NodeId, command: C) -> DispatchResult<C::Response> {
        command
            .run_local(self.engine.as_ref())
            .await
            .map_err(|err| DispatchError::RemoteExecution {
                node,
                message: err.to_string(),
            })
    }

    async fn execute_remote<C: Command>(
        &self,
        node: NodeId,
        command: C,
        timeout: Duration,
    ) -> DispatchResult<C::Response> {
        let (call_id, mut reply) = self.calls.register_next(node).map_err(|err| {
            error!(%node, error = %err, "pending-call invariant violated");
            DispatchError::InternalInvariantViolation(err.to_string())
        })?;
        let mut guard = CallGuard::new(&self.calls, call_id);

        let envelope = CommandEnvelope {
            call_id,
            node_id: node,
            command: command.into(),
        };
        let kind = envelope.command.kind();
        let frame = serde_json::to_vec(&envelope).map_err(|err| {
            error!(%node, %call_id, kind, error = %err, "failed to encode command envelope");
            DispatchError::InternalInvariantViolation(format!("encode {kind}: {err}"))
        })?;

        if let Err(err) = self.bus.send(node.get(), Bytes::from(frame)) {
            debug!(%node, %call_id, kind, error = %err, "send failed; node unreachable");
            return Err(DispatchError::NodeUnreachable {
                node,
                reason: err.to_string(),
            });
        }
        debug!(%node, %call_id, kind, timeout_ms = timeout.as_millis() as u64, "command sent");

        let outcome = match tokio::time::timeout(timeout, &mut reply).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome
            }
            Ok(Err(_)) => {
                guard.disarm();
                error!(%node, %call_id, "completion slot dropped without a reply");
                return Err(DispatchError::InternalInvariantViolation(format!(
                    "completion slot for call {call_id} closed"
                )));
            }
            Err(_) => {
                guard.disarm();
                match settle_expired(&self.calls, call_id, &mut reply) {
                    Some(outcome) => {
                        debug!(%node, %call_id, kind, "reply won the race with the deadline");
                        outcome
                    }
                    None => {
                        warn!(%node, %call_id, kind, "dispatch timed out");
                        return Err(DispatchError::DispatchTimeout {
                            node,
                            call_id,
                            timeout,
                        });
                    }
                }
            }
        };

        decode_outcome::<C>(node, outcome)
    }
}

/// Resolve a call whose deadline has elapsed. `None` means the deadline won
/// and the entry is gone. `Some` is a reply that removed the entry first;
/// it was delivered under the table lock, so it is already in `reply`.
fn settle_expired(
    calls: &PendingCalls,
    call_id: CallId,
    reply: &mut PendingReply,
) -> Option<ReplyOutcome> {
    if calls.cancel(call_id) {
        return None;
    }
    reply.try_recv().ok()
}

fn decode_outcome<C: Command>(node: NodeId, outcome: ReplyOutcome) -> DispatchResult<C::Response> {
    match outcome {
        ReplyOutcome::Ok { payload } => {
            serde_json::from_value(payload).map_err(|err| DispatchError::MalformedReply {
                node,
                reason: err.to_string(),
            })
        }
        ReplyOutcome::Error { message } => Err(DispatchError::RemoteExecution { node, message }),
    }
}

/// Removes the pending entry if the waiting future is dropped before it
/// resolves, e.g. when the HTTP request that started the dispatch goes away.
struct CallGuard<'a> {
    calls: &'a PendingCalls,
    call_id: CallId,
    armed: bool,
}

impl<'a> CallGuard<'a> {
    fn new(calls: &'a PendingCalls, call_id: CallId) -> Self {
        Self {
            calls,
            call_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.calls.cancel(self.call_id) {
            debug!(call_id = %self.call_id, "abandoned call removed from registry");
        }
    }
}
