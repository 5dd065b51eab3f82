use std::time::Duration;

use fleet_proto::{CallId, NodeId};
use thiserror::Error;

/// Outcome of a failed dispatch, returned to the router layer as a value.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("node {node} is unreachable: {reason}")]
    NodeUnreachable { node: NodeId, reason: String },
    #[error("node {node} did not answer call {call_id} within {}ms", .timeout.as_millis())]
    DispatchTimeout {
        node: NodeId,
        call_id: CallId,
        timeout: Duration,
    },
    #[error("{message}")]
    RemoteExecution { node: NodeId, message: String },
    #[error("node {node} sent a malformed reply: {reason}")]
    MalformedReply { node: NodeId, reason: String },
    #[error("internal dispatch error: {0}")]
    InternalInvariantViolation(String),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidInput(_) => "invalid_input",
            DispatchError::NodeUnreachable { .. } => "node_unreachable",
            DispatchError::DispatchTimeout { .. } => "dispatch_timeout",
            DispatchError::RemoteExecution { .. } => "remote_execution",
            DispatchError::MalformedReply { .. } => "malformed_reply",
            DispatchError::InternalInvariantViolation(_) => "internal",
        }
    }

    /// Infrastructure failures as opposed to caller or resource-level ones.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            DispatchError::MalformedReply { .. } | DispatchError::InternalInvariantViolation(_)
        )
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
