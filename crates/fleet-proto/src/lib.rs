//! Shared wire definitions for controller ↔ agent communication.
//! Kept free of runtime code so agents and tooling can depend on it cheaply.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod network;
pub mod volume;

pub use network::{
    NetworkCreate, NetworkCreateResponse, NetworkList, NetworkListResponse, NetworkRemove,
    NetworkSummary, NetworksPrune, NetworksPruneResponse,
};
pub use volume::{
    VolumeCreate, VolumeCreateResponse, VolumeList, VolumeListResponse, VolumeRemove,
    VolumeSummary, VolumesPrune, VolumesPruneResponse,
};

/// Identity of a node in the fleet. `1` is always the controller's own engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("nodeId should be an integer")]
pub struct InvalidNodeId;

impl NodeId {
    pub const CONTROLLER: NodeId = NodeId(1);

    pub fn new(raw: u32) -> Option<Self> {
        (raw >= 1).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_controller(self) -> bool {
        self == Self::CONTROLLER
    }
}

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s.trim().parse().map_err(|_| InvalidNodeId)?;
        Self::new(raw).ok_or(InvalidNodeId)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates one dispatched command with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of commands an agent understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum DockerCommand {
    NetworkCreate(NetworkCreate),
    NetworkList(NetworkList),
    NetworkRemove(NetworkRemove),
    NetworksPrune(NetworksPrune),
    VolumeCreate(VolumeCreate),
    VolumeList(VolumeList),
    VolumeRemove(VolumeRemove),
    VolumesPrune(VolumesPrune),
}

impl DockerCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            DockerCommand::NetworkCreate(_) => "network_create",
            DockerCommand::NetworkList(_) => "network_list",
            DockerCommand::NetworkRemove(_) => "network_remove",
            DockerCommand::NetworksPrune(_) => "networks_prune",
            DockerCommand::VolumeCreate(_) => "volume_create",
            DockerCommand::VolumeList(_) => "volume_list",
            DockerCommand::VolumeRemove(_) => "volume_remove",
            DockerCommand::VolumesPrune(_) => "volumes_prune",
        }
    }
}

macro_rules! into_docker_command {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for DockerCommand {
                fn from(value: $variant) -> Self {
                    DockerCommand::$variant(value)
                }
            }
        )*
    };
}

into_docker_command!(
    NetworkCreate,
    NetworkList,
    NetworkRemove,
    NetworksPrune,
    VolumeCreate,
    VolumeList,
    VolumeRemove,
    VolumesPrune,
);

/// Controller → agent frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub call_id: CallId,
    pub node_id: NodeId,
    pub command: DockerCommand,
}

/// Agent → controller frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub call_id: CallId,
    pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Ok {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl ReplyOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        ReplyOutcome::Error {
            message: message.into(),
        }
    }
}
