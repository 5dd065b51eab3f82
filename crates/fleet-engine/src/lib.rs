//! Local execution of fleet commands against a Docker engine.
//!
//! Responsibilities:
//! - the [`DockerEngine`] trait, one operation per command type
//! - binding each wire command to its response type through [`Command`]
//! - untyped execution of decoded envelopes on agents via [`run_wire`]
//! - an in-memory engine for development and a `docker` CLI engine

use async_trait::async_trait;
use fleet_proto::{
    NetworkCreate, NetworkCreateResponse, NetworkListResponse, NetworkRemove,
    NetworksPruneResponse, VolumeCreate, VolumeCreateResponse, VolumeListResponse, VolumeRemove,
    VolumesPrune, VolumesPruneResponse,
};
use thiserror::Error;

mod cli;
mod command;
mod memory;

pub use cli::DockerCliEngine;
pub use command::{run_wire, Command};
pub use memory::MemoryEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InUse(String),
    #[error("docker: {0}")]
    Docker(String),
    #[error("failed to run docker: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected engine output: {0}")]
    Parse(String),
}

#[async_trait]
pub trait DockerEngine: Send + Sync {
    async fn network_create(&self, req: NetworkCreate)
        -> Result<NetworkCreateResponse, EngineError>;
    async fn network_list(&self) -> Result<NetworkListResponse, EngineError>;
    async fn network_remove(&self, req: NetworkRemove) -> Result<(), EngineError>;
    async fn networks_prune(&self) -> Result<NetworksPruneResponse, EngineError>;
    async fn volume_create(&self, req: VolumeCreate) -> Result<VolumeCreateResponse, EngineError>;
    async fn volume_list(&self) -> Result<VolumeListResponse, EngineError>;
    async fn volume_remove(&self, req: VolumeRemove) -> Result<(), EngineError>;
    async fn volumes_prune(&self, req: VolumesPrune)
        -> Result<VolumesPruneResponse, EngineError>;
}
