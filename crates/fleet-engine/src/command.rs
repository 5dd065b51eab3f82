use async_trait::async_trait;
use fleet_proto::{
    DockerCommand, NetworkCreate, NetworkCreateResponse, NetworkList, NetworkListResponse,
    NetworkRemove, NetworksPrune, NetworksPruneResponse, VolumeCreate, VolumeCreateResponse,
    VolumeList, VolumeListResponse, VolumeRemove, VolumesPrune, VolumesPruneResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{DockerEngine, EngineError};

/// A typed command with exactly one response type.
///
/// `run_local` is the local executor for the command; the remote path ships
/// the command as a [`DockerCommand`] and decodes `Response` from the reply.
#[async_trait]
pub trait Command: Into<DockerCommand> + Send + 'static {
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Safe to repeat after an ambiguous failure.
    const IDEMPOTENT: bool = false;

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError>;
}

#[async_trait]
impl Command for NetworkCreate {
    type Response = NetworkCreateResponse;

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.network_create(self).await
    }
}

#[async_trait]
impl Command for NetworkList {
    type Response = NetworkListResponse;
    const IDEMPOTENT: bool = true;

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.network_list().await
    }
}

#[async_trait]
impl Command for NetworkRemove {
    type Response = ();

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.network_remove(self).await
    }
}

#[async_trait]
impl Command for NetworksPrune {
    type Response = NetworksPruneResponse;
    const IDEMPOTENT: bool = true;

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.networks_prune().await
    }
}

#[async_trait]
impl Command for VolumeCreate {
    type Response = VolumeCreateResponse;

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.volume_create(self).await
    }
}

#[async_trait]
impl Command for VolumeList {
    type Response = VolumeListResponse;
    const IDEMPOTENT: bool = true;

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.volume_list().await
    }
}

#[async_trait]
impl Command for VolumeRemove {
    type Response = ();

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.volume_remove(self).await
    }
}

#[async_trait]
impl Command for VolumesPrune {
    type Response = VolumesPruneResponse;
    const IDEMPOTENT: bool = true;

    async fn run_local(self, engine: &dyn DockerEngine) -> Result<Self::Response, EngineError> {
        engine.volumes_prune(self).await
    }
}

/// Execute a decoded wire command and encode its response as JSON.
pub async fn run_wire(
    engine: &dyn DockerEngine,
    command: DockerCommand,
) -> Result<serde_json::Value, EngineError> {
    match command {
        DockerCommand::NetworkCreate(c) => encode(c.run_local(engine).await?),
        DockerCommand::NetworkList(c) => encode(c.run_local(engine).await?),
        DockerCommand::NetworkRemove(c) => encode(c.run_local(engine).await?),
        DockerCommand::NetworksPrune(c) => encode(c.run_local(engine).await?),
        DockerCommand::VolumeCreate(c) => encode(c.run_local(engine).await?),
        DockerCommand::VolumeList(c) => encode(c.run_local(engine).await?),
        DockerCommand::VolumeRemove(c) => encode(c.run_local(engine).await?),
        DockerCommand::VolumesPrune(c) => encode(c.run_local(engine).await?),
    }
}

fn encode<T: Serialize>(value: T) -> Result<serde_json::Value, EngineError> {
    serde_json::to_value(value).map_err(|err| EngineError::Parse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEngine;

    #[tokio::test]
    async fn run_wire_encodes_typed_response() {
        let engine = MemoryEngine::new();
        let value = run_wire(
            &engine,
            VolumeCreate {
                name: "v1".into(),
                ..Default::default()
            }
            .into(),
        )
        .await
        .expect("create ok");
        let decoded: VolumeCreateResponse = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.name, "v1");
    }

    #[tokio::test]
    async fn run_wire_fire_and_forget_yields_null() {
        let engine = MemoryEngine::new();
        run_wire(
            &engine,
            NetworkCreate {
                name: "n1".into(),
                ..Default::default()
            }
            .into(),
        )
        .await
        .expect("create ok");
        let value = run_wire(&engine, NetworkRemove { id: "n1".into() }.into())
            .await
            .expect("remove ok");
        assert!(value.is_null());
        let () = serde_json::from_value(value).unwrap();
    }

    #[tokio::test]
    async fn run_wire_surfaces_domain_errors() {
        let engine = MemoryEngine::new();
        let err = run_wire(
            &engine,
            VolumeRemove {
                name: "missing".into(),
                force: false,
            }
            .into(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "volume missing not found");
    }

    #[test]
    fn only_reads_and_prunes_are_idempotent() {
        assert!(<NetworkList as Command>::IDEMPOTENT);
        assert!(<VolumesPrune as Command>::IDEMPOTENT);
        assert!(!<NetworkCreate as Command>::IDEMPOTENT);
        assert!(!<VolumeRemove as Command>::IDEMPOTENT);
    }
}
