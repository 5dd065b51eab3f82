use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_proto::{
    NetworkCreate, NetworkCreateResponse, NetworkListResponse, NetworkRemove, NetworkSummary,
    NetworksPruneResponse, VolumeCreate, VolumeCreateResponse, VolumeListResponse, VolumeRemove,
    VolumeSummary, VolumesPrune, VolumesPruneResponse,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{DockerEngine, EngineError};

const BUILTIN_NETWORKS: &[(&str, &str, &str)] = &[
    ("bridge", "bridge", "local"),
    ("host", "host", "local"),
    ("none", "null", "local"),
];

#[derive(Debug, Clone)]
struct NetworkRecord {
    id: String,
    name: String,
    driver: String,
    scope: String,
    internal: bool,
    builtin: bool,
}

#[derive(Debug, Clone)]
struct VolumeRecord {
    name: String,
    driver: String,
    mountpoint: String,
    in_use: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    networks: BTreeMap<String, NetworkRecord>,
    volumes: BTreeMap<String, VolumeRecord>,
}

/// Engine that keeps networks and volumes in process memory.
///
/// Used when no Docker daemon is available (development, tests). Seeds the
/// pre-defined `bridge`, `host` and `none` networks, which cannot be removed.
#[derive(Debug)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        let mut state = EngineState::default();
        for (name, driver, scope) in BUILTIN_NETWORKS {
            let id = object_id();
            state.networks.insert(
                id.clone(),
                NetworkRecord {
                    id,
                    name: (*name).to_string(),
                    driver: (*driver).to_string(),
                    scope: (*scope).to_string(),
                    internal: false,
                    builtin: true,
                },
            );
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Flag a volume as mounted by a container. Returns false for unknown volumes.
    pub fn set_volume_in_use(&self, name: &str, in_use: bool) -> bool {
        match self.state.lock().volumes.get_mut(name) {
            Some(volume) => {
                volume.in_use = in_use;
                true
            }
            None => false,
        }
    }
}

fn object_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn is_anonymous(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

impl EngineState {
    fn find_network(&self, id_or_name: &str) -> Option<&NetworkRecord> {
        self.networks
            .get(id_or_name)
            .or_else(|| self.networks.values().find(|n| n.name == id_or_name))
    }
}

#[async_trait]
impl DockerEngine for MemoryEngine {
    async fn network_create(
        &self,
        req: NetworkCreate,
    ) -> Result<NetworkCreateResponse, EngineError> {
        let mut state = self.state.lock();
        if state.networks.values().any(|n| n.name == req.name) {
            return Err(EngineError::Conflict(format!(
                "network with name {} already exists",
                req.name
            )));
        }
        let id = object_id();
        state.networks.insert(
            id.clone(),
            NetworkRecord {
                id: id.clone(),
                name: req.name,
                driver: req.driver.unwrap_or_else(|| "bridge".into()),
                scope: "local".into(),
                internal: req.internal,
                builtin: false,
            },
        );
        Ok(NetworkCreateResponse { id, warning: None })
    }

    async fn network_list(&self) -> Result<NetworkListResponse, EngineError> {
        let state = self.state.lock();
        let mut items: Vec<NetworkSummary> = state
            .networks
            .values()
            .map(|n| NetworkSummary {
                id: n.id.clone(),
                name: n.name.clone(),
                driver: n.driver.clone(),
                scope: n.scope.clone(),
                internal: n.internal,
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(NetworkListResponse { items })
    }

    async fn network_remove(&self, req: NetworkRemove) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let network = state
            .find_network(&req.id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                kind: "network",
                name: req.id.clone(),
            })?;
        if network.builtin {
            return Err(EngineError::Conflict(format!(
                "{} is a pre-defined network and cannot be removed",
                network.name
            )));
        }
        state.networks.remove(&network.id);
        Ok(())
    }

    async fn networks_prune(&self) -> Result<NetworksPruneResponse, EngineError> {
        let mut state = self.state.lock();
        let mut networks_deleted = Vec::new();
        state.networks.retain(|_, n| {
            if n.builtin {
                return true;
            }
            networks_deleted.push(n.name.clone());
            false
        });
        networks_deleted.sort();
        Ok(NetworksPruneResponse { networks_deleted })
    }

    async fn volume_create(&self, req: VolumeCreate) -> Result<VolumeCreateResponse, EngineError> {
        let mut state = self.state.lock();
        let name = if req.name.trim().is_empty() {
            object_id()
        } else {
            req.name
        };
        let driver = req.driver.unwrap_or_else(|| "local".into());
        // Creating an existing volume with the same driver is a no-op, as in dockerd.
        if let Some(existing) = state.volumes.get(&name) {
            if existing.driver != driver {
                return Err(EngineError::Conflict(format!(
                    "volume {name} already exists with driver {}",
                    existing.driver
                )));
            }
            return Ok(VolumeCreateResponse {
                name: existing.name.clone(),
                driver: existing.driver.clone(),
                mountpoint: existing.mountpoint.clone(),
            });
        }
        let record = VolumeRecord {
            mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
            name: name.clone(),
            driver,
            in_use: false,
        };
        let response = VolumeCreateResponse {
            name: record.name.clone(),
            driver: record.driver.clone(),
            mountpoint: record.mountpoint.clone(),
        };
        state.volumes.insert(name, record);
        Ok(response)
    }

    async fn volume_list(&self) -> Result<VolumeListResponse, EngineError> {
        let state = self.state.lock();
        let items = state
            .volumes
            .values()
            .map(|v| VolumeSummary {
                name: v.name.clone(),
                driver: v.driver.clone(),
                mountpoint: v.mountpoint.clone(),
            })
            .collect();
        Ok(VolumeListResponse { items })
    }

    async fn volume_remove(&self, req: VolumeRemove) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let volume = state
            .volumes
            .get(&req.name)
            .ok_or_else(|| EngineError::NotFound {
                kind: "volume",
                name: req.name.clone(),
            })?;
        if volume.in_use && !req.force {
            return Err(EngineError::InUse(format!("volume {} is in use", req.name)));
        }
        state.volumes.remove(&req.name);
        Ok(())
    }

    async fn volumes_prune(
        &self,
        req: VolumesPrune,
    ) -> Result<VolumesPruneResponse, EngineError> {
        let mut state = self.state.lock();
        let mut volumes_deleted = Vec::new();
        state.volumes.retain(|name, v| {
            let prunable = !v.in_use && (req.all || is_anonymous(name));
            if prunable {
                volumes_deleted.push(name.clone());
            }
            !prunable
        });
        Ok(VolumesPruneResponse {
            volumes_deleted,
            space_reclaimed: "0B".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(name: &str) -> NetworkCreate {
        NetworkCreate {
            name: name.into(),
            ..Default::default()
        }
    }

    fn volume(name: &str) -> VolumeCreate {
        VolumeCreate {
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn seeds_builtin_networks() {
        let engine = MemoryEngine::new();
        let names: Vec<String> = engine
            .network_list()
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["bridge", "host", "none"]);
    }

    #[tokio::test]
    async fn duplicate_network_name_conflicts() {
        let engine = MemoryEngine::new();
        engine.network_create(network("n1")).await.unwrap();
        let err = engine.network_create(network("n1")).await.unwrap_err();
        assert_eq!(err.to_string(), "network with name n1 already exists");
    }

    #[tokio::test]
    async fn removes_network_by_name_or_id() {
        let engine = MemoryEngine::new();
        let created = engine.network_create(network("n1")).await.unwrap();
        engine.network_create(network("n2")).await.unwrap();
        engine
            .network_remove(NetworkRemove { id: created.id })
            .await
            .unwrap();
        engine
            .network_remove(NetworkRemove { id: "n2".into() })
            .await
            .unwrap();
        assert_eq!(engine.network_list().await.unwrap().items.len(), 3);
        let err = engine
            .network_remove(NetworkRemove { id: "n2".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "network", .. }));
    }

    #[tokio::test]
    async fn builtin_networks_survive_remove_and_prune() {
        let engine = MemoryEngine::new();
        engine.network_create(network("app")).await.unwrap();
        let err = engine
            .network_remove(NetworkRemove {
                id: "bridge".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        let pruned = engine.networks_prune().await.unwrap();
        assert_eq!(pruned.networks_deleted, vec!["app"]);
        assert_eq!(engine.network_list().await.unwrap().items.len(), 3);
    }

    #[tokio::test]
    async fn volume_in_use_requires_force() {
        let engine = MemoryEngine::new();
        engine.volume_create(volume("data")).await.unwrap();
        assert!(engine.set_volume_in_use("data", true));
        let err = engine
            .volume_remove(VolumeRemove {
                name: "data".into(),
                force: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "volume data is in use");
        engine
            .volume_remove(VolumeRemove {
                name: "data".into(),
                force: true,
            })
            .await
            .unwrap();
        assert!(engine.volume_list().await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn volume_prune_respects_all_flag() {
        let engine = MemoryEngine::new();
        engine.volume_create(volume("named")).await.unwrap();
        let anon = engine.volume_create(volume("")).await.unwrap();
        assert_eq!(anon.name.len(), 64);

        let pruned = engine
            .volumes_prune(VolumesPrune { all: false })
            .await
            .unwrap();
        assert_eq!(pruned.volumes_deleted, vec![anon.name]);

        let pruned = engine
            .volumes_prune(VolumesPrune { all: true })
            .await
            .unwrap();
        assert_eq!(pruned.volumes_deleted, vec!["named"]);
    }

    #[tokio::test]
    async fn recreating_volume_is_idempotent() {
        let engine = MemoryEngine::new();
        let first = engine.volume_create(volume("v1")).await.unwrap();
        let second = engine.volume_create(volume("v1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.mountpoint, "/var/lib/docker/volumes/v1/_data");
    }
}
