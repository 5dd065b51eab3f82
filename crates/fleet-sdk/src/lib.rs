//! Asynchronous client for the fleet controller's HTTP API.

use fleet_proto::{
    NetworkCreate, NetworkCreateResponse, NetworkListResponse, NetworksPruneResponse, NodeId,
    VolumeCreate, VolumeCreateResponse, VolumeListResponse, VolumesPruneResponse,
};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone)]
pub struct FleetClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{status} {error}: {message}")]
    Api {
        status: reqwest::StatusCode,
        error: String,
        message: String,
    },
    #[error("invalid controller url: {0}")]
    InvalidUrl(String),
}

impl FleetError {
    /// The controller's error kind, e.g. `dispatch_timeout`.
    pub fn kind(&self) -> Option<&str> {
        match self {
            FleetError::Api { error, .. } => Some(error),
            FleetError::Http(_) | FleetError::InvalidUrl(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Agents {
    pub nodes: Vec<u32>,
}

impl FleetClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    // Each segment is percent-encoded on its own, so ids and names can
    // carry any character.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, FleetError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| FleetError::InvalidUrl(format!("{}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| FleetError::InvalidUrl(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn node_url(&self, node: NodeId, segments: &[&str]) -> Result<Url, FleetError> {
        let node = node.to_string();
        let mut path = vec!["nodes", node.as_str()];
        path.extend_from_slice(segments);
        self.endpoint(&path)
    }

    pub async fn create_network(
        &self,
        node: NodeId,
        req: &NetworkCreate,
    ) -> Result<NetworkCreateResponse, FleetError> {
        let url = self.node_url(node, &["networks"])?;
        json(self.http.post(url).json(req)).await
    }

    pub async fn list_networks(&self, node: NodeId) -> Result<NetworkListResponse, FleetError> {
        json(self.http.get(self.node_url(node, &["networks"])?)).await
    }

    pub async fn remove_network(&self, node: NodeId, id: &str) -> Result<(), FleetError> {
        let url = self.node_url(node, &["networks", id])?;
        empty(self.http.delete(url)).await
    }

    pub async fn prune_networks(&self, node: NodeId) -> Result<NetworksPruneResponse, FleetError> {
        json(self.http.post(self.node_url(node, &["networks", "prune"])?)).await
    }

    pub async fn create_volume(
        &self,
        node: NodeId,
        req: &VolumeCreate,
    ) -> Result<VolumeCreateResponse, FleetError> {
        let url = self.node_url(node, &["volumes"])?;
        json(self.http.post(url).json(req)).await
    }

    pub async fn list_volumes(&self, node: NodeId) -> Result<VolumeListResponse, FleetError> {
        json(self.http.get(self.node_url(node, &["volumes"])?)).await
    }

    pub async fn remove_volume(
        &self,
        node: NodeId,
        name: &str,
        force: bool,
    ) -> Result<(), FleetError> {
        let url = self.node_url(node, &["volumes", name])?;
        empty(self.http.delete(url).query(&[("force", force)])).await
    }

    pub async fn prune_volumes(
        &self,
        node: NodeId,
        all: bool,
    ) -> Result<VolumesPruneResponse, FleetError> {
        let url = self.node_url(node, &["volumes", "prune"])?;
        json(self.http.post(url).query(&[("all", all)])).await
    }

    /// Nodes with an agent currently attached to the controller.
    pub async fn agents(&self) -> Result<Agents, FleetError> {
        json(self.http.get(self.endpoint(&["agents"])?)).await
    }
}

async fn json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, FleetError> {
    let res = check(req.send().await?).await?;
    Ok(res.json::<T>().await?)
}

async fn empty(req: RequestBuilder) -> Result<(), FleetError> {
    check(req.send().await?).await?;
    Ok(())
}

async fn check(res: Response) -> Result<Response, FleetError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => FleetError::Api {
            status,
            error: parsed.error,
            message: parsed.message,
        },
        Err(_) => FleetError::Api {
            status,
            error: "unexpected_status".into(),
            message: body,
        },
    })
}
