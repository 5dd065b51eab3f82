use std::path::PathBuf;

use async_trait::async_trait;
use fleet_proto::{
    NetworkCreate, NetworkCreateResponse, NetworkListResponse, NetworkRemove, NetworkSummary,
    NetworksPruneResponse, VolumeCreate, VolumeCreateResponse, VolumeListResponse, VolumeRemove,
    VolumeSummary, VolumesPrune, VolumesPruneResponse,
};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::{DockerEngine, EngineError};

/// Engine that drives the local daemon through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCliEngine {
    bin: PathBuf,
}

impl Default for DockerCliEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliEngine {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: Vec<String>) -> Result<String, EngineError> {
        debug!(bin = %self.bin.display(), ?args, "running docker");
        let output = Command::new(&self.bin).args(&args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Docker(
                stderr.trim().trim_start_matches("Error response from daemon: ").to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn label_args(labels: &std::collections::BTreeMap<String, String>, args: &mut Vec<String>) {
    for (key, value) in labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
}

#[derive(Deserialize)]
struct NetworkLsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Driver")]
    driver: String,
    #[serde(rename = "Scope")]
    scope: String,
    #[serde(rename = "Internal", default)]
    internal: String,
}

#[derive(Deserialize)]
struct VolumeLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Driver")]
    driver: String,
    #[serde(rename = "Mountpoint", default)]
    mountpoint: String,
}

fn json_lines<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<Vec<T>, EngineError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(|err| EngineError::Parse(err.to_string())))
        .collect()
}

pub(crate) fn parse_network_ls(stdout: &str) -> Result<Vec<NetworkSummary>, EngineError> {
    Ok(json_lines::<NetworkLsLine>(stdout)?
        .into_iter()
        .map(|line| NetworkSummary {
            id: line.id,
            name: line.name,
            driver: line.driver,
            scope: line.scope,
            internal: line.internal.eq_ignore_ascii_case("true"),
        })
        .collect())
}

pub(crate) fn parse_volume_ls(stdout: &str) -> Result<Vec<VolumeSummary>, EngineError> {
    Ok(json_lines::<VolumeLine>(stdout)?
        .into_iter()
        .map(|line| VolumeSummary {
            name: line.name,
            driver: line.driver,
            mountpoint: line.mountpoint,
        })
        .collect())
}

/// Names listed under `header` in a prune summary, up to the first blank line.
pub(crate) fn parse_prune_list(stdout: &str, header: &str) -> Vec<String> {
    stdout
        .lines()
        .skip_while(|line| line.trim() != header)
        .skip(1)
        .map(str::trim)
        .take_while(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_reclaimed(stdout: &str) -> String {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Total reclaimed space:"))
        .map(|rest| rest.trim().to_string())
        .unwrap_or_else(|| "0B".into())
}

#[async_trait]
impl DockerEngine for DockerCliEngine {
    async fn network_create(
        &self,
        req: NetworkCreate,
    ) -> Result<NetworkCreateResponse, EngineError> {
        let mut args = vec!["network".to_string(), "create".to_string()];
        if let Some(driver) = &req.driver {
            args.push("--driver".into());
            args.push(driver.clone());
        }
        if req.internal {
            args.push("--internal".into());
        }
        if req.attachable {
            args.push("--attachable".into());
        }
        label_args(&req.labels, &mut args);
        args.push(req.name);
        let stdout = self.run(args).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(EngineError::Parse("network create printed no id".into()));
        }
        Ok(NetworkCreateResponse { id, warning: None })
    }

    async fn network_list(&self) -> Result<NetworkListResponse, EngineError> {
        let stdout = self
            .run(vec![
                "network".into(),
                "ls".into(),
                "--no-trunc".into(),
                "--format".into(),
                "{{json .}}".into(),
            ])
            .await?;
        Ok(NetworkListResponse {
            items: parse_network_ls(&stdout)?,
        })
    }

    async fn network_remove(&self, req: NetworkRemove) -> Result<(), EngineError> {
        self.run(vec!["network".into(), "rm".into(), req.id]).await?;
        Ok(())
    }

    async fn networks_prune(&self) -> Result<NetworksPruneResponse, EngineError> {
        let stdout = self
            .run(vec!["network".into(), "prune".into(), "--force".into()])
            .await?;
        Ok(NetworksPruneResponse {
            networks_deleted: parse_prune_list(&stdout, "Deleted Networks:"),
        })
    }

    async fn volume_create(&self, req: VolumeCreate) -> Result<VolumeCreateResponse, EngineError> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        if let Some(driver) = &req.driver {
            args.push("--driver".into());
            args.push(driver.clone());
        }
        label_args(&req.labels, &mut args);
        if !req.name.trim().is_empty() {
            args.push(req.name);
        }
        let name = self.run(args).await?.trim().to_string();
        let stdout = self
            .run(vec![
                "volume".into(),
                "inspect".into(),
                "--format".into(),
                "{{json .}}".into(),
                name,
            ])
            .await?;
        let line = json_lines::<VolumeLine>(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Parse("volume inspect printed nothing".into()))?;
        Ok(VolumeCreateResponse {
            name: line.name,
            driver: line.driver,
            mountpoint: line.mountpoint,
        })
    }

    async fn volume_list(&self) -> Result<VolumeListResponse, EngineError> {
        let stdout = self
            .run(vec![
                "volume".into(),
                "ls".into(),
                "--format".into(),
                "{{json .}}".into(),
            ])
            .await?;
        Ok(VolumeListResponse {
            items: parse_volume_ls(&stdout)?,
        })
    }

    async fn volume_remove(&self, req: VolumeRemove) -> Result<(), EngineError> {
        let mut args = vec!["volume".to_string(), "rm".to_string()];
        if req.force {
            args.push("--force".into());
        }
        args.push(req.name);
        self.run(args).await?;
        Ok(())
    }

    async fn volumes_prune(
        &self,
        req: VolumesPrune,
    ) -> Result<VolumesPruneResponse, EngineError> {
        let mut args = vec!["volume".to_string(), "prune".to_string(), "--force".into()];
        if req.all {
            args.push("--all".into());
        }
        let stdout = self.run(args).await?;
        Ok(VolumesPruneResponse {
            volumes_deleted: parse_prune_list(&stdout, "Deleted Volumes:"),
            space_reclaimed: parse_reclaimed(&stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_ls_json_lines() {
        let stdout = concat!(
            r#"{"CreatedAt":"2024-01-01","Driver":"bridge","ID":"abc123","Internal":"false","Name":"bridge","Scope":"local"}"#,
            "\n",
            r#"{"Driver":"overlay","ID":"def456","Internal":"true","Name":"backend","Scope":"swarm"}"#,
            "\n\n"
        );
        let items = parse_network_ls(stdout).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "abc123");
        assert!(!items[0].internal);
        assert_eq!(items[1].name, "backend");
        assert!(items[1].internal);
    }

    #[test]
    fn rejects_garbled_ls_output() {
        assert!(matches!(
            parse_volume_ls("not json"),
            Err(EngineError::Parse(_))
        ));
    }

    #[test]
    fn parses_prune_summary() {
        let stdout = "Deleted Volumes:\nv1\n3f2a\n\nTotal reclaimed space: 1.5kB\n";
        assert_eq!(parse_prune_list(stdout, "Deleted Volumes:"), vec!["v1", "3f2a"]);
        assert_eq!(parse_reclaimed(stdout), "1.5kB");
    }

    #[test]
    fn empty_prune_reclaims_nothing() {
        assert!(parse_prune_list("", "Deleted Networks:").is_empty());
        assert_eq!(parse_reclaimed("Total reclaimed space: 0B"), "0B");
        assert_eq!(parse_reclaimed(""), "0B");
    }

    #[tokio::test]
    async fn missing_binary_is_io_error() {
        let engine = DockerCliEngine::new("/nonexistent/fleet-docker");
        let err = engine.network_list().await.unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
