use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Memory,
    Docker,
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Docker
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub dispatch_retries: u32,
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_filter: default_log_filter(),
            default_timeout_ms: default_timeout_ms(),
            dispatch_retries: 0,
            engine: EngineKind::default(),
            docker_bin: default_docker_bin(),
        }
    }
}

impl AppConfig {
    /// Read `FLEET_*` variables (after loading `.env`), falling back to
    /// defaults when they cannot be deserialized.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Self::from_config)
            .unwrap_or_else(|err| {
                eprintln!("invalid FLEET_* configuration ({err}); using defaults");
                AppConfig::default().normalize()
            })
    }

    pub fn from_config(source: config::Config) -> Result<Self, config::ConfigError> {
        source.try_deserialize().map(AppConfig::normalize)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    fn normalize(mut self) -> Self {
        self.bind_addr = non_empty(self.bind_addr).unwrap_or_else(default_bind_addr);
        self.log_filter = non_empty(self.log_filter).unwrap_or_else(default_log_filter);
        self.docker_bin = non_empty(self.docker_bin).unwrap_or_else(default_docker_bin);
        if self.default_timeout_ms == 0 {
            self.default_timeout_ms = default_timeout_ms();
        }
        self
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_filter() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fleet_controller=debug".into())
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_docker_bin() -> String {
    "docker".to_string()
}
