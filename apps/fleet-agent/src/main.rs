use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use fleet_agent::{agent_socket_url, run_forever, AgentRuntime};
use fleet_engine::{DockerCliEngine, DockerEngine, MemoryEngine};
use fleet_proto::NodeId;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    Memory,
    Docker,
}

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(about = "Executes fleet commands on this node's Docker engine")]
struct Cli {
    /// Controller base URL (http(s) or ws(s))
    #[arg(long, env = "FLEET_CONTROLLER_URL", default_value = "ws://127.0.0.1:8080")]
    controller_url: String,

    /// Identity of this node; must not be 1
    #[arg(long, env = "FLEET_NODE_ID")]
    node_id: NodeId,

    #[arg(long, env = "FLEET_AGENT_ENGINE", value_enum, default_value = "docker")]
    engine: EngineArg,

    #[arg(long, env = "FLEET_DOCKER_BIN", default_value = "docker")]
    docker_bin: String,

    /// Delay between reconnect attempts
    #[arg(long, env = "FLEET_RECONNECT_DELAY_MS", default_value_t = 2_000)]
    reconnect_delay_ms: u64,

    #[arg(long, env = "RUST_LOG", default_value = "info,fleet_agent=debug")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env_filter = EnvFilter::try_new(&cli.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init();

    if cli.node_id.is_controller() {
        bail!("node 1 is the controller's own engine; pick another node id");
    }
    let engine: Arc<dyn DockerEngine> = match cli.engine {
        EngineArg::Memory => Arc::new(MemoryEngine::new()),
        EngineArg::Docker => Arc::new(DockerCliEngine::new(&cli.docker_bin)),
    };
    let runtime = Arc::new(AgentRuntime::new(cli.node_id, engine));
    let url = agent_socket_url(&cli.controller_url, cli.node_id);
    info!(url = %url, node = %cli.node_id, engine = ?cli.engine, "starting fleet-agent");

    tokio::select! {
        _ = run_forever(url, runtime, Duration::from_millis(cli.reconnect_delay_ms)) => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }
    Ok(())
}
