use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use fleet_controller::config::{AppConfig, EngineKind};
use fleet_controller::dispatcher::Dispatcher;
use fleet_controller::metrics;
use fleet_controller::routes;
use fleet_controller::state::AppState;
use fleet_controller::telemetry::init_tracing;
use fleet_engine::{DockerCliEngine, DockerEngine, MemoryEngine};
use node_bus::{LocalBus, NodeBus};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    init_tracing(&cfg.log_filter);

    let bind_addr: SocketAddr = cfg
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.bind_addr))?;
    let engine: Arc<dyn DockerEngine> = match cfg.engine {
        EngineKind::Memory => Arc::new(MemoryEngine::new()),
        EngineKind::Docker => Arc::new(DockerCliEngine::new(&cfg.docker_bin)),
    };
    let bus = LocalBus::new();
    let dispatcher = Arc::new(Dispatcher::new(
        engine,
        Arc::new(bus.clone()) as Arc<dyn NodeBus>,
    ));
    let _pump = dispatcher.spawn_reply_pump();

    let app_state = AppState::new(
        dispatcher,
        bus,
        cfg.default_timeout(),
        cfg.dispatch_retries,
    );
    let app: Router = routes::router(app_state);

    info!(
        addr = %bind_addr,
        engine = ?cfg.engine,
        docker_bin = %cfg.docker_bin,
        default_timeout_ms = cfg.default_timeout_ms,
        dispatch_retries = cfg.dispatch_retries,
        "starting fleet-controller"
    );
    metrics::BOOT_COUNTER.inc();
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
