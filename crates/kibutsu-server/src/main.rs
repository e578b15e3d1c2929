use std::sync::Arc;

use color_eyre::eyre::{self, WrapErr};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kibutsu_engine::{DockerGateway, EngineGateway};
use kibutsu_orchestrator::{Orchestrator, OrchestratorConfig};
use kibutsu_server::{create_app, AppState, ServerConfig};

const DEFAULT_LOG_FILTER: &str = "info,kibutsu=debug";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("Starting kibutsu compose service...");
    let config = ServerConfig::from_env().wrap_err("Invalid configuration")?;

    let gateway = DockerGateway::connect_local()
        .wrap_err("Failed to create Docker client")?
        .with_call_timeout(config.engine_timeout)
        .with_stop_timeout(config.stop_timeout_secs);
    let engine: Arc<dyn EngineGateway> = Arc::new(gateway);
    engine
        .ping()
        .await
        .wrap_err("Container engine is not reachable")?;
    info!("Connected to container engine");

    let orchestrator = Orchestrator::with_config(
        engine.clone(),
        OrchestratorConfig::default().with_create_concurrency(config.create_concurrency),
    );
    let bind_addr = config.bind_addr();
    let state = AppState::new(orchestrator.clone(), config);
    let shutdown = state.shutdown.clone();

    let watcher = orchestrator.notifier().watch_engine(
        engine,
        orchestrator.serializer().clone(),
        shutdown.clone(),
    );

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {bind_addr}"))?;
    info!("Listening on {}", bind_addr);

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = watcher.await {
        warn!("Engine watcher ended abnormally: {}", e);
    }
    info!("kibutsu stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
