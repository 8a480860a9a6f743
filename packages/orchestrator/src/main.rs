// ABOUTME: Orchestrator entry point: wiring, startup checks, and graceful shutdown

use std::net::SocketAddr;
use std::sync::Arc;

use skiff_sandbox::driver::DockerDriver;
use skiff_sandbox::manager::SandboxManager;
use skiff_sandbox::objectstore::ObjectStoreGateway;
use skiff_sandbox::reaper::Reaper;
use skiff_sandbox::store::{MemoryStore, PostgresStore, SandboxStore};
use tracing::{info, warn};

use skiff_orchestrator::config::{Config, StoreBackend};
use skiff_orchestrator::state::AppState;
use skiff_orchestrator::{api, logging};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    logging::init(&config);

    if config.api_key.is_empty() {
        warn!("no API key configured; accepting unauthenticated requests (dev mode)");
    }

    let store: Arc<dyn SandboxStore> = match config.sandbox_store_backend {
        StoreBackend::Memory => {
            info!("using in-memory sandbox store (state lost on restart)");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            info!("using postgres sandbox store");
            let url = config
                .database_url
                .as_deref()
                .expect("database_url checked during config load");
            Arc::new(PostgresStore::connect(url).await?)
        }
    };

    let driver = Arc::new(DockerDriver::connect()?);
    driver.ping().await?;
    info!("container engine reachable");

    let objects = if config.object_store_bucket.is_empty() {
        warn!("no object store bucket configured; sandboxes run without hot/cold storage");
        None
    } else {
        let gateway = Arc::new(
            ObjectStoreGateway::connect(&config.object_store_bucket, &config.object_store_region)
                .await,
        );
        gateway.verify_bucket().await?;
        Some(gateway)
    };

    let manager = Arc::new(SandboxManager::new(
        store,
        driver,
        objects,
        config.sandbox_settings(),
    ));

    let reaper = Reaper::new(manager.clone(), config.reaper_config());
    reaper.start().await;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = AppState::new(manager, Arc::new(config));
    let app = api::router(state);

    info!(%addr, version = env!("CARGO_PKG_VERSION"), "skiff orchestrator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.stop().await;
    info!("orchestrator shut down");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received");
}
