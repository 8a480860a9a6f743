// ABOUTME: Entry point for the in-container lifecycle protocol
// ABOUTME: Startup: validate env, sync down, mount cold, signal ready; shutdown: sync up, unmount

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod env;
mod mount;
mod sync;

use env::{GuestEnv, GuestError};
use sync::HotSync;

/// The orchestrator's readiness poll looks for this file.
const READY_MARKER_PATH: &str = "/tmp/.skiff_ready";

#[derive(Parser, Debug)]
#[command(name = "skiff-guest")]
#[command(about = "In-container lifecycle protocol for skiff sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Full lifecycle: sync down, mount cold, signal ready, wait for
    /// termination, then run the shutdown sequence. The image entrypoint.
    Run,
    /// Mirror the hot prefix from the object store into the hot path.
    SyncDown,
    /// Mirror the hot path back into the object store.
    SyncUp,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Run => run().await,
        Command::SyncDown => one_shot_sync(Direction::Down).await,
        Command::SyncUp => one_shot_sync(Direction::Up).await,
    };

    if let Err(e) = result {
        error!(error = %e, "guest lifecycle failed");
        std::process::exit(1);
    }
}

enum Direction {
    Down,
    Up,
}

async fn one_shot_sync(direction: Direction) -> Result<(), GuestError> {
    let guest_env = GuestEnv::from_env()?;
    let sync = HotSync::new(&guest_env).await;
    match direction {
        Direction::Down => {
            tokio::fs::create_dir_all(&guest_env.hot_path).await?;
            sync.sync_down().await?;
        }
        Direction::Up => {
            sync.sync_up().await?;
        }
    }
    Ok(())
}

async fn run() -> Result<(), GuestError> {
    let guest_env = GuestEnv::from_env()?;
    info!(
        sandbox_id = %guest_env.sandbox_id,
        user_id = %guest_env.user_id,
        "sandbox starting"
    );

    tokio::fs::create_dir_all(&guest_env.hot_path).await?;
    let sync = HotSync::new(&guest_env).await;
    sync.sync_down().await?;

    let mounted = mount::mount_cold(&guest_env).await;

    prepare_agent_env(&guest_env).await?;

    tokio::fs::write(READY_MARKER_PATH, b"").await?;
    info!("sandbox ready");

    wait_for_termination().await;

    // Shutdown sequence. Bounded by the configured window; the orchestrator
    // force-removes the container once it closes.
    let _ = tokio::fs::remove_file(READY_MARKER_PATH).await;

    let mut clean = true;
    match tokio::time::timeout(guest_env.shutdown_timeout, sync.sync_up()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            error!(error = %e, "hot sync up failed during shutdown");
            clean = false;
        }
        Err(_) => {
            error!(
                timeout_secs = guest_env.shutdown_timeout.as_secs(),
                "hot sync up did not finish within the shutdown window"
            );
            clean = false;
        }
    }

    if mounted {
        mount::unmount_cold(&guest_env).await;
    }
    cleanup_local_caches(&guest_env).await;

    if clean {
        info!("sandbox shut down cleanly");
        Ok(())
    } else {
        Err(GuestError::ObjectStore(
            "shutdown sequence finished with errors".to_string(),
        ))
    }
}

/// Environment files for the agent account: a profile snippet exporting the
/// sandbox coordinates so interactive shells and SDKs can find them.
async fn prepare_agent_env(guest_env: &GuestEnv) -> Result<(), GuestError> {
    let profile = guest_env.hot_path.join(".skiff_profile");
    let contents = format!(
        "export SANDBOX_ID={}\nexport USER_ID={}\nexport HOT_PATH={}\nexport COLD_PATH={}\n",
        guest_env.sandbox_id,
        guest_env.user_id,
        guest_env.hot_path.display(),
        guest_env.cold_path.display(),
    );
    tokio::fs::write(&profile, contents).await?;
    Ok(())
}

async fn cleanup_local_caches(guest_env: &GuestEnv) {
    let cache = guest_env.hot_path.join(".cache");
    if tokio::fs::remove_dir_all(&cache).await.is_ok() {
        info!(path = %cache.display(), "cleared local cache");
    }
}

async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler; waiting on SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("termination signal received"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }
}
