// ABOUTME: Cold-tier FUSE projection via the platform mount helper
// ABOUTME: Degrades to an empty directory when the helper or platform is unavailable

use std::io::ErrorKind;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::env::GuestEnv;

/// The lazy-filesystem helper expected in the sandbox image. It daemonizes
/// after the mount is established, so a successful exit means mounted.
const MOUNT_HELPER: &str = "mount-s3";

/// Mount the user's cold prefix at the cold path. Returns whether a mount is
/// active; callers on unsupported platforms just see an empty directory.
pub async fn mount_cold(env: &GuestEnv) -> bool {
    if let Err(e) = tokio::fs::create_dir_all(&env.cold_path).await {
        warn!(error = %e, "could not create cold mount point; cold tier disabled");
        return false;
    }

    let prefix = format!("users/{}/cold/", env.user_id);
    let result = Command::new(MOUNT_HELPER)
        .arg("--prefix")
        .arg(&prefix)
        .arg("--region")
        .arg(&env.region)
        .arg("--allow-delete")
        .arg(&env.bucket)
        .arg(&env.cold_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) if status.success() => {
            info!(path = %env.cold_path.display(), "cold tier mounted");
            true
        }
        Ok(status) => {
            warn!(%status, "cold mount helper failed; cold tier disabled");
            false
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("cold mount helper not present on this platform; cold tier disabled");
            false
        }
        Err(e) => {
            warn!(error = %e, "cold mount helper could not run; cold tier disabled");
            false
        }
    }
}

/// Best-effort unmount during shutdown. Failures only get logged; the
/// container is going away either way.
pub async fn unmount_cold(env: &GuestEnv) {
    for (program, args) in [
        ("fusermount", vec!["-u"]),
        ("umount", Vec::new()),
    ] {
        let result = Command::new(program)
            .args(&args)
            .arg(&env.cold_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if matches!(result, Ok(status) if status.success()) {
            info!(path = %env.cold_path.display(), "cold tier unmounted");
            return;
        }
    }
    warn!(path = %env.cold_path.display(), "could not unmount cold tier");
}
