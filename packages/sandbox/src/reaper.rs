// ABOUTME: Background reconciliation and expiry loops
// ABOUTME: Detects registry/engine drift and tears down sandboxes whose lease has lapsed

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{error, info, warn};

use crate::driver::MANAGED_LABEL;
use crate::manager::{ManagerError, SandboxManager};

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub reconcile_interval: Duration,
    pub expiry_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            expiry_interval: Duration::from_secs(60),
        }
    }
}

/// Owns the two background loops. Each pass is independent; one sandbox
/// failing never aborts the sweep.
pub struct Reaper {
    manager: Arc<SandboxManager>,
    config: ReaperConfig,
    running: Arc<RwLock<bool>>,
}

impl Reaper {
    pub fn new(manager: Arc<SandboxManager>, config: ReaperConfig) -> Self {
        Self {
            manager,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn the reconciliation and expiry tasks. Idempotent.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let manager = self.manager.clone();
        let running_flag = self.running.clone();
        let interval = self.config.reconcile_interval;
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "reconciliation loop started");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !*running_flag.read().await {
                    info!("reconciliation loop stopped");
                    break;
                }
                if let Err(e) = reconcile_once(&manager).await {
                    error!(error = %e, "reconciliation pass failed");
                }
            }
        });

        let manager = self.manager.clone();
        let running_flag = self.running.clone();
        let interval = self.config.expiry_interval;
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "expiry loop started");
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !*running_flag.read().await {
                    info!("expiry loop stopped");
                    break;
                }
                if let Err(e) = expire_once(&manager).await {
                    error!(error = %e, "expiry pass failed");
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}

/// One reconciliation pass: every non-terminal record with a container id
/// must have a live labelled container behind it, and every live labelled
/// container should belong to a record. Drifted records are stopped; unowned
/// containers are only logged — destroying them could race an in-flight
/// create.
pub async fn reconcile_once(manager: &SandboxManager) -> Result<(), ManagerError> {
    let records = manager.store().list(None).await?;
    let live = manager
        .driver()
        .list_by_label(MANAGED_LABEL, "true")
        .await?;

    let live_ids: HashSet<&str> = live.iter().map(|c| c.container_id.as_str()).collect();

    let mut lost = 0usize;
    for record in records.iter().filter(|r| r.status.is_active()) {
        let Some(container_id) = &record.container_id else {
            // Mid-create; the provisioning path owns this record.
            continue;
        };
        if !live_ids.contains(container_id.as_str()) {
            warn!(
                sandbox_id = %record.sandbox_id,
                %container_id,
                status = record.status.as_str(),
                "record has no live container; reconciling"
            );
            match manager.mark_lost(&record.sandbox_id).await {
                Ok(_) => lost += 1,
                Err(e) => error!(sandbox_id = %record.sandbox_id, error = %e, "drift recovery failed"),
            }
        }
    }

    let referenced: HashSet<&str> = records
        .iter()
        .filter(|r| r.status.is_active())
        .filter_map(|r| r.container_id.as_deref())
        .collect();

    for container in &live {
        if !referenced.contains(container.container_id.as_str()) {
            warn!(
                container_id = %container.container_id,
                sandbox_id = ?container.sandbox_id,
                "live container not referenced by any active record; leaving it alone"
            );
        }
    }

    if lost > 0 {
        info!(reconciled = lost, "reconciliation pass complete");
    }
    Ok(())
}

/// One expiry pass over every lapsed lease.
pub async fn expire_once(manager: &SandboxManager) -> Result<(), ManagerError> {
    let expired = manager.store().list_expired(Utc::now()).await?;
    if expired.is_empty() {
        return Ok(());
    }

    info!(count = expired.len(), "expiring stale sandboxes");
    for record in expired {
        if let Err(e) = manager.expire_sandbox(&record.sandbox_id).await {
            error!(
                sandbox_id = %record.sandbox_id,
                error = %e,
                "failed to expire sandbox"
            );
        }
    }
    Ok(())
}
