// ABOUTME: Hot-tier mirroring between the object store and the sandbox working set
// ABOUTME: Down at startup, up at shutdown; bounded retries, transient files excluded

use std::path::{Path, PathBuf};

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::env::{GuestEnv, GuestError, Result};

/// Directory names never worth mirroring in either direction.
const TRANSIENT_DIRS: &[&str] = &[".cache", "__pycache__", ".ipynb_checkpoints"];
/// File suffixes for editor and tooling scratch state.
const TRANSIENT_SUFFIXES: &[&str] = &[".tmp", ".swp", "~"];
const TRANSIENT_FILES: &[&str] = &[".DS_Store"];

/// Prefix marker object created by the orchestrator; not a real file.
const KEEP_MARKER: &str = ".keep";

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub files: u64,
    pub bytes: u64,
}

pub struct HotSync {
    client: Client,
    bucket: String,
    prefix: String,
    root: PathBuf,
}

impl HotSync {
    pub async fn new(env: &GuestEnv) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(env.region.clone()))
            .load()
            .await;
        Self::with_client(Client::new(&config), env)
    }

    pub fn with_client(client: Client, env: &GuestEnv) -> Self {
        Self {
            client,
            bucket: env.bucket.clone(),
            prefix: format!("users/{}/hot/", env.user_id),
            root: env.hot_path.clone(),
        }
    }

    /// Mirror the object store's hot prefix into the working set.
    pub async fn sync_down(&self) -> Result<SyncReport> {
        self.with_retry("sync-down", || self.sync_down_once()).await
    }

    /// Mirror the working set back into the object store's hot prefix.
    pub async fn sync_up(&self) -> Result<SyncReport> {
        self.with_retry("sync-up", || self.sync_up_once()).await
    }

    async fn sync_down_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| GuestError::ObjectStore(e.to_string()))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let Some(rel) = self.relative_of(key) else { continue };
                if skip_entry(rel) {
                    debug!(%rel, "skipping transient object");
                    continue;
                }

                let local = self.root.join(rel);
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                let response = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| GuestError::ObjectStore(e.to_string()))?;
                let body = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| GuestError::ObjectStore(e.to_string()))?
                    .into_bytes();

                report.files += 1;
                report.bytes += body.len() as u64;
                tokio::fs::write(&local, &body).await?;
            }
        }

        Ok(report)
    }

    async fn sync_up_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for (path, rel) in local_files(&self.root).await? {
            if skip_entry(&rel) {
                debug!(%rel, "skipping transient file");
                continue;
            }

            let body = ByteStream::from_path(&path)
                .await
                .map_err(|e| GuestError::ObjectStore(e.to_string()))?;
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(format!("{}{}", self.prefix, rel))
                .body(body)
                .send()
                .await
                .map_err(|e| GuestError::ObjectStore(e.to_string()))?;

            report.files += 1;
            report.bytes += size;
        }

        Ok(report)
    }

    fn relative_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rel = key.strip_prefix(&self.prefix)?;
        (!rel.is_empty()).then_some(rel)
    }

    /// Bounded exponential back-off. Each attempt is a full mirror pass, so a
    /// retried attempt simply overwrites what the previous one managed.
    async fn with_retry<F, Fut>(&self, label: &str, operation: F) -> Result<SyncReport>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<SyncReport>>,
    {
        use backoff::{future::retry, ExponentialBackoff};

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(std::time::Duration::from_secs(60)),
            ..Default::default()
        };

        retry(policy, || async {
            match operation().await {
                Ok(report) => Ok(report),
                Err(GuestError::ObjectStore(msg)) => {
                    warn!(%label, error = %msg, "transfer failed; retrying");
                    Err(backoff::Error::transient(GuestError::ObjectStore(msg)))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
        .map(|report| {
            info!(%label, files = report.files, bytes = report.bytes, "hot tier mirrored");
            report
        })
    }
}

/// True for objects and files the mirror should ignore.
fn skip_entry(rel: &str) -> bool {
    if rel == KEEP_MARKER {
        return true;
    }
    let components: Vec<&str> = rel.split('/').collect();
    if components
        .iter()
        .any(|component| TRANSIENT_DIRS.contains(component))
    {
        return true;
    }
    let name = components.last().copied().unwrap_or("");
    TRANSIENT_FILES.contains(&name)
        || TRANSIENT_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

/// Walk the working set, returning each regular file with its key-relative
/// path. The walk is blocking; it runs off the async runtime.
async fn local_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<(PathBuf, String)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            files.push((entry.path().to_path_buf(), rel));
        }
        Ok(files)
    })
    .await
    .map_err(|e| GuestError::ObjectStore(format!("walk task failed: {e}")))?
}
