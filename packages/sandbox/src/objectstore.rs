// ABOUTME: Orchestrator-side object store gateway
// ABOUTME: Validates the bucket at startup and owns the per-user prefix layout

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Per-user prefix layout inside the bucket. Mirrored by the in-container
/// sync protocol; changing either side breaks existing sandboxes.
#[derive(Debug, Clone)]
pub struct UserPrefixes {
    pub hot: String,
    pub cold: String,
}

pub fn user_prefixes(user_id: &str) -> UserPrefixes {
    UserPrefixes {
        hot: format!("users/{user_id}/hot/"),
        cold: format!("users/{user_id}/cold/"),
    }
}

#[derive(Debug, Clone)]
pub struct TierStats {
    pub objects: u64,
    pub bytes: u64,
}

/// The orchestrator never moves object data itself; that happens inside the
/// sandbox. This gateway only validates reachability and prepares prefixes.
pub struct ObjectStoreGateway {
    client: Client,
    bucket: String,
}

impl ObjectStoreGateway {
    pub async fn connect(bucket: &str, region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Fail-fast reachability check, run once at process startup.
    pub async fn verify_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                GatewayError::Unavailable(format!("bucket {} not reachable: {e}", self.bucket))
            })?;
        info!(bucket = %self.bucket, "object store bucket verified");
        Ok(())
    }

    /// Make sure the user's hot and cold prefixes exist. The store has no
    /// real directories, so an empty prefix gets a zero-byte `.keep` marker.
    pub async fn ensure_user_prefixes(&self, user_id: &str) -> Result<()> {
        let prefixes = user_prefixes(user_id);
        for prefix in [&prefixes.hot, &prefixes.cold] {
            self.with_retry(|| self.ensure_prefix(prefix)).await?;
        }
        Ok(())
    }

    async fn ensure_prefix(&self, prefix: &str) -> Result<()> {
        let listed = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        if listed.key_count().unwrap_or(0) == 0 {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(format!("{prefix}.keep"))
                .body(Vec::new().into())
                .send()
                .await
                .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
            info!(bucket = %self.bucket, prefix = %prefix, "created storage prefix");
        }
        Ok(())
    }

    /// Object count and byte totals for one tier of a user's storage.
    pub async fn tier_stats(&self, user_id: &str, tier: &str) -> Result<TierStats> {
        let prefix = format!("users/{user_id}/{tier}/");
        let mut objects = 0u64;
        let mut bytes = 0u64;

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| GatewayError::Unavailable(e.to_string()))?;
            for object in page.contents() {
                objects += 1;
                bytes += object.size().unwrap_or(0).max(0) as u64;
            }
        }

        Ok(TierStats { objects, bytes })
    }

    /// Bounded exponential back-off for transient store failures; permanent
    /// refusal shows up quickly because the elapsed budget is short.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        use backoff::{future::retry, ExponentialBackoff};

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(std::time::Duration::from_secs(15)),
            ..Default::default()
        };

        retry(policy, || async {
            operation().await.map_err(backoff::Error::transient)
        })
        .await
    }
}
