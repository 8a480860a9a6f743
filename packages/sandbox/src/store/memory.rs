// ABOUTME: In-memory sandbox store over a locked map, the development default
// ABOUTME: All state is lost on restart; single-process only

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{RecordPatch, Result, SandboxRecord, SandboxStatus, SandboxStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SandboxRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn save(&self, record: &SandboxRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.sandbox_id) {
            return Err(StoreError::Conflict(record.sandbox_id.clone()));
        }
        records.insert(record.sandbox_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, sandbox_id: &str) -> Result<SandboxRecord> {
        let records = self.records.read().await;
        records
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(sandbox_id.to_string()))
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SandboxRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| user_id.map_or(true, |uid| r.user_id == uid))
            .cloned()
            .collect())
    }

    async fn update(&self, sandbox_id: &str, patch: RecordPatch) -> Result<SandboxRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(sandbox_id)
            .ok_or_else(|| StoreError::NotFound(sandbox_id.to_string()))?;
        patch.apply(record);
        Ok(record.clone())
    }

    async fn delete(&self, sandbox_id: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records.remove(sandbox_id).is_some())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| {
                matches!(r.status, SandboxStatus::Ready | SandboxStatus::Running)
                    && r.expires_at.map_or(false, |e| e <= now)
            })
            .cloned()
            .collect())
    }
}
