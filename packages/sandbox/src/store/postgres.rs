// ABOUTME: Postgres-backed sandbox store for production deployments
// ABOUTME: Single-row statements only; schema constraints and triggers live in migrations/

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::{
    RecordPatch, Result, SandboxRecord, SandboxStatus, SandboxStore, StopReason, StoreError,
};

const COLUMNS: &str = "sandbox_id, user_id, container_id, status, hot_path, cold_path, cwd, \
                       config, ttl_seconds, expires_at, last_heartbeat_at, stopped_at, \
                       stop_reason, created_at, updated_at";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect, run embedded migrations, and return a ready store.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))?;

        info!("postgres sandbox store ready");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: PgRow) -> Result<SandboxRecord> {
        let status: String = row.try_get("status")?;
        let stop_reason: Option<String> = row.try_get("stop_reason")?;
        Ok(SandboxRecord {
            sandbox_id: row.try_get("sandbox_id")?,
            user_id: row.try_get("user_id")?,
            container_id: row.try_get("container_id")?,
            status: SandboxStatus::from_str(&status)?,
            hot_path: row.try_get("hot_path")?,
            cold_path: row.try_get("cold_path")?,
            cwd: row.try_get("cwd")?,
            config: row.try_get::<JsonValue, _>("config")?,
            ttl_seconds: row.try_get("ttl_seconds")?,
            expires_at: row.try_get("expires_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            stopped_at: row.try_get("stopped_at")?,
            stop_reason: stop_reason
                .map(|s| StopReason::from_str(&s))
                .transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SandboxStore for PostgresStore {
    async fn save(&self, record: &SandboxRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sandboxes (
                sandbox_id, user_id, container_id, status, hot_path, cold_path, cwd,
                config, ttl_seconds, expires_at, last_heartbeat_at, stopped_at,
                stop_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&record.sandbox_id)
        .bind(&record.user_id)
        .bind(&record.container_id)
        .bind(record.status.as_str())
        .bind(&record.hot_path)
        .bind(&record.cold_path)
        .bind(&record.cwd)
        .bind(&record.config)
        .bind(record.ttl_seconds)
        .bind(record.expires_at)
        .bind(record.last_heartbeat_at)
        .bind(record.stopped_at)
        .bind(record.stop_reason.map(|r| r.as_str()))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false)
                {
                    Err(StoreError::Conflict(record.sandbox_id.clone()))
                } else {
                    Err(StoreError::Database(e))
                }
            }
        }
    }

    async fn get(&self, sandbox_id: &str) -> Result<SandboxRecord> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sandboxes WHERE sandbox_id = $1"
        ))
        .bind(sandbox_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(row),
            None => Err(StoreError::NotFound(sandbox_id.to_string())),
        }
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SandboxRecord>> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM sandboxes WHERE user_id = $1 ORDER BY created_at DESC"
                ))
                .bind(uid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM sandboxes ORDER BY created_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn update(&self, sandbox_id: &str, patch: RecordPatch) -> Result<SandboxRecord> {
        // Single-row, single-statement update; absent patch fields fall back
        // to the current column value. updated_at is advanced by the trigger.
        let row = sqlx::query(&format!(
            r#"
            UPDATE sandboxes SET
                status = COALESCE($2, status),
                container_id = COALESCE($3, container_id),
                cwd = COALESCE($4, cwd),
                config = COALESCE($5, config),
                expires_at = COALESCE($6, expires_at),
                last_heartbeat_at = COALESCE($7, last_heartbeat_at),
                stopped_at = COALESCE($8, stopped_at),
                stop_reason = COALESCE($9, stop_reason)
            WHERE sandbox_id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(sandbox_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.container_id)
        .bind(&patch.cwd)
        .bind(&patch.config)
        .bind(patch.expires_at)
        .bind(patch.last_heartbeat_at)
        .bind(patch.stopped_at)
        .bind(patch.stop_reason.map(|r| r.as_str()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(row),
            None => Err(StoreError::NotFound(sandbox_id.to_string())),
        }
    }

    async fn delete(&self, sandbox_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE sandbox_id = $1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM sandboxes
            WHERE status IN ('ready', 'running')
              AND expires_at IS NOT NULL
              AND expires_at <= $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}
