// ABOUTME: Validation of the environment contract the orchestrator passes to every sandbox
// ABOUTME: A missing or malformed variable aborts startup before any storage is touched

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuestError {
    #[error("missing or empty environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GuestError>;

/// The contract from the orchestrator's container spec.
#[derive(Debug, Clone)]
pub struct GuestEnv {
    pub sandbox_id: String,
    pub user_id: String,
    pub bucket: String,
    pub region: String,
    pub hot_path: PathBuf,
    pub cold_path: PathBuf,
    pub shutdown_timeout: Duration,
}

impl GuestEnv {
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        let required = |key: &'static str| -> Result<String> {
            match vars.get(key) {
                Some(value) if !value.is_empty() => Ok(value.clone()),
                _ => Err(GuestError::MissingEnv(key)),
            }
        };

        let absolute = |key: &'static str| -> Result<PathBuf> {
            let value = required(key)?;
            if !value.starts_with('/') {
                return Err(GuestError::InvalidEnv { key, value });
            }
            Ok(PathBuf::from(value))
        };

        let shutdown_timeout = match vars.get("SHUTDOWN_TIMEOUT_SECONDS") {
            None => Duration::from_secs(30),
            Some(value) => {
                let seconds: u64 = value.parse().map_err(|_| GuestError::InvalidEnv {
                    key: "SHUTDOWN_TIMEOUT_SECONDS",
                    value: value.clone(),
                })?;
                Duration::from_secs(seconds)
            }
        };

        Ok(GuestEnv {
            sandbox_id: required("SANDBOX_ID")?,
            user_id: required("USER_ID")?,
            bucket: required("S3_BUCKET")?,
            region: vars
                .get("S3_REGION")
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| "us-east-1".to_string()),
            hot_path: absolute("HOT_PATH")?,
            cold_path: absolute("COLD_PATH")?,
            shutdown_timeout,
        })
    }
}
