// ABOUTME: Orchestrator process configuration loaded from SKIFF_-prefixed environment variables
// ABOUTME: One Config instance is built at startup and shared read-only afterwards

use std::env;
use std::str::FromStr;
use std::time::Duration;

use skiff_sandbox::manager::SandboxSettings;
use skiff_sandbox::reaper::ReaperConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("SKIFF_DATABASE_URL must be set when SKIFF_SANDBOX_STORE_BACKEND=postgres")]
    MissingDatabaseUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" => Ok(Self::Postgres),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Shared API secret. Empty means unauthenticated mode, an explicit
    /// opt-in for local development.
    pub api_key: String,
    pub api_key_header_name: String,
    pub sandbox_image_ref: String,
    pub object_store_bucket: String,
    pub object_store_region: String,
    pub sandbox_store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub default_ttl_seconds: i64,
    pub exec_default_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub readiness_timeout_seconds: u64,
    pub reconcile_interval_seconds: u64,
    pub expiry_interval_seconds: u64,
    pub max_command_bytes: usize,
    pub container_cpu_limit: f64,
    pub container_memory_limit_mb: u64,
    pub docker_network: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let sandbox_store_backend: StoreBackend = parse_env("SKIFF_SANDBOX_STORE_BACKEND", "memory")?;
        let database_url = env::var("SKIFF_DATABASE_URL").ok().filter(|s| !s.is_empty());
        if sandbox_store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        Ok(Config {
            host: string_env("SKIFF_HOST", "0.0.0.0"),
            port: parse_env("SKIFF_PORT", "8000")?,
            api_key: string_env("SKIFF_API_KEY", ""),
            api_key_header_name: string_env("SKIFF_API_KEY_HEADER_NAME", "X-API-Key"),
            sandbox_image_ref: string_env("SKIFF_SANDBOX_IMAGE_REF", "skiff-sandbox:latest"),
            object_store_bucket: string_env("SKIFF_OBJECT_STORE_BUCKET", ""),
            object_store_region: string_env("SKIFF_OBJECT_STORE_REGION", "us-east-1"),
            sandbox_store_backend,
            database_url,
            default_ttl_seconds: parse_env("SKIFF_DEFAULT_TTL_SECONDS", "7200")?,
            exec_default_timeout_seconds: parse_env("SKIFF_EXEC_DEFAULT_TIMEOUT_SECONDS", "300")?,
            shutdown_timeout_seconds: parse_env("SKIFF_SHUTDOWN_TIMEOUT_SECONDS", "30")?,
            readiness_timeout_seconds: parse_env("SKIFF_READINESS_TIMEOUT_SECONDS", "60")?,
            reconcile_interval_seconds: parse_env("SKIFF_RECONCILE_INTERVAL_SECONDS", "60")?,
            expiry_interval_seconds: parse_env("SKIFF_EXPIRY_INTERVAL_SECONDS", "60")?,
            max_command_bytes: parse_env("SKIFF_MAX_COMMAND_BYTES", "10000")?,
            container_cpu_limit: parse_env("SKIFF_CONTAINER_CPU_LIMIT", "2.0")?,
            container_memory_limit_mb: parse_env("SKIFF_CONTAINER_MEMORY_LIMIT_MB", "4096")?,
            docker_network: string_env("SKIFF_DOCKER_NETWORK", "bridge"),
            log_level: string_env("SKIFF_LOG_LEVEL", "info"),
            log_format: parse_env("SKIFF_LOG_FORMAT", "text")?,
        })
    }

    /// Policy handed to the lifecycle manager.
    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            image_ref: self.sandbox_image_ref.clone(),
            bucket: self.object_store_bucket.clone(),
            region: self.object_store_region.clone(),
            docker_network: self.docker_network.clone(),
            orchestrator_url: format!("http://host.docker.internal:{}", self.port),
            default_ttl_seconds: self.default_ttl_seconds,
            exec_timeout: Duration::from_secs(self.exec_default_timeout_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_seconds),
            readiness_poll_interval: Duration::from_secs(2),
            max_command_bytes: self.max_command_bytes,
            cpu_limit: self.container_cpu_limit,
            memory_limit_mb: self.container_memory_limit_mb,
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            reconcile_interval: Duration::from_secs(self.reconcile_interval_seconds),
            expiry_interval: Duration::from_secs(self.expiry_interval_seconds),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: String::new(),
            api_key_header_name: "X-API-Key".to_string(),
            sandbox_image_ref: "skiff-sandbox:latest".to_string(),
            object_store_bucket: String::new(),
            object_store_region: "us-east-1".to_string(),
            sandbox_store_backend: StoreBackend::Memory,
            database_url: None,
            default_ttl_seconds: 7200,
            exec_default_timeout_seconds: 300,
            shutdown_timeout_seconds: 30,
            readiness_timeout_seconds: 60,
            reconcile_interval_seconds: 60,
            expiry_interval_seconds: 60,
            max_command_bytes: 10_000,
            container_cpu_limit: 2.0,
            container_memory_limit_mb: 4096,
            docker_network: "bridge".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

fn string_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: raw,
    })
}
