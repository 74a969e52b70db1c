use serde::Deserialize;
use std::time::Duration;

use crate::services::retry::BackoffPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// Bucket generated assets and thumbnails are written to
    #[serde(default = "default_assets_bucket")]
    pub assets_bucket: String,

    /// Bucket user-uploaded reference images live in
    #[serde(default = "default_uploads_bucket")]
    pub uploads_bucket: String,

    /// Image provider API token
    pub provider_api_token: String,

    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,

    #[serde(default = "default_face_model")]
    pub face_model: String,

    #[serde(default = "default_reference_model")]
    pub sheet_model: String,

    #[serde(default = "default_reference_model")]
    pub photoshoot_model: String,

    /// Worker identity written to `locked_by`. Generated when unset.
    pub worker_id: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Timeout for provider and download requests
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Network-level retries inside one provider call
    #[serde(default = "default_provider_max_retries")]
    pub provider_max_retries: u32,

    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,

    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    /// Bind address for /health and /metrics
    #[serde(default = "default_ops_bind_addr")]
    pub ops_bind_addr: String,
}

fn default_assets_bucket() -> String {
    "assets".to_string()
}

fn default_uploads_bucket() -> String {
    "uploads".to_string()
}

fn default_provider_base_url() -> String {
    "https://api.replicate.com/v1".to_string()
}

fn default_face_model() -> String {
    "black-forest-labs/flux-1.1-pro".to_string()
}

fn default_reference_model() -> String {
    "black-forest-labs/flux-kontext-pro".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2500
}

fn default_max_attempts() -> i32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    30
}

fn default_backoff_cap_secs() -> u64 {
    3600
}

fn default_http_timeout_secs() -> u64 {
    120
}

fn default_provider_max_retries() -> u32 {
    3
}

fn default_signed_url_ttl_secs() -> u64 {
    3600
}

fn default_thumbnail_size() -> u32 {
    512
}

fn default_ops_bind_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// The subset of configuration job handlers and the poll loop read.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            worker_id: self.worker_id.clone().unwrap_or_else(generate_worker_id),
            assets_bucket: self.assets_bucket.clone(),
            uploads_bucket: self.uploads_bucket.clone(),
            face_model: self.face_model.clone(),
            sheet_model: self.sheet_model.clone(),
            photoshoot_model: self.photoshoot_model.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                base: Duration::from_secs(self.backoff_base_secs),
                cap: Duration::from_secs(self.backoff_cap_secs),
            },
            signed_url_ttl: Duration::from_secs(self.signed_url_ttl_secs),
            thumbnail_size: self.thumbnail_size,
            max_reference_images: 4,
        }
    }
}

fn generate_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

/// Runtime settings shared by handlers and the poll loop.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub worker_id: String,
    pub assets_bucket: String,
    pub uploads_bucket: String,
    pub face_model: String,
    pub sheet_model: String,
    pub photoshoot_model: String,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub signed_url_ttl: Duration,
    pub thumbnail_size: u32,
    /// Per-kind cap on reference images turned into thumbnails.
    pub max_reference_images: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker_id: "worker-local".to_string(),
            assets_bucket: default_assets_bucket(),
            uploads_bucket: default_uploads_bucket(),
            face_model: default_face_model(),
            sheet_model: default_reference_model(),
            photoshoot_model: default_reference_model(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            backoff: BackoffPolicy::default(),
            signed_url_ttl: Duration::from_secs(default_signed_url_ttl_secs()),
            thumbnail_size: default_thumbnail_size(),
            max_reference_images: 4,
        }
    }
}
