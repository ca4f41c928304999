use serde::Deserialize;
use std::time::Duration;

use crate::models::api::ItemIdBounds;
use crate::services::retry::RetryPolicy;
use crate::services::storage::S3Settings;
use crate::services::worker::WorkerConfig;
use crate::store::{Retention, RetentionPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Address the worker process serves Prometheus metrics on
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string. Without it jobs live in memory only.
    pub database_url: Option<String>,

    /// Run the worker pool inside the API server process
    #[serde(default)]
    pub embedded_workers: bool,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    #[serde(default = "default_item_id_min")]
    pub item_id_min: u64,

    #[serde(default = "default_item_id_max")]
    pub item_id_max: u64,

    /// Mock checker: ids divisible by this are available
    #[serde(default = "default_mock_divisor")]
    pub mock_divisor: u64,

    /// Mock checker: base of the produced download URLs
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,

    /// S3-compatible bucket name; the mock checker is used unless all S3 fields are set
    pub s3_bucket: Option<String>,

    pub s3_endpoint: Option<String>,

    pub s3_access_key: Option<String>,

    pub s3_secret_key: Option<String>,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    #[serde(default = "default_s3_key_prefix")]
    pub s3_key_prefix: String,

    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u32,

    #[serde(default = "default_retain_completed_count")]
    pub retain_completed_count: usize,

    #[serde(default = "default_retain_completed_secs")]
    pub retain_completed_secs: i64,

    #[serde(default = "default_retain_failed_count")]
    pub retain_failed_count: usize,

    #[serde(default = "default_retain_failed_secs")]
    pub retain_failed_secs: i64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_lease_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_idle_poll_ms() -> u64 {
    1000
}

fn default_check_timeout_ms() -> u64 {
    10_000
}

fn default_item_id_min() -> u64 {
    1
}

fn default_item_id_max() -> u64 {
    1_000_000
}

fn default_mock_divisor() -> u64 {
    7
}

fn default_download_base_url() -> String {
    "https://downloads.example.com".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_s3_key_prefix() -> String {
    "files/".to_string()
}

fn default_presign_expiry_secs() -> u32 {
    3600
}

fn default_retain_completed_count() -> usize {
    1000
}

fn default_retain_completed_secs() -> i64 {
    3600
}

fn default_retain_failed_count() -> usize {
    5000
}

fn default_retain_failed_secs() -> i64 {
    86_400
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn item_id_bounds(&self) -> ItemIdBounds {
        ItemIdBounds {
            min: self.item_id_min,
            max: self.item_id_max,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn worker_config(&self, name: impl Into<String>) -> WorkerConfig {
        WorkerConfig {
            name: name.into(),
            worker_count: self.worker_count,
            lease: Duration::from_secs(self.lease_secs),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            check_timeout: Duration::from_millis(self.check_timeout_ms),
            retry: self.retry_policy(),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed: Retention {
                max_count: self.retain_completed_count,
                max_age: chrono::Duration::seconds(self.retain_completed_secs),
            },
            failed: Retention {
                max_count: self.retain_failed_count,
                max_age: chrono::Duration::seconds(self.retain_failed_secs),
            },
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// S3 settings, when every required field is present.
    pub fn s3_settings(&self) -> Option<S3Settings> {
        Some(S3Settings {
            bucket: self.s3_bucket.clone()?,
            endpoint: self.s3_endpoint.clone()?,
            region: self.s3_region.clone(),
            access_key: self.s3_access_key.clone()?,
            secret_key: self.s3_secret_key.clone()?,
            key_prefix: self.s3_key_prefix.clone(),
            presign_expiry_secs: self.presign_expiry_secs,
        })
    }
}
