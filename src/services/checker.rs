use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of looking up one item in the object store.
///
/// `available = false` is a normal business answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCheck {
    pub available: bool,
    pub key: Option<String>,
    pub size: Option<u64>,
    pub download_url: Option<String>,
}

impl ItemCheck {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            key: None,
            size: None,
            download_url: None,
        }
    }
}

/// Looks up a single item. Implementations must be side-effect free so the
/// worker can retry a whole job safely.
#[async_trait]
pub trait ItemChecker: Send + Sync {
    async fn check(&self, item_id: u64) -> Result<ItemCheck, CheckError>;
}

/// A transient infrastructure failure while checking an item.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Item check failed: {0}")]
    Other(String),
}

/// Deterministic stand-in for a real object store: an item exists when its
/// id is a multiple of `divisor`.
#[derive(Debug, Clone)]
pub struct MockItemChecker {
    divisor: u64,
    download_base_url: String,
}

impl MockItemChecker {
    pub fn new(divisor: u64, download_base_url: impl Into<String>) -> Self {
        Self {
            divisor: divisor.max(1),
            download_base_url: download_base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for MockItemChecker {
    fn default() -> Self {
        Self::new(7, "https://downloads.example.com")
    }
}

#[async_trait]
impl ItemChecker for MockItemChecker {
    async fn check(&self, item_id: u64) -> Result<ItemCheck, CheckError> {
        if item_id % self.divisor != 0 {
            return Ok(ItemCheck::unavailable());
        }

        let key = format!("files/{}.bin", item_id);
        Ok(ItemCheck {
            available: true,
            download_url: Some(format!("{}/{}", self.download_base_url, key)),
            size: Some(1024 + (item_id % 1000) * 512),
            key: Some(key),
        })
    }
}
