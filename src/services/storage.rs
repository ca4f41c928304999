use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

use super::checker::{CheckError, ItemCheck, ItemChecker};

/// Connection settings for the S3-compatible bucket holding the files.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub key_prefix: String,
    pub presign_expiry_secs: u32,
}

/// Item checker backed by an S3-compatible object store (R2, MinIO, AWS).
pub struct S3ItemChecker {
    bucket: Box<Bucket>,
    key_prefix: String,
    presign_expiry_secs: u32,
}

impl S3ItemChecker {
    pub fn new(settings: &S3Settings) -> Result<Self, CheckError> {
        let region = Region::Custom {
            region: settings.region.clone(),
            endpoint: settings.endpoint.clone(),
        };

        let credentials = Credentials::new(
            Some(&settings.access_key),
            Some(&settings.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| CheckError::Config(e.to_string()))?;

        let bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| CheckError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            key_prefix: settings.key_prefix.clone(),
            presign_expiry_secs: settings.presign_expiry_secs,
        })
    }

    fn object_key(&self, item_id: u64) -> String {
        format!("{}{}", self.key_prefix, item_id)
    }
}

#[async_trait]
impl ItemChecker for S3ItemChecker {
    async fn check(&self, item_id: u64) -> Result<ItemCheck, CheckError> {
        let key = self.object_key(item_id);

        let head = match self.bucket.head_object(&key).await {
            Ok((head, 200..=299)) => head,
            Ok((_, 404)) | Err(S3Error::HttpFailWithBody(404, _)) => {
                return Ok(ItemCheck::unavailable());
            }
            Ok((_, status)) => {
                return Err(CheckError::Other(format!(
                    "HEAD {} returned status {}",
                    key, status
                )));
            }
            Err(e) => return Err(CheckError::S3(e)),
        };

        let download_url = self
            .bucket
            .presign_get(&key, self.presign_expiry_secs, None)
            .await?;

        tracing::trace!(item_id, key = %key, size = ?head.content_length, "Item available");

        Ok(ItemCheck {
            available: true,
            size: head.content_length.and_then(|len| u64::try_from(len).ok()),
            key: Some(key),
            download_url: Some(download_url),
        })
    }
}
