use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::time::Duration;

/// Object storage as the pipeline consumes it.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store bytes under `path`. Fails with [`StorageError::AlreadyExists`]
    /// rather than overwriting an existing object.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Time-limited GET URL for an object.
    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    region: Region,
    credentials: Credentials,
}

impl R2Client {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))
    }
}

#[async_trait]
impl ObjectStorage for R2Client {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        validate_object_path(path)?;
        let bucket_handle = self.bucket(bucket)?;

        let (_, head_status) = bucket_handle.head_object(path).await?;
        if is_success(head_status) {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        let response = bucket_handle
            .put_object_with_content_type(path, data, content_type)
            .await?;
        check_status("upload", response.status_code())
    }

    async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        validate_object_path(path)?;
        let expiry_secs = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX).max(1);
        let url = self
            .bucket(bucket)?
            .presign_get(path, expiry_secs, None)
            .await?;
        Ok(url)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError> {
        validate_object_path(path)?;
        let response = self.bucket(bucket)?.delete_object(path).await?;
        match response.status_code() {
            404 => Ok(()),
            code => check_status("delete", code),
        }
    }
}

fn is_success(code: u16) -> bool {
    (200..300).contains(&code)
}

fn check_status(op: &'static str, code: u16) -> Result<(), StorageError> {
    if is_success(code) {
        Ok(())
    } else {
        Err(StorageError::Status { op, code })
    }
}

/// Reject paths that cannot be valid object keys. These are permanent
/// failures: retrying will not fix them.
pub fn validate_object_path(path: &str) -> Result<(), StorageError> {
    let invalid = path.is_empty()
        || path.len() > 1024
        || path.starts_with('/')
        || path.ends_with('/')
        || path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
        || path.chars().any(char::is_control);

    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Object already exists: {bucket}/{path}")]
    AlreadyExists { bucket: String, path: String },

    #[error("Storage {op} returned HTTP {code}")]
    Status { op: &'static str, code: u16 },

    #[error("Invalid object path: {0:?}")]
    InvalidPath(String),
}

impl StorageError {
    /// Failures that will not change on retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            StorageError::InvalidPath(_) | StorageError::Config(_) => true,
            StorageError::Status { code, .. } => matches!(code, 400 | 403),
            StorageError::S3(_) | StorageError::AlreadyExists { .. } => false,
        }
    }
}
