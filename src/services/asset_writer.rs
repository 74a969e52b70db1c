use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::store::AssetStore;
use crate::models::asset::{Asset, AssetType, NewAsset, Provenance};
use crate::models::entity::OwnerRef;
use crate::services::fetch::{FetchError, ImageFetcher};
use crate::services::normalizer::NormalizedItem;
use crate::services::storage::{ObjectStorage, StorageError};

/// Where and how one asset is recorded.
#[derive(Debug, Clone)]
pub struct AssetRequest {
    pub owner: OwnerRef,
    pub subject_id: Uuid,
    pub asset_type: AssetType,
    /// Distinguishes assets written for the same owner in the same millisecond.
    pub index: usize,
    pub original_filename: Option<String>,
    pub provenance: Provenance,
}

/// Writes image bytes to object storage, then records the asset row.
///
/// Ordering is storage first, row second. If the row insert fails the object
/// is deleted again (best effort) and the database error is returned.
pub struct AssetWriter {
    storage: Arc<dyn ObjectStorage>,
    assets: Arc<dyn AssetStore>,
    fetcher: Arc<dyn ImageFetcher>,
    bucket: String,
}

impl AssetWriter {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        assets: Arc<dyn AssetStore>,
        fetcher: Arc<dyn ImageFetcher>,
        bucket: String,
    ) -> Self {
        Self {
            storage,
            assets,
            fetcher,
            bucket,
        }
    }

    /// Resolve a normalized provider item to bytes and persist it.
    pub async fn persist(
        &self,
        item: &NormalizedItem,
        request: &AssetRequest,
    ) -> Result<Asset, AssetError> {
        let (bytes, declared_type) = self.resolve(item).await?;

        let mut request = request.clone();
        if request.original_filename.is_none() {
            if let NormalizedItem::RemoteUrl { url } = item {
                request.original_filename = filename_from_url(url);
            }
        }
        self.persist_bytes(&bytes, declared_type.as_deref(), &request)
            .await
    }

    /// Download or decode an item into raw bytes plus any declared content type.
    pub async fn resolve(
        &self,
        item: &NormalizedItem,
    ) -> Result<(Vec<u8>, Option<String>), AssetError> {
        match item {
            NormalizedItem::RemoteUrl { url } => {
                let fetched = self.fetcher.fetch(url).await?;
                Ok((fetched.bytes, fetched.content_type))
            }
            NormalizedItem::DataUri { mime, base64 } => Ok((decode_base64(base64)?, Some(mime.clone()))),
            NormalizedItem::Base64 { data } => Ok((decode_base64(data)?, None)),
        }
    }

    /// Persist bytes that are already in memory.
    pub async fn persist_bytes(
        &self,
        bytes: &[u8],
        declared_type: Option<&str>,
        request: &AssetRequest,
    ) -> Result<Asset, AssetError> {
        let format = image::guess_format(bytes).map_err(|_| AssetError::NotAnImage {
            declared: declared_type.map(str::to_string),
        })?;
        let content_type = format.to_mime_type();
        let extension = format.extensions_str().first().copied().unwrap_or("img");

        let path = object_path(
            request.owner,
            request.asset_type,
            request.provenance.job_id,
            request.index,
            Utc::now(),
            extension,
        );
        self.storage
            .upload(&self.bucket, &path, bytes, content_type)
            .await?;

        let mut provenance = request.provenance.clone();
        provenance.content_type = Some(content_type.to_string());
        let (subject_id, photoshoot_id) = NewAsset::owner_columns(request.owner, request.subject_id);
        let original_filename = request
            .original_filename
            .clone()
            .unwrap_or_else(|| path.rsplit('/').next().unwrap_or(&path).to_string());

        let new_asset = NewAsset {
            subject_id,
            photoshoot_id,
            asset_type: request.asset_type,
            bucket: self.bucket.clone(),
            object_path: path.clone(),
            original_filename,
            metadata: serde_json::to_value(&provenance).unwrap_or_default(),
        };

        match self.assets.insert_asset(&new_asset).await {
            Ok(asset) => {
                metrics::counter!("assets_persisted_total").increment(1);
                tracing::debug!(
                    asset_id = %asset.id,
                    owner = %request.owner,
                    path = %path,
                    bytes = bytes.len(),
                    "Asset persisted"
                );
                Ok(asset)
            }
            Err(db_error) => {
                if let Err(cleanup_error) = self.storage.delete(&self.bucket, &path).await {
                    tracing::error!(
                        bucket = %self.bucket,
                        path = %path,
                        error = %cleanup_error,
                        "Failed to remove object after asset insert failed"
                    );
                }
                Err(AssetError::Db(db_error))
            }
        }
    }
}

/// `{owner kind}/{owner id}/{asset type}/{unix millis}-{job}-{index}.{ext}`
///
/// `job` is the first eight hex digits of the job id (`00000000` when there
/// is none), so two jobs for one owner finishing in the same millisecond
/// still write distinct paths.
pub fn object_path(
    owner: OwnerRef,
    asset_type: AssetType,
    job_id: Option<Uuid>,
    index: usize,
    at: DateTime<Utc>,
    extension: &str,
) -> String {
    let job = job_id.unwrap_or_else(Uuid::nil).simple().to_string();
    format!(
        "{}/{}/{}/{}-{}-{:03}.{}",
        owner.kind,
        owner.id,
        asset_type,
        at.timestamp_millis(),
        &job[..8],
        index,
        extension
    )
}

fn decode_base64(data: &str) -> Result<Vec<u8>, AssetError> {
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(&compact)
        .or_else(|_| STANDARD_NO_PAD.decode(&compact))
        .or_else(|_| URL_SAFE.decode(&compact))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&compact))?;
    if bytes.is_empty() {
        return Err(AssetError::NotAnImage { declared: None });
    }
    Ok(bytes)
}

fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next()?;
    let name = without_query.rsplit('/').next()?;
    (!name.is_empty() && name.contains('.')).then(|| name.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Failed to download image: {0}")]
    Fetch(#[from] FetchError),

    #[error("Failed to decode base64 image: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Bytes are not a recognised image (declared {declared:?})")]
    NotAnImage { declared: Option<String> },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl AssetError {
    pub fn is_permanent(&self) -> bool {
        match self {
            AssetError::Fetch(e) => e.is_permanent(),
            AssetError::Storage(e) => e.is_permanent(),
            AssetError::Decode(_) | AssetError::NotAnImage { .. } | AssetError::Db(_) => false,
        }
    }
}
