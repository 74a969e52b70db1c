use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::entity::{OwnerKind, OwnerRef};

/// Role of a persisted image.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AssetType {
    ThumbnailFace,
    ThumbnailBody,
    GeneratedFace,
    SheetFace,
    SheetBody,
    Photo,
}

/// A persisted output image row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub subject_id: Option<Uuid>,
    pub photoshoot_id: Option<Uuid>,
    pub asset_type: AssetType,
    pub bucket: String,
    pub object_path: String,
    pub original_filename: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row to insert once the object bytes are in storage.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub subject_id: Option<Uuid>,
    pub photoshoot_id: Option<Uuid>,
    pub asset_type: AssetType,
    pub bucket: String,
    pub object_path: String,
    pub original_filename: String,
    pub metadata: serde_json::Value,
}

impl NewAsset {
    /// Fill subject/photoshoot columns from the owner. Photoshoot assets also
    /// carry the parent subject so they show up in subject galleries.
    pub fn owner_columns(owner: OwnerRef, subject_id: Uuid) -> (Option<Uuid>, Option<Uuid>) {
        match owner.kind {
            OwnerKind::Subject => (Some(owner.id), None),
            OwnerKind::Photoshoot => (Some(subject_id), Some(owner.id)),
        }
    }
}

/// Provenance stored in `assets.metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}
