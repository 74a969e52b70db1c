//! Job handlers, one per job type.
//!
//! Every handler reads the owning entity, does its work, persists assets and
//! advances the entity status. None of them decide retry policy: they return
//! a [`HandlerError`] and the poll loop hands it to the retry controller.

pub mod face;
pub mod model_sheet;
pub mod photoshoot;
pub mod preprocess;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::asset::{Asset, AssetType, Provenance};
use crate::models::entity::{EntityStatus, OwnerKind, OwnerRef, OwningEntity};
use crate::models::job::{Job, JobType};
use crate::models::payload::PayloadError;
use crate::services::asset_writer::{AssetError, AssetRequest};
use crate::services::fetch::redact;
use crate::services::normalizer;
use crate::services::provider::ProviderError;
use crate::services::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Provider returned no usable images")]
    NoOutputs,

    #[error("Owning entity {0} not found")]
    EntityNotFound(OwnerRef),

    #[error("Job has no owning entity")]
    MissingOwner,

    #[error("{job_type} job cannot run against {owner}")]
    OwnerMismatch { job_type: JobType, owner: OwnerRef },

    #[error("Status {status} does not apply to a {kind}")]
    InvalidStatus { status: EntityStatus, kind: OwnerKind },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Asset could not be saved: {0}")]
    Asset(#[from] AssetError),

    /// A handler panicked; treated like any other failure.
    #[error("Handler aborted unexpectedly: {0}")]
    Unexpected(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::EntityNotFound(_)
            | HandlerError::MissingOwner
            | HandlerError::OwnerMismatch { .. }
            | HandlerError::InvalidStatus { .. }
            | HandlerError::InvalidPayload(_) => false,
            HandlerError::Provider(e) => !e.is_permanent(),
            HandlerError::Storage(e) => !e.is_permanent(),
            HandlerError::Asset(e) => !e.is_permanent(),
            HandlerError::NoOutputs | HandlerError::Db(_) | HandlerError::Unexpected(_) => true,
        }
    }
}

/// What a successful handler produced. Serialized into `generation_jobs.result`.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerOutput {
    pub entity_status: EntityStatus,
    pub assets: Vec<AssetSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetSummary {
    pub id: Uuid,
    pub asset_type: AssetType,
    pub bucket: String,
    pub object_path: String,
}

impl From<&Asset> for AssetSummary {
    fn from(asset: &Asset) -> Self {
        Self {
            id: asset.id,
            asset_type: asset.asset_type,
            bucket: asset.bucket.clone(),
            object_path: asset.object_path.clone(),
        }
    }
}

impl HandlerOutput {
    pub fn to_result(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Result of routing a job to its handler.
#[derive(Debug)]
pub enum Dispatch {
    Handled(HandlerOutput),
    /// No handler for this job type; completed as a no-op so it cannot stall
    /// the queue.
    UnknownType,
}

pub async fn dispatch(state: &AppState, job: &Job) -> Result<Dispatch, HandlerError> {
    let Some(kind) = job.kind() else {
        return Ok(Dispatch::UnknownType);
    };
    let owner = job.owner().ok_or(HandlerError::MissingOwner)?;
    if owner.kind != kind.owner_kind() {
        return Err(HandlerError::OwnerMismatch { job_type: kind, owner });
    }

    let output = match kind {
        JobType::Preprocess => preprocess::handle(state, job).await?,
        JobType::GenerateFace => face::handle(state, job).await?,
        JobType::GenerateModelSheet => model_sheet::handle(state, job).await?,
        JobType::PhotoshootBatch => photoshoot::handle(state, job).await?,
    };
    Ok(Dispatch::Handled(output))
}

/// Mark the owning entity failed once its job has failed terminally.
pub async fn on_terminal_failure(
    state: &AppState,
    job: &Job,
    error: &HandlerError,
) -> Result<(), sqlx::Error> {
    let Some(owner) = job.owner() else {
        return Ok(());
    };
    state.entities.set_status(owner, EntityStatus::Failed).await?;
    state
        .entities
        .add_warnings(owner, &[format!("{} job failed: {error}", job.job_type)])
        .await
}

pub(crate) async fn load_entity(state: &AppState, job: &Job) -> Result<OwningEntity, HandlerError> {
    let owner = job.owner().ok_or(HandlerError::MissingOwner)?;
    state
        .entities
        .get_entity(owner)
        .await?
        .ok_or(HandlerError::EntityNotFound(owner))
}

/// Turn a reference locator into a fetchable URL. Absolute URLs pass through;
/// anything else is a path in the uploads bucket.
pub(crate) async fn resolve_locator(state: &AppState, locator: &str) -> Result<String, StorageError> {
    let locator = locator.trim();
    if locator.starts_with("http://") || locator.starts_with("https://") {
        return Ok(locator.to_string());
    }
    state
        .storage
        .create_signed_url(
            &state.settings.uploads_bucket,
            locator.trim_start_matches('/'),
            state.settings.signed_url_ttl,
        )
        .await
}

/// Resolve up to `limit` locators, recording failures as warnings.
pub(crate) async fn resolve_references(
    state: &AppState,
    locators: &[String],
    limit: usize,
    warnings: &mut Vec<String>,
) -> Vec<String> {
    let mut urls = Vec::new();
    for locator in locators.iter().take(limit) {
        match resolve_locator(state, locator).await {
            Ok(url) => urls.push(url),
            Err(e) => warnings.push(format!("Reference {} unavailable: {e}", redact(locator))),
        }
    }
    urls
}

/// Signed URLs for existing assets, used as conditioning images.
pub(crate) async fn signed_asset_urls(
    state: &AppState,
    assets: &[Asset],
    warnings: &mut Vec<String>,
) -> Vec<String> {
    let mut urls = Vec::new();
    for asset in assets {
        match state
            .storage
            .create_signed_url(&asset.bucket, &asset.object_path, state.settings.signed_url_ttl)
            .await
        {
            Ok(url) => urls.push(url),
            Err(e) => warnings.push(format!("Asset {} unavailable as reference: {e}", asset.id)),
        }
    }
    urls
}

/// One provider call, described by a handler.
pub(crate) struct GenerationPlan<'a> {
    pub model: String,
    pub prompt: String,
    pub input: Map<String, Value>,
    pub asset_type: &'a (dyn Fn(usize) -> AssetType + Send + Sync),
    pub status: EntityStatus,
}

/// Shared tail of every generation handler: call the provider once, normalize,
/// persist each item, then append the saved assets and advance the status.
///
/// Partial persistence is a success with warnings; zero saved assets is an
/// error.
pub(crate) async fn generate_and_persist(
    state: &AppState,
    job: &Job,
    entity: &OwningEntity,
    plan: GenerationPlan<'_>,
    mut warnings: Vec<String>,
) -> Result<HandlerOutput, HandlerError> {
    ensure_status(entity.owner, plan.status)?;
    let raw = state
        .provider
        .run(&plan.model, Value::Object(plan.input))
        .await?;
    let items = normalizer::normalize(&raw);
    if items.is_empty() {
        return Err(HandlerError::NoOutputs);
    }

    tracing::info!(
        job_id = %job.id,
        model = %plan.model,
        outputs = items.len(),
        "Provider returned outputs"
    );

    let mut saved = Vec::with_capacity(items.len());
    let mut last_error = None;
    for (index, item) in items.iter().enumerate() {
        let request = AssetRequest {
            owner: entity.owner,
            subject_id: entity.subject_id,
            asset_type: (plan.asset_type)(index),
            index,
            original_filename: None,
            provenance: Provenance {
                provider: Some(state.provider.name().to_string()),
                model: Some(plan.model.clone()),
                prompt: Some(plan.prompt.clone()),
                source: Some(redact(&item.source_locator())),
                job_id: Some(job.id),
                content_type: None,
            },
        };

        match state.writer.persist(item, &request).await {
            Ok(asset) => saved.push(asset),
            Err(e) => {
                tracing::warn!(job_id = %job.id, index = index, error = %e, "Failed to persist output");
                warnings.push(format!(
                    "Output {} of {} could not be saved: {e}",
                    index + 1,
                    items.len()
                ));
                last_error = Some(e);
            }
        }
    }

    if saved.is_empty() {
        return Err(last_error.map_or(HandlerError::NoOutputs, HandlerError::Asset));
    }

    finish(state, entity.owner, &saved, warnings, plan.status).await
}

/// Append assets, record warnings and advance the entity status.
pub(crate) async fn finish(
    state: &AppState,
    owner: OwnerRef,
    assets: &[Asset],
    warnings: Vec<String>,
    status: EntityStatus,
) -> Result<HandlerOutput, HandlerError> {
    ensure_status(owner, status)?;

    let ids: Vec<Uuid> = assets.iter().map(|a| a.id).collect();
    state.entities.append_assets(owner, &ids, status).await?;
    state.entities.add_warnings(owner, &warnings).await?;

    Ok(HandlerOutput {
        entity_status: status,
        assets: assets.iter().map(AssetSummary::from).collect(),
        warnings,
    })
}

pub(crate) fn ensure_status(owner: OwnerRef, status: EntityStatus) -> Result<(), HandlerError> {
    if status.allowed_for(owner.kind) {
        Ok(())
    } else {
        Err(HandlerError::InvalidStatus { status, kind: owner.kind })
    }
}

/// Insert `value` under `key` when present.
pub(crate) fn insert_opt<T: Into<Value>>(input: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        input.insert(key.to_string(), value.into());
    }
}
