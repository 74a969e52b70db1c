use crate::app_state::AppState;
use crate::models::asset::{Asset, AssetType, Provenance};
use crate::models::entity::{EntityStatus, OwningEntity};
use crate::models::job::Job;
use crate::services::asset_writer::{AssetError, AssetRequest};
use crate::services::fetch::redact;
use crate::services::handlers::{finish, load_entity, resolve_locator, HandlerError, HandlerOutput};
use crate::services::thumbnail::{make_thumbnail, THUMBNAIL_CONTENT_TYPE};

/// Thumbnail the uploaded face and body references of a subject.
///
/// No provider call. Unreachable or undecodable references become warnings,
/// and so does a thumbnail that could not be saved. The job fails only when
/// saving failed and nothing was saved at all.
pub async fn handle(state: &AppState, job: &Job) -> Result<HandlerOutput, HandlerError> {
    let entity = load_entity(state, job).await?;
    let limit = state.settings.max_reference_images;

    let mut warnings = Vec::new();
    let mut saved = Vec::new();
    let mut last_error = None;
    let mut index = 0;

    for (refs, asset_type) in [
        (&entity.face_refs, AssetType::ThumbnailFace),
        (&entity.body_refs, AssetType::ThumbnailBody),
    ] {
        if refs.len() > limit {
            warnings.push(format!(
                "Only the first {limit} of {} {asset_type} references were processed",
                refs.len()
            ));
        }
        for locator in refs.iter().take(limit) {
            match thumbnail_reference(state, job, &entity, locator, asset_type, index, &mut warnings)
                .await
            {
                Ok(Some(asset)) => saved.push(asset),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        index = index,
                        error = %e,
                        "Failed to persist thumbnail"
                    );
                    warnings.push(format!(
                        "Thumbnail for {} could not be saved: {e}",
                        redact(locator)
                    ));
                    last_error = Some(e);
                }
            }
            index += 1;
        }
    }

    if saved.is_empty() {
        if let Some(e) = last_error {
            return Err(HandlerError::Asset(e));
        }
    }

    tracing::info!(
        job_id = %job.id,
        owner = %entity.owner,
        thumbnails = saved.len(),
        warnings = warnings.len(),
        "References preprocessed"
    );

    finish(state, entity.owner, &saved, warnings, EntityStatus::AwaitingApproval).await
}

/// Download one reference and store its thumbnail. Returns `Ok(None)` with a
/// warning when the reference itself is the problem, and the writer's error
/// when storing the thumbnail failed.
async fn thumbnail_reference(
    state: &AppState,
    job: &Job,
    entity: &OwningEntity,
    locator: &str,
    asset_type: AssetType,
    index: usize,
    warnings: &mut Vec<String>,
) -> Result<Option<Asset>, AssetError> {
    let source = redact(locator);

    let url = match resolve_locator(state, locator).await {
        Ok(url) => url,
        Err(e) => {
            warnings.push(format!("Reference {source} could not be resolved: {e}"));
            return Ok(None);
        }
    };

    let fetched = match state.fetcher.fetch(&url).await {
        Ok(fetched) => fetched,
        Err(e) => {
            warnings.push(format!("Reference {source} could not be downloaded: {e}"));
            return Ok(None);
        }
    };

    let thumbnail = match make_thumbnail(&fetched.bytes, state.settings.thumbnail_size) {
        Ok(bytes) => bytes,
        Err(e) => {
            warnings.push(format!("Reference {source} is not a usable image: {e}"));
            return Ok(None);
        }
    };

    let request = AssetRequest {
        owner: entity.owner,
        subject_id: entity.subject_id,
        asset_type,
        index,
        original_filename: source.rsplit('/').next().map(str::to_string),
        provenance: Provenance {
            source: Some(source.clone()),
            job_id: Some(job.id),
            ..Provenance::default()
        },
    };

    let asset = state
        .writer
        .persist_bytes(&thumbnail, Some(THUMBNAIL_CONTENT_TYPE), &request)
        .await?;
    Ok(Some(asset))
}
