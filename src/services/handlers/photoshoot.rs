use serde_json::{Map, Value};

use crate::app_state::AppState;
use crate::models::asset::{Asset, AssetType};
use crate::models::entity::{EntityStatus, OwnerRef, OwningEntity};
use crate::models::job::Job;
use crate::models::payload::GenerationPayload;
use crate::services::handlers::{
    generate_and_persist, insert_opt, load_entity, resolve_references, signed_asset_urls,
    GenerationPlan, HandlerError, HandlerOutput,
};

const DEFAULT_SHOTS: u32 = 4;
const MAX_SHOTS: u32 = 12;

const DEFAULT_PHOTOSHOOT_PROMPT: &str = "Editorial fashion photoshoot of the same model, \
     natural poses, professional lighting, high detail";

/// Generate a batch of photoshoot images for a photoshoot owned by a subject.
pub async fn handle(state: &AppState, job: &Job) -> Result<HandlerOutput, HandlerError> {
    let payload = GenerationPayload::from_value(&job.payload)?;
    let entity = load_entity(state, job).await?;

    let shots = payload
        .shots
        .or_else(|| shots_from_settings(&entity.settings))
        .unwrap_or(DEFAULT_SHOTS);
    let prompt = payload
        .prompt()
        .or(entity.prompt.as_deref())
        .unwrap_or(DEFAULT_PHOTOSHOOT_PROMPT)
        .to_string();

    let mut warnings = Vec::new();
    let mut references = subject_references(state, &entity, &mut warnings).await?;
    let remaining = state
        .settings
        .max_reference_images
        .saturating_sub(references.len());
    references.extend(resolve_references(state, &payload.reference_images, remaining, &mut warnings).await);

    let mut input = Map::new();
    input.insert("prompt".to_string(), Value::from(prompt.clone()));
    input.insert("num_outputs".to_string(), Value::from(shots));
    input.insert(
        "aspect_ratio".to_string(),
        Value::from(payload.aspect_ratio.clone().unwrap_or_else(|| "3:4".to_string())),
    );
    input.insert("output_format".to_string(), Value::from("png"));
    insert_opt(&mut input, "negative_prompt", payload.negative_prompt.clone());
    insert_opt(&mut input, "seed", payload.seed);
    insert_opt(&mut input, "input_image", references.first().cloned());
    if references.len() > 1 {
        input.insert("reference_images".to_string(), Value::from(references));
    }

    let status = if payload.preview_only_or(false) {
        EntityStatus::Generated
    } else {
        EntityStatus::Completed
    };

    let plan = GenerationPlan {
        model: payload
            .model
            .clone()
            .unwrap_or_else(|| state.settings.photoshoot_model.clone()),
        prompt,
        input,
        asset_type: &|_index: usize| AssetType::Photo,
        status,
    };

    generate_and_persist(state, job, &entity, plan, warnings).await
}

/// Shot count stored on the photoshoot row, clamped to the accepted range.
fn shots_from_settings(settings: &Value) -> Option<u32> {
    let raw = settings
        .get("shots")
        .or_else(|| settings.get("count"))?
        .as_u64()?;
    Some(raw.clamp(1, MAX_SHOTS as u64) as u32)
}

/// Signed URLs of the parent subject's sheet faces, or its generated face when
/// no sheet exists yet.
async fn subject_references(
    state: &AppState,
    entity: &OwningEntity,
    warnings: &mut Vec<String>,
) -> Result<Vec<String>, HandlerError> {
    let Some(subject) = state
        .entities
        .get_entity(OwnerRef::subject(entity.subject_id))
        .await?
    else {
        warnings.push(format!("Subject {} not found; no identity references", entity.subject_id));
        return Ok(Vec::new());
    };

    let assets = state.assets.get_assets(&subject.asset_ids).await?;
    let pick = |wanted: AssetType| -> Vec<Asset> {
        assets
            .iter()
            .filter(|a| a.asset_type == wanted)
            .take(state.settings.max_reference_images)
            .cloned()
            .collect()
    };

    let mut chosen = pick(AssetType::SheetFace);
    if chosen.is_empty() {
        chosen = pick(AssetType::GeneratedFace);
    }
    Ok(signed_asset_urls(state, &chosen, warnings).await)
}
