use serde_json::{Map, Value};

use crate::app_state::AppState;
use crate::models::asset::{Asset, AssetType};
use crate::models::entity::{EntityStatus, OwningEntity};
use crate::models::job::Job;
use crate::models::payload::GenerationPayload;
use crate::services::handlers::{
    generate_and_persist, insert_opt, load_entity, resolve_references, signed_asset_urls,
    GenerationPlan, HandlerError, HandlerOutput,
};

const DEFAULT_FACE_ANGLES: u32 = 9;
const DEFAULT_BODY_ANGLES: u32 = 3;

const DEFAULT_SHEET_PROMPT: &str = "Character reference sheet of the same person from multiple \
     angles: front, three-quarter left and right, profile left and right, plus full-body front, \
     side and back views, consistent identity, neutral studio background";

/// Generate a multi-angle model sheet for a subject whose face was approved.
///
/// The first `face_angles` outputs are stored as face sheet images, the rest
/// as body sheet images.
pub async fn handle(state: &AppState, job: &Job) -> Result<HandlerOutput, HandlerError> {
    let payload = GenerationPayload::from_value(&job.payload)?;
    let entity = load_entity(state, job).await?;

    let face_angles = payload.face_angles.unwrap_or(DEFAULT_FACE_ANGLES) as usize;
    let body_angles = payload.body_angles.unwrap_or(DEFAULT_BODY_ANGLES) as usize;
    let prompt = payload
        .prompt()
        .or(entity.prompt.as_deref())
        .unwrap_or(DEFAULT_SHEET_PROMPT)
        .to_string();

    let mut warnings = Vec::new();
    let references = reference_face(state, &entity, &payload, &mut warnings).await?;
    if references.is_empty() {
        warnings.push("No approved face found; generating sheet from prompt only".to_string());
    }

    let mut input = Map::new();
    input.insert("prompt".to_string(), Value::from(prompt.clone()));
    input.insert(
        "num_outputs".to_string(),
        Value::from(face_angles + body_angles),
    );
    input.insert(
        "aspect_ratio".to_string(),
        Value::from(payload.aspect_ratio.clone().unwrap_or_else(|| "1:1".to_string())),
    );
    input.insert("output_format".to_string(), Value::from("png"));
    insert_opt(&mut input, "negative_prompt", payload.negative_prompt.clone());
    insert_opt(&mut input, "seed", payload.seed);
    insert_opt(&mut input, "input_image", references.first().cloned());

    let status = if payload.preview_only_or(false) {
        EntityStatus::AwaitingApproval
    } else {
        EntityStatus::SheetGenerated
    };

    let asset_type = move |index: usize| {
        if index < face_angles {
            AssetType::SheetFace
        } else {
            AssetType::SheetBody
        }
    };

    let plan = GenerationPlan {
        model: payload.model.clone().unwrap_or_else(|| state.settings.sheet_model.clone()),
        prompt,
        input,
        asset_type: &asset_type,
        status,
    };

    generate_and_persist(state, job, &entity, plan, warnings).await
}

/// The most recent generated face on the subject, signed; otherwise the
/// payload references followed by the uploaded face references.
async fn reference_face(
    state: &AppState,
    entity: &OwningEntity,
    payload: &GenerationPayload,
    warnings: &mut Vec<String>,
) -> Result<Vec<String>, HandlerError> {
    let existing = state.assets.get_assets(&entity.asset_ids).await?;
    let latest_face: Vec<Asset> = existing
        .into_iter()
        .filter(|a| a.asset_type == AssetType::GeneratedFace)
        .max_by_key(|a| a.created_at)
        .into_iter()
        .collect();

    let signed = signed_asset_urls(state, &latest_face, warnings).await;
    if !signed.is_empty() {
        return Ok(signed);
    }

    let locators: Vec<String> = payload
        .reference_images
        .iter()
        .chain(entity.face_refs.iter())
        .cloned()
        .collect();
    Ok(resolve_references(state, &locators, 1, warnings).await)
}
