use serde_json::{Map, Value};

use crate::app_state::AppState;
use crate::models::asset::AssetType;
use crate::models::entity::EntityStatus;
use crate::models::job::Job;
use crate::models::payload::GenerationPayload;
use crate::services::handlers::{
    generate_and_persist, insert_opt, load_entity, resolve_references, GenerationPlan,
    HandlerError, HandlerOutput,
};

const DEFAULT_FACE_PROMPT: &str = "Photorealistic head-and-shoulders portrait of a fashion model, \
     facing the camera, neutral expression, soft studio lighting, plain light grey background";

/// Generate a face preview for a subject.
///
/// Defaults to preview mode: the subject moves to `awaiting-approval` so the
/// user can approve the face before a model sheet is generated.
pub async fn handle(state: &AppState, job: &Job) -> Result<HandlerOutput, HandlerError> {
    let payload = GenerationPayload::from_value(&job.payload)?;
    let entity = load_entity(state, job).await?;

    let prompt = payload
        .prompt()
        .or(entity.prompt.as_deref())
        .unwrap_or(DEFAULT_FACE_PROMPT)
        .to_string();

    let mut warnings = Vec::new();
    let locators: Vec<String> = payload
        .reference_images
        .iter()
        .chain(entity.face_refs.iter())
        .cloned()
        .collect();
    let references = resolve_references(
        state,
        &locators,
        state.settings.max_reference_images,
        &mut warnings,
    )
    .await;

    let mut input = Map::new();
    input.insert("prompt".to_string(), Value::from(prompt.clone()));
    input.insert(
        "aspect_ratio".to_string(),
        Value::from(payload.aspect_ratio.clone().unwrap_or_else(|| "1:1".to_string())),
    );
    input.insert("output_format".to_string(), Value::from("png"));
    insert_opt(&mut input, "negative_prompt", payload.negative_prompt.clone());
    insert_opt(&mut input, "seed", payload.seed);
    insert_opt(&mut input, "image_prompt", references.first().cloned());

    let status = if payload.preview_only_or(true) {
        EntityStatus::AwaitingApproval
    } else {
        EntityStatus::Completed
    };

    let plan = GenerationPlan {
        model: payload.model.clone().unwrap_or_else(|| state.settings.face_model.clone()),
        prompt,
        input,
        asset_type: &|_index: usize| AssetType::GeneratedFace,
        status,
    };

    generate_and_persist(state, job, &entity, plan, warnings).await
}
