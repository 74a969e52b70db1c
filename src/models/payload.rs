use garde::Validate;
use serde::{Deserialize, Serialize};

/// Generation parameters carried in `generation_jobs.payload`.
///
/// Every field is optional; handlers fill defaults from the owning entity and
/// pipeline settings. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GenerationPayload {
    #[garde(length(max = 4000))]
    pub prompt: Option<String>,

    #[garde(length(max = 2000))]
    pub negative_prompt: Option<String>,

    /// Selects an intermediate entity status instead of the terminal one.
    #[garde(skip)]
    pub preview_only: Option<bool>,

    #[serde(alias = "count", alias = "num_outputs")]
    #[garde(range(min = 1, max = 12))]
    pub shots: Option<u32>,

    #[garde(range(min = 1, max = 12))]
    pub face_angles: Option<u32>,

    #[garde(range(min = 0, max = 12))]
    pub body_angles: Option<u32>,

    /// Overrides the configured model for this job type.
    #[garde(length(min = 1, max = 200))]
    pub model: Option<String>,

    #[garde(length(min = 1, max = 16))]
    pub aspect_ratio: Option<String>,

    #[garde(skip)]
    pub seed: Option<i64>,

    /// Extra conditioning images: URLs or upload bucket paths.
    #[serde(alias = "references")]
    #[garde(length(max = 8))]
    pub reference_images: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Payload is not a valid generation payload: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("Payload failed validation: {0}")]
    Invalid(#[from] garde::Report),
}

impl GenerationPayload {
    /// Parse and validate a raw job payload. `null` is treated as `{}`.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, PayloadError> {
        let payload: GenerationPayload = if raw.is_null() {
            GenerationPayload::default()
        } else {
            serde_json::from_value(raw.clone())?
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn preview_only_or(&self, default: bool) -> bool {
        self.preview_only.unwrap_or(default)
    }

    /// Non-blank prompt, if any.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}
