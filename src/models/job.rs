use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::entity::{OwnerKind, OwnerRef};

/// Lifecycle state of a generation job row.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Kind of work a job performs. Stored as text in `generation_jobs.job_type`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobType {
    Preprocess,
    GenerateFace,
    GenerateModelSheet,
    PhotoshootBatch,
}

impl JobType {
    /// Kind of entity a job of this type must be owned by.
    pub fn owner_kind(self) -> OwnerKind {
        match self {
            JobType::PhotoshootBatch => OwnerKind::Photoshoot,
            JobType::Preprocess | JobType::GenerateFace | JobType::GenerateModelSheet => {
                OwnerKind::Subject
            }
        }
    }
}

/// A queued unit of generation work.
///
/// `job_type` is kept as the raw stored string so rows written with a type
/// this worker does not know about can still be claimed and skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub subject_id: Option<Uuid>,
    pub photoshoot_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub available_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Parsed job type, `None` when the stored value is not recognised.
    pub fn kind(&self) -> Option<JobType> {
        self.job_type.parse().ok()
    }

    /// The entity whose status this job advances. Photoshoot wins when both
    /// ids are present.
    pub fn owner(&self) -> Option<OwnerRef> {
        match (self.photoshoot_id, self.subject_id) {
            (Some(id), _) => Some(OwnerRef::new(OwnerKind::Photoshoot, id)),
            (None, Some(id)) => Some(OwnerRef::new(OwnerKind::Subject, id)),
            (None, None) => None,
        }
    }

    /// Whether the claim scheduler may hand this job out at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at.map_or(true, |at| at <= now)
    }
}

/// Insert parameters used by [`crate::db::queries::enqueue_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub subject_id: Option<Uuid>,
    pub photoshoot_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn for_subject(job_type: JobType, subject_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.to_string(),
            subject_id: Some(subject_id),
            photoshoot_id: None,
            payload,
        }
    }

    pub fn for_photoshoot(
        subject_id: Uuid,
        photoshoot_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            job_type: JobType::PhotoshootBatch.to_string(),
            subject_id: Some(subject_id),
            photoshoot_id: Some(photoshoot_id),
            payload,
        }
    }
}
