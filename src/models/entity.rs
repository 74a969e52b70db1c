use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Which table an owning entity lives in.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OwnerKind {
    Subject,
    Photoshoot,
}

/// Reference to the subject or photoshoot a job works on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub kind: OwnerKind,
    pub id: Uuid,
}

impl OwnerRef {
    pub fn new(kind: OwnerKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn subject(id: Uuid) -> Self {
        Self::new(OwnerKind::Subject, id)
    }

    pub fn photoshoot(id: Uuid) -> Self {
        Self::new(OwnerKind::Photoshoot, id)
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Visible status of a subject or photoshoot.
///
/// The UI treats any value outside this set as "do not change view", so the
/// pipeline never writes anything else.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EntityStatus {
    Queued,
    Preprocessing,
    AwaitingApproval,
    Generating,
    SheetGenerated,
    Generated,
    Completed,
    Failed,
}

impl EntityStatus {
    /// Statuses a given entity kind may hold.
    pub fn allowed_for(self, kind: OwnerKind) -> bool {
        use EntityStatus::*;
        match kind {
            OwnerKind::Subject => matches!(
                self,
                Queued
                    | Preprocessing
                    | AwaitingApproval
                    | Generating
                    | SheetGenerated
                    | Completed
                    | Failed
            ),
            OwnerKind::Photoshoot => {
                matches!(self, Queued | Generating | Generated | Completed | Failed)
            }
        }
    }
}

/// Snapshot of an owning entity as read by a job handler.
///
/// `status` stays a raw string: rows may carry values written by the API
/// layer that this worker never produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwningEntity {
    pub owner: OwnerRef,
    /// Parent subject for photoshoots; equals `owner.id` for subjects.
    pub subject_id: Uuid,
    pub status: String,
    pub prompt: Option<String>,
    pub settings: serde_json::Value,
    /// Reference locators: absolute URLs or paths in the uploads bucket.
    pub face_refs: Vec<String>,
    pub body_refs: Vec<String>,
    pub asset_ids: Vec<Uuid>,
    pub warnings: Vec<String>,
}
