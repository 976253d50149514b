//! Wire shapes returned by the journey service.
//!
//! These are stable and independent of the storage rows; the web layer
//! serializes them as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{AttachmentStatus, NodeState, ReviewDecision};
use crate::store::Attachment;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionDto {
    pub node_id: String,
    pub state: NodeState,
    pub locale: String,
    pub title: Option<String>,
    /// Latest normalized revision, `{}` before the first save.
    pub form_data: serde_json::Value,
    pub rev: i32,
    pub slots: Vec<SlotDto>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotDto {
    pub slot_key: String,
    pub required: bool,
    pub mime: Vec<String>,
    pub max_size: Option<i64>,
    /// Newest first; only the first may be active.
    pub attachments: Vec<AttachmentDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentDto {
    pub id: Uuid,
    pub filename: String,
    pub size: i64,
    pub status: AttachmentStatus,
    pub is_active: bool,
    pub review_note: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<&Attachment> for AttachmentDto {
    fn from(a: &Attachment) -> Self {
        Self {
            id: a.id,
            filename: a.filename.clone(),
            size: a.size_bytes,
            status: a.status,
            is_active: a.is_active,
            review_note: a.review_note.clone(),
            uploaded_at: a.created_at,
        }
    }
}

/// Body of `PutSubmission`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionRequest {
    pub locale: Option<String>,
    pub state: Option<NodeState>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub state: NodeState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresignRequest {
    pub slot_key: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Object,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresignResponse {
    /// Presigned PUT URL, or the local file path in fallback mode.
    pub url: String,
    pub object_key: String,
    pub storage: StorageKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachRequest {
    pub slot_key: String,
    pub object_key: String,
    pub filename: String,
    pub size_bytes: i64,
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewOutcome {
    pub attachment: AttachmentDto,
    pub student_id: Uuid,
    pub node_id: String,
    /// Node state after the review.
    pub state: NodeState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadLink {
    pub url: String,
    pub storage: StorageKind,
    pub filename: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileDto {
    pub user_id: Uuid,
    pub node_id: String,
    pub state: Option<NodeState>,
    pub form_data: Option<serde_json::Value>,
    pub rp_required: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JourneySnapshot {
    pub user_id: Uuid,
    pub playbook_version: String,
    pub locale: String,
    pub worlds: Vec<WorldSnapshot>,
    pub done: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorldSnapshot {
    pub id: String,
    pub title: Option<String>,
    pub nodes: Vec<NodeSnapshot>,
    pub done: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: NodeState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreboardEntry {
    pub rank: usize,
    pub user_id: Uuid,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scoreboard {
    pub top_5: Vec<ScoreboardEntry>,
    pub average_score: i64,
    pub me: ScoreboardEntry,
    pub total_users: usize,
}
