//! Persistence ports.
//!
//! Every mutation the engine performs goes through a [`JourneyTx`] obtained
//! from [`JourneyStore::begin`]. A transaction that is dropped without
//! [`JourneyTx::commit`] leaves no trace. Every method takes the caller's
//! tenant and never returns rows from another tenant.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::state::{AttachmentStatus, EventType, NodeState};

pub use memory::MemoryStore;

// ── Rows ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct PlaybookVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub version: String,
    pub checksum: String,
    pub raw_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPlaybookVersion {
    pub tenant_id: Uuid,
    pub version: String,
    pub checksum: String,
    pub raw_json: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub node_id: String,
    pub playbook_version_id: Uuid,
    pub state: NodeState,
    pub locale: Option<String>,
    pub current_rev: i32,
    pub opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNodeInstance {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub node_id: String,
    pub playbook_version_id: Uuid,
    pub state: NodeState,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeEvent {
    pub id: i64,
    pub tenant_id: Uuid,
    pub node_instance_id: Uuid,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNodeEvent {
    pub tenant_id: Uuid,
    pub node_instance_id: Uuid,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub actor_id: Option<Uuid>,
}

/// Denormalized per-node state for fast journey reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JourneyState {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub node_id: String,
    pub state: NodeState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct FormRevision {
    pub node_instance_id: Uuid,
    pub rev: i32,
    pub form_data: serde_json::Value,
    pub edited_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct ProfileSubmission {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub form_data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Slot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub node_instance_id: Uuid,
    pub slot_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub slot_id: Uuid,
    pub document_version_id: Uuid,
    pub is_active: bool,
    pub status: AttachmentStatus,
    pub filename: String,
    pub size_bytes: i64,
    pub attached_by: Uuid,
    pub reviewed_by: Option<Uuid>,
    pub review_note: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub tenant_id: Uuid,
    pub slot_id: Uuid,
    pub document_version_id: Uuid,
    pub filename: String,
    pub size_bytes: i64,
    pub attached_by: Uuid,
}

#[derive(Debug, Clone)]
pub struct AttachmentReview {
    pub status: AttachmentStatus,
    pub reviewed_by: Uuid,
    pub review_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct Document {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
}

/// A stored file. Local versions carry `storage_path`; object-store
/// versions carry `bucket` and `object_key`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct DocumentVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub document_id: Uuid,
    pub storage_path: Option<String>,
    pub bucket: Option<String>,
    pub object_key: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDocumentVersion {
    pub tenant_id: Uuid,
    pub document_id: Uuid,
    pub storage_path: Option<String>,
    pub bucket: Option<String>,
    pub object_key: Option<String>,
    pub mime_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct AdminNotification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub student_id: Uuid,
    pub node_id: String,
    pub node_instance_id: Option<Uuid>,
    pub event_type: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAdminNotification {
    pub tenant_id: Uuid,
    pub student_id: Uuid,
    pub node_id: String,
    pub node_instance_id: Option<Uuid>,
    pub event_type: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct StudentNotification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub recipient_id: Uuid,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub kind: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStudentNotification {
    pub tenant_id: Uuid,
    pub recipient_id: Uuid,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub kind: String,
}

// ── Ports ────────────────────────────────────────────────────

#[async_trait]
pub trait JourneyStore: Send + Sync {
    /// Open a serializable transaction for one logical mutation.
    async fn begin(&self) -> Result<Box<dyn JourneyTx>>;

    /// Open a transaction for reads. Backends may use a weaker isolation
    /// level here.
    async fn begin_read(&self) -> Result<Box<dyn JourneyTx>> {
        self.begin().await
    }
}

#[async_trait]
pub trait JourneyTx: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    // ── Playbooks ────────────────────────────────────────────

    async fn find_playbook_by_checksum(
        &mut self,
        tenant_id: Uuid,
        checksum: &str,
    ) -> Result<Option<PlaybookVersion>>;

    async fn insert_playbook(&mut self, new: NewPlaybookVersion) -> Result<PlaybookVersion>;

    /// Most recently ingested version for the tenant.
    async fn latest_playbook(&mut self, tenant_id: Uuid) -> Result<Option<PlaybookVersion>>;

    // ── Node instances ───────────────────────────────────────

    /// Look up by the unique key, locking the row for the rest of the
    /// transaction where the backend supports it.
    async fn find_instance(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        node_id: &str,
        playbook_version_id: Uuid,
    ) -> Result<Option<NodeInstance>>;

    async fn get_instance(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<NodeInstance>>;

    /// Insert by the unique key. If a row already exists it is returned
    /// unchanged.
    async fn insert_instance(&mut self, new: NewNodeInstance) -> Result<NodeInstance>;

    async fn update_instance_state(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
        state: NodeState,
    ) -> Result<NodeInstance>;

    /// Mark the instance opened (sets `opened_at` if unset).
    async fn mark_instance_opened(&mut self, tenant_id: Uuid, id: Uuid) -> Result<NodeInstance>;

    async fn list_instances(&mut self, tenant_id: Uuid, user_id: Uuid)
        -> Result<Vec<NodeInstance>>;

    // ── Form data ────────────────────────────────────────────

    /// Append a revision, bump `current_rev` and optionally update the locale.
    async fn record_form_revision(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
        form_data: serde_json::Value,
        edited_by: Option<Uuid>,
        locale: Option<String>,
    ) -> Result<FormRevision>;

    async fn latest_form_revision(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Option<FormRevision>>;

    async fn upsert_profile_submission(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        form_data: serde_json::Value,
    ) -> Result<ProfileSubmission>;

    async fn get_profile_submission(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ProfileSubmission>>;

    // ── Events ───────────────────────────────────────────────

    async fn append_event(&mut self, new: NewNodeEvent) -> Result<NodeEvent>;

    /// Events in `created_at, id` order.
    async fn list_events(&mut self, tenant_id: Uuid, instance_id: Uuid)
        -> Result<Vec<NodeEvent>>;

    // ── Journey projection ───────────────────────────────────

    async fn upsert_journey_state(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        node_id: &str,
        state: NodeState,
    ) -> Result<()>;

    async fn list_journey_states(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<JourneyState>>;

    /// All projection rows of the tenant, optionally filtered by state.
    async fn list_tenant_journey_states(
        &mut self,
        tenant_id: Uuid,
        state: Option<NodeState>,
    ) -> Result<Vec<JourneyState>>;

    async fn delete_journey_states(&mut self, tenant_id: Uuid, user_id: Uuid) -> Result<u64>;

    // ── Slots ────────────────────────────────────────────────

    /// Idempotent create by `(instance, slot_key)`.
    async fn ensure_slot(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
        slot_key: &str,
    ) -> Result<Slot>;

    async fn get_slot(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<Slot>>;

    async fn list_slots(&mut self, tenant_id: Uuid, instance_id: Uuid) -> Result<Vec<Slot>>;

    // ── Documents ────────────────────────────────────────────

    async fn find_document(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        kind: &str,
        title: &str,
    ) -> Result<Option<Document>>;

    async fn insert_document(&mut self, new: NewDocument) -> Result<Document>;

    async fn insert_document_version(
        &mut self,
        new: NewDocumentVersion,
    ) -> Result<DocumentVersion>;

    async fn get_document_version(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<DocumentVersion>>;

    // ── Attachments ──────────────────────────────────────────

    /// Flip every active attachment on the slot to inactive.
    async fn deactivate_attachments(&mut self, tenant_id: Uuid, slot_id: Uuid) -> Result<u64>;

    /// Insert an active attachment with status `submitted`.
    async fn insert_attachment(&mut self, new: NewAttachment) -> Result<Attachment>;

    async fn get_attachment(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<Attachment>>;

    /// Newest first.
    async fn list_attachments(&mut self, tenant_id: Uuid, slot_id: Uuid)
        -> Result<Vec<Attachment>>;

    async fn active_attachment(
        &mut self,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<Option<Attachment>>;

    async fn review_attachment(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
        review: AttachmentReview,
    ) -> Result<Attachment>;

    // ── Advisors ─────────────────────────────────────────────

    async fn list_advisors(&mut self, tenant_id: Uuid, student_id: Uuid) -> Result<Vec<Uuid>>;

    async fn list_advisees(&mut self, tenant_id: Uuid, advisor_id: Uuid) -> Result<Vec<Uuid>>;

    async fn is_assigned_advisor(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
        advisor_id: Uuid,
    ) -> Result<bool>;

    async fn assign_advisor(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
        advisor_id: Uuid,
    ) -> Result<()>;

    // ── Notifications ────────────────────────────────────────

    async fn insert_admin_notification(
        &mut self,
        new: NewAdminNotification,
    ) -> Result<AdminNotification>;

    /// Newest first. `students = None` returns every row of the tenant.
    async fn list_admin_notifications(
        &mut self,
        tenant_id: Uuid,
        students: Option<&[Uuid]>,
        unread_only: bool,
    ) -> Result<Vec<AdminNotification>>;

    async fn get_admin_notification(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<AdminNotification>>;

    async fn mark_admin_notification_read(&mut self, tenant_id: Uuid, id: Uuid) -> Result<bool>;

    async fn insert_student_notification(
        &mut self,
        new: NewStudentNotification,
    ) -> Result<StudentNotification>;

    /// Newest first.
    async fn list_student_notifications(
        &mut self,
        tenant_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Vec<StudentNotification>>;
}
