//! In-memory store.
//!
//! A transaction takes the store-wide lock and works on a private copy of
//! the state; commit swaps the copy in. Transactions are therefore fully
//! serial, and dropping one discards its writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::*;
use crate::error::JourneyError;

#[derive(Debug, Clone)]
struct StoredRevision {
    tenant_id: Uuid,
    revision: FormRevision,
}

#[derive(Debug, Clone)]
struct AdvisorLink {
    tenant_id: Uuid,
    student_id: Uuid,
    advisor_id: Uuid,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    playbooks: Vec<PlaybookVersion>,
    instances: Vec<NodeInstance>,
    events: Vec<NodeEvent>,
    next_event_id: i64,
    journey_states: Vec<JourneyState>,
    revisions: Vec<StoredRevision>,
    profiles: Vec<ProfileSubmission>,
    slots: Vec<Slot>,
    attachments: Vec<Attachment>,
    documents: Vec<Document>,
    versions: Vec<DocumentVersion>,
    advisors: Vec<AdvisorLink>,
    admin_notifications: Vec<AdminNotification>,
    student_notifications: Vec<StudentNotification>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    injected_conflicts: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a serialization conflict, the
    /// way a contended database would. Used to exercise retry paths.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn pending_conflicts(&self) -> usize {
        self.injected_conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JourneyStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn JourneyTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            injected_conflicts: self.injected_conflicts.clone(),
        }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    injected_conflicts: Arc<AtomicUsize>,
}

impl MemoryTx {
    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn instance_mut(&mut self, tenant_id: Uuid, id: Uuid) -> Result<&mut NodeInstance> {
        self.working
            .instances
            .iter_mut()
            .find(|i| i.tenant_id == tenant_id && i.id == id)
            .ok_or_else(|| JourneyError::NotFound(format!("node instance {id}")))
    }
}

#[async_trait]
impl JourneyTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        if self.take_injected_conflict() {
            return Err(JourneyError::Conflict(
                "could not serialize access due to concurrent update".into(),
            ));
        }
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    // ── Playbooks ────────────────────────────────────────────

    async fn find_playbook_by_checksum(
        &mut self,
        tenant_id: Uuid,
        checksum: &str,
    ) -> Result<Option<PlaybookVersion>> {
        Ok(self
            .working
            .playbooks
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.checksum == checksum)
            .cloned())
    }

    async fn insert_playbook(&mut self, new: NewPlaybookVersion) -> Result<PlaybookVersion> {
        if self
            .working
            .playbooks
            .iter()
            .any(|p| p.tenant_id == new.tenant_id && p.checksum == new.checksum)
        {
            return Err(JourneyError::Conflict(format!(
                "playbook checksum {} already exists",
                new.checksum
            )));
        }
        let row = PlaybookVersion {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            version: new.version,
            checksum: new.checksum,
            raw_json: new.raw_json,
            created_at: Utc::now(),
        };
        self.working.playbooks.push(row.clone());
        Ok(row)
    }

    async fn latest_playbook(&mut self, tenant_id: Uuid) -> Result<Option<PlaybookVersion>> {
        Ok(self
            .working
            .playbooks
            .iter()
            .rev()
            .find(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    // ── Node instances ───────────────────────────────────────

    async fn find_instance(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        node_id: &str,
        playbook_version_id: Uuid,
    ) -> Result<Option<NodeInstance>> {
        Ok(self
            .working
            .instances
            .iter()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.user_id == user_id
                    && i.node_id == node_id
                    && i.playbook_version_id == playbook_version_id
            })
            .cloned())
    }

    async fn get_instance(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<NodeInstance>> {
        Ok(self
            .working
            .instances
            .iter()
            .find(|i| i.tenant_id == tenant_id && i.id == id)
            .cloned())
    }

    async fn insert_instance(&mut self, new: NewNodeInstance) -> Result<NodeInstance> {
        if let Some(existing) = self
            .find_instance(
                new.tenant_id,
                new.user_id,
                &new.node_id,
                new.playbook_version_id,
            )
            .await?
        {
            return Ok(existing);
        }
        let now = Utc::now();
        let row = NodeInstance {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            user_id: new.user_id,
            node_id: new.node_id,
            playbook_version_id: new.playbook_version_id,
            opened_at: new.state.is_unlocked().then_some(now),
            state: new.state,
            locale: new.locale,
            current_rev: 0,
            updated_at: now,
        };
        self.working.instances.push(row.clone());
        Ok(row)
    }

    async fn update_instance_state(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
        state: NodeState,
    ) -> Result<NodeInstance> {
        let inst = self.instance_mut(tenant_id, id)?;
        inst.state = state;
        inst.updated_at = Utc::now();
        Ok(inst.clone())
    }

    async fn mark_instance_opened(&mut self, tenant_id: Uuid, id: Uuid) -> Result<NodeInstance> {
        let inst = self.instance_mut(tenant_id, id)?;
        let now = Utc::now();
        inst.opened_at.get_or_insert(now);
        inst.updated_at = now;
        Ok(inst.clone())
    }

    async fn list_instances(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<NodeInstance>> {
        Ok(self
            .working
            .instances
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.user_id == user_id)
            .cloned()
            .collect())
    }

    // ── Form data ────────────────────────────────────────────

    async fn record_form_revision(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
        form_data: serde_json::Value,
        edited_by: Option<Uuid>,
        locale: Option<String>,
    ) -> Result<FormRevision> {
        let inst = self.instance_mut(tenant_id, instance_id)?;
        inst.current_rev += 1;
        inst.updated_at = Utc::now();
        if locale.is_some() {
            inst.locale = locale;
        }
        let revision = FormRevision {
            node_instance_id: instance_id,
            rev: inst.current_rev,
            form_data,
            edited_by,
            created_at: inst.updated_at,
        };
        self.working.revisions.push(StoredRevision {
            tenant_id,
            revision: revision.clone(),
        });
        Ok(revision)
    }

    async fn latest_form_revision(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Option<FormRevision>> {
        Ok(self
            .working
            .revisions
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.revision.node_instance_id == instance_id)
            .max_by_key(|r| r.revision.rev)
            .map(|r| r.revision.clone()))
    }

    async fn upsert_profile_submission(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        form_data: serde_json::Value,
    ) -> Result<ProfileSubmission> {
        let now = Utc::now();
        let profiles = &mut self.working.profiles;
        match profiles
            .iter_mut()
            .find(|p| p.tenant_id == tenant_id && p.user_id == user_id)
        {
            Some(existing) => {
                existing.form_data = form_data;
                existing.updated_at = now;
                Ok(existing.clone())
            }
            None => {
                let row = ProfileSubmission {
                    tenant_id,
                    user_id,
                    form_data,
                    updated_at: now,
                };
                profiles.push(row.clone());
                Ok(row)
            }
        }
    }

    async fn get_profile_submission(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ProfileSubmission>> {
        Ok(self
            .working
            .profiles
            .iter()
            .find(|p| p.tenant_id == tenant_id && p.user_id == user_id)
            .cloned())
    }

    // ── Events ───────────────────────────────────────────────

    async fn append_event(&mut self, new: NewNodeEvent) -> Result<NodeEvent> {
        if !self
            .working
            .instances
            .iter()
            .any(|i| i.tenant_id == new.tenant_id && i.id == new.node_instance_id)
        {
            return Err(JourneyError::NotFound(format!(
                "node instance {}",
                new.node_instance_id
            )));
        }
        self.working.next_event_id += 1;
        let event = NodeEvent {
            id: self.working.next_event_id,
            tenant_id: new.tenant_id,
            node_instance_id: new.node_instance_id,
            event_type: new.event_type,
            payload: new.payload,
            actor_id: new.actor_id,
            created_at: Utc::now(),
        };
        self.working.events.push(event.clone());
        Ok(event)
    }

    async fn list_events(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Vec<NodeEvent>> {
        let mut events: Vec<NodeEvent> = self
            .working
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.node_instance_id == instance_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    // ── Journey projection ───────────────────────────────────

    async fn upsert_journey_state(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        node_id: &str,
        state: NodeState,
    ) -> Result<()> {
        let now = Utc::now();
        let rows = &mut self.working.journey_states;
        match rows
            .iter_mut()
            .find(|r| r.tenant_id == tenant_id && r.user_id == user_id && r.node_id == node_id)
        {
            Some(row) => {
                row.state = state;
                row.updated_at = now;
            }
            None => rows.push(JourneyState {
                tenant_id,
                user_id,
                node_id: node_id.to_string(),
                state,
                updated_at: now,
            }),
        }
        Ok(())
    }

    async fn list_journey_states(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<JourneyState>> {
        Ok(self
            .working
            .journey_states
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_tenant_journey_states(
        &mut self,
        tenant_id: Uuid,
        state: Option<NodeState>,
    ) -> Result<Vec<JourneyState>> {
        Ok(self
            .working
            .journey_states
            .iter()
            .filter(|r| r.tenant_id == tenant_id && state.map_or(true, |s| r.state == s))
            .cloned()
            .collect())
    }

    async fn delete_journey_states(&mut self, tenant_id: Uuid, user_id: Uuid) -> Result<u64> {
        let before = self.working.journey_states.len();
        self.working
            .journey_states
            .retain(|r| !(r.tenant_id == tenant_id && r.user_id == user_id));
        Ok((before - self.working.journey_states.len()) as u64)
    }

    // ── Slots ────────────────────────────────────────────────

    async fn ensure_slot(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
        slot_key: &str,
    ) -> Result<Slot> {
        if let Some(slot) = self.working.slots.iter().find(|s| {
            s.tenant_id == tenant_id && s.node_instance_id == instance_id && s.slot_key == slot_key
        }) {
            return Ok(slot.clone());
        }
        if self.get_instance(tenant_id, instance_id).await?.is_none() {
            return Err(JourneyError::NotFound(format!("node instance {instance_id}")));
        }
        let slot = Slot {
            id: Uuid::new_v4(),
            tenant_id,
            node_instance_id: instance_id,
            slot_key: slot_key.to_string(),
            created_at: Utc::now(),
        };
        self.working.slots.push(slot.clone());
        Ok(slot)
    }

    async fn get_slot(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<Slot>> {
        Ok(self
            .working
            .slots
            .iter()
            .find(|s| s.tenant_id == tenant_id && s.id == id)
            .cloned())
    }

    async fn list_slots(&mut self, tenant_id: Uuid, instance_id: Uuid) -> Result<Vec<Slot>> {
        Ok(self
            .working
            .slots
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.node_instance_id == instance_id)
            .cloned()
            .collect())
    }

    // ── Documents ────────────────────────────────────────────

    async fn find_document(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        kind: &str,
        title: &str,
    ) -> Result<Option<Document>> {
        Ok(self
            .working
            .documents
            .iter()
            .find(|d| {
                d.tenant_id == tenant_id && d.user_id == user_id && d.kind == kind && d.title == title
            })
            .cloned())
    }

    async fn insert_document(&mut self, new: NewDocument) -> Result<Document> {
        let doc = Document {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            user_id: new.user_id,
            kind: new.kind,
            title: new.title,
            created_at: Utc::now(),
        };
        self.working.documents.push(doc.clone());
        Ok(doc)
    }

    async fn insert_document_version(
        &mut self,
        new: NewDocumentVersion,
    ) -> Result<DocumentVersion> {
        if !self
            .working
            .documents
            .iter()
            .any(|d| d.tenant_id == new.tenant_id && d.id == new.document_id)
        {
            return Err(JourneyError::NotFound(format!("document {}", new.document_id)));
        }
        let version = DocumentVersion {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            document_id: new.document_id,
            storage_path: new.storage_path,
            bucket: new.bucket,
            object_key: new.object_key,
            mime_type: new.mime_type,
            size_bytes: new.size_bytes,
            uploaded_by: new.uploaded_by,
            created_at: Utc::now(),
        };
        self.working.versions.push(version.clone());
        Ok(version)
    }

    async fn get_document_version(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<DocumentVersion>> {
        Ok(self
            .working
            .versions
            .iter()
            .find(|v| v.tenant_id == tenant_id && v.id == id)
            .cloned())
    }

    // ── Attachments ──────────────────────────────────────────

    async fn deactivate_attachments(&mut self, tenant_id: Uuid, slot_id: Uuid) -> Result<u64> {
        let mut flipped = 0;
        for a in self
            .working
            .attachments
            .iter_mut()
            .filter(|a| a.tenant_id == tenant_id && a.slot_id == slot_id && a.is_active)
        {
            a.is_active = false;
            flipped += 1;
        }
        Ok(flipped)
    }

    async fn insert_attachment(&mut self, new: NewAttachment) -> Result<Attachment> {
        if self.get_slot(new.tenant_id, new.slot_id).await?.is_none() {
            return Err(JourneyError::NotFound(format!("slot {}", new.slot_id)));
        }
        if self
            .working
            .attachments
            .iter()
            .any(|a| a.tenant_id == new.tenant_id && a.slot_id == new.slot_id && a.is_active)
        {
            return Err(JourneyError::Conflict(format!(
                "slot {} already has an active attachment",
                new.slot_id
            )));
        }
        let row = Attachment {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            slot_id: new.slot_id,
            document_version_id: new.document_version_id,
            is_active: true,
            status: AttachmentStatus::Submitted,
            filename: new.filename,
            size_bytes: new.size_bytes,
            attached_by: new.attached_by,
            reviewed_by: None,
            review_note: None,
            reviewed_at: None,
            created_at: Utc::now(),
        };
        self.working.attachments.push(row.clone());
        Ok(row)
    }

    async fn get_attachment(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<Attachment>> {
        Ok(self
            .working
            .attachments
            .iter()
            .find(|a| a.tenant_id == tenant_id && a.id == id)
            .cloned())
    }

    async fn list_attachments(
        &mut self,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<Vec<Attachment>> {
        // Insertion order is creation order; newest first.
        Ok(self
            .working
            .attachments
            .iter()
            .rev()
            .filter(|a| a.tenant_id == tenant_id && a.slot_id == slot_id)
            .cloned()
            .collect())
    }

    async fn active_attachment(
        &mut self,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<Option<Attachment>> {
        Ok(self
            .working
            .attachments
            .iter()
            .find(|a| a.tenant_id == tenant_id && a.slot_id == slot_id && a.is_active)
            .cloned())
    }

    async fn review_attachment(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
        review: AttachmentReview,
    ) -> Result<Attachment> {
        let row = self
            .working
            .attachments
            .iter_mut()
            .find(|a| a.tenant_id == tenant_id && a.id == id)
            .ok_or_else(|| JourneyError::NotFound(format!("attachment {id}")))?;
        row.status = review.status;
        row.reviewed_by = Some(review.reviewed_by);
        row.review_note = review.review_note;
        row.reviewed_at = Some(Utc::now());
        Ok(row.clone())
    }

    // ── Advisors ─────────────────────────────────────────────

    async fn list_advisors(&mut self, tenant_id: Uuid, student_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .working
            .advisors
            .iter()
            .filter(|l| l.tenant_id == tenant_id && l.student_id == student_id)
            .map(|l| l.advisor_id)
            .collect())
    }

    async fn list_advisees(&mut self, tenant_id: Uuid, advisor_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .working
            .advisors
            .iter()
            .filter(|l| l.tenant_id == tenant_id && l.advisor_id == advisor_id)
            .map(|l| l.student_id)
            .collect())
    }

    async fn is_assigned_advisor(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
        advisor_id: Uuid,
    ) -> Result<bool> {
        Ok(self.working.advisors.iter().any(|l| {
            l.tenant_id == tenant_id && l.student_id == student_id && l.advisor_id == advisor_id
        }))
    }

    async fn assign_advisor(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
        advisor_id: Uuid,
    ) -> Result<()> {
        if !self
            .is_assigned_advisor(tenant_id, student_id, advisor_id)
            .await?
        {
            self.working.advisors.push(AdvisorLink {
                tenant_id,
                student_id,
                advisor_id,
            });
        }
        Ok(())
    }

    // ── Notifications ────────────────────────────────────────

    async fn insert_admin_notification(
        &mut self,
        new: NewAdminNotification,
    ) -> Result<AdminNotification> {
        let row = AdminNotification {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            student_id: new.student_id,
            node_id: new.node_id,
            node_instance_id: new.node_instance_id,
            event_type: new.event_type,
            message: new.message,
            metadata: new.metadata,
            is_read: false,
            created_at: Utc::now(),
        };
        self.working.admin_notifications.push(row.clone());
        Ok(row)
    }

    async fn list_admin_notifications(
        &mut self,
        tenant_id: Uuid,
        students: Option<&[Uuid]>,
        unread_only: bool,
    ) -> Result<Vec<AdminNotification>> {
        Ok(self
            .working
            .admin_notifications
            .iter()
            .rev()
            .filter(|n| n.tenant_id == tenant_id)
            .filter(|n| students.map_or(true, |s| s.contains(&n.student_id)))
            .filter(|n| !unread_only || !n.is_read)
            .cloned()
            .collect())
    }

    async fn get_admin_notification(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<AdminNotification>> {
        Ok(self
            .working
            .admin_notifications
            .iter()
            .find(|n| n.tenant_id == tenant_id && n.id == id)
            .cloned())
    }

    async fn mark_admin_notification_read(&mut self, tenant_id: Uuid, id: Uuid) -> Result<bool> {
        match self
            .working
            .admin_notifications
            .iter_mut()
            .find(|n| n.tenant_id == tenant_id && n.id == id)
        {
            Some(n) => {
                n.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_student_notification(
        &mut self,
        new: NewStudentNotification,
    ) -> Result<StudentNotification> {
        let row = StudentNotification {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            recipient_id: new.recipient_id,
            title: new.title,
            message: new.message,
            link: new.link,
            kind: new.kind,
            is_read: false,
            created_at: Utc::now(),
        };
        self.working.student_notifications.push(row.clone());
        Ok(row)
    }

    async fn list_student_notifications(
        &mut self,
        tenant_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Vec<StudentNotification>> {
        Ok(self
            .working
            .student_notifications
            .iter()
            .rev()
            .filter(|n| n.tenant_id == tenant_id && n.recipient_id == recipient_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_instance(tenant: Uuid, user: Uuid, version: Uuid) -> NewNodeInstance {
        NewNodeInstance {
            tenant_id: tenant,
            user_id: user,
            node_id: "n1".into(),
            playbook_version_id: version,
            state: NodeState::Active,
            locale: None,
        }
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let (t, u, v) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_instance(new_instance(t, u, v)).await.unwrap();
        }
        let mut tx = store.begin_read().await.unwrap();
        assert!(tx.list_instances(t, u).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_publishes_writes() {
        let store = MemoryStore::new();
        let (t, u, v) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        tx.insert_instance(new_instance(t, u, v)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_read().await.unwrap();
        assert_eq!(tx.list_instances(t, u).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_instance_is_idempotent_on_unique_key() {
        let store = MemoryStore::new();
        let (t, u, v) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert_instance(new_instance(t, u, v)).await.unwrap();
        let b = tx.insert_instance(new_instance(t, u, v)).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(tx.list_instances(t, u).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_conflict_fails_commit_once() {
        let store = MemoryStore::new();
        store.inject_conflicts(1);
        let tx = store.begin().await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.pending_conflicts(), 0);
        let tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn reads_are_tenant_scoped() {
        let store = MemoryStore::new();
        let (ta, tb, u, v) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        let inst = tx.insert_instance(new_instance(ta, u, v)).await.unwrap();
        tx.upsert_journey_state(ta, u, "n1", NodeState::Active)
            .await
            .unwrap();

        assert!(tx.get_instance(tb, inst.id).await.unwrap().is_none());
        assert!(tx.list_journey_states(tb, u).await.unwrap().is_empty());
        let err = tx
            .append_event(NewNodeEvent {
                tenant_id: tb,
                node_instance_id: inst.id,
                event_type: EventType::Opened,
                payload: json!({}),
                actor_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JourneyError::NotFound(_)));
    }

    #[tokio::test]
    async fn only_one_active_attachment_per_slot() {
        let store = MemoryStore::new();
        let (t, u, v) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        let inst = tx.insert_instance(new_instance(t, u, v)).await.unwrap();
        let slot = tx.ensure_slot(t, inst.id, "cv").await.unwrap();
        let again = tx.ensure_slot(t, inst.id, "cv").await.unwrap();
        assert_eq!(slot.id, again.id);

        let attach = |version| NewAttachment {
            tenant_id: t,
            slot_id: slot.id,
            document_version_id: version,
            filename: "cv.pdf".into(),
            size_bytes: 10,
            attached_by: u,
        };
        tx.insert_attachment(attach(Uuid::new_v4())).await.unwrap();
        let err = tx.insert_attachment(attach(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, JourneyError::Conflict(_)));

        assert_eq!(tx.deactivate_attachments(t, slot.id).await.unwrap(), 1);
        let second = tx.insert_attachment(attach(Uuid::new_v4())).await.unwrap();
        let listed = tx.list_attachments(t, slot.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed.iter().filter(|a| a.is_active).count(), 1);
    }

    #[tokio::test]
    async fn form_revisions_increment() {
        let store = MemoryStore::new();
        let (t, u, v) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        let inst = tx.insert_instance(new_instance(t, u, v)).await.unwrap();
        tx.record_form_revision(t, inst.id, json!({"a": 1}), Some(u), None)
            .await
            .unwrap();
        let r2 = tx
            .record_form_revision(t, inst.id, json!({"a": 2}), Some(u), Some("en".into()))
            .await
            .unwrap();
        assert_eq!(r2.rev, 2);
        let latest = tx.latest_form_revision(t, inst.id).await.unwrap().unwrap();
        assert_eq!(latest.form_data, json!({"a": 2}));
        let inst = tx.get_instance(t, inst.id).await.unwrap().unwrap();
        assert_eq!(inst.current_rev, 2);
        assert_eq!(inst.locale.as_deref(), Some("en"));
    }
}
