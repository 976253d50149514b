//! Journey service: the callable surface collaborators use.
//!
//! Every mutating operation runs in exactly one store transaction. The
//! playbook snapshot is taken before the transaction opens and held for the
//! whole call. Presigning happens outside any transaction, and the outbound
//! webhook only after commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::activation;
use crate::authz;
use crate::cancel::Cancellation;
use crate::config::EngineConfig;
use crate::dto::{
    AttachRequest, AttachmentDto, DownloadLink, JourneySnapshot, NodeSnapshot, PresignRequest,
    PresignResponse, ProfileDto, ReviewOutcome, ReviewRequest, Scoreboard, ScoreboardEntry,
    SlotDto, StorageKind, SubmissionDto, SubmissionRequest, WorldSnapshot,
};
use crate::error::{JourneyError, Result};
use crate::instances;
use crate::notifications::{NotificationSink, Outbound};
use crate::object_store::{self, LocalUploads, ObjectStore, S3ObjectStore, Unconfigured};
use crate::playbook::{Ingested, Node, Playbook, PlaybookCatalog, UploadRequirement};
use crate::principal::{Principal, Role};
use crate::state::{EventType, NodeState};
use crate::store::{
    AdminNotification, AttachmentReview, JourneyState, JourneyStore, JourneyTx, NewAttachment,
    NewDocument, NewDocumentVersion, NodeInstance, StudentNotification,
};
use crate::transitions::TransitionRegistry;
use crate::validators::ValidatorRegistry;

/// Points per completed node on the scoreboard.
pub const POINTS_PER_NODE: i64 = 100;

const SLOT_DOCUMENT_KIND: &str = "node_slot";
const SCOREBOARD_TOP: usize = 5;

pub struct JourneyService {
    store: Arc<dyn JourneyStore>,
    catalog: Arc<PlaybookCatalog>,
    registry: TransitionRegistry,
    validators: ValidatorRegistry,
    objects: Arc<dyn ObjectStore>,
    local: LocalUploads,
    notifier: NotificationSink,
    max_retries: u32,
    max_upload_bytes: i64,
    profile_node: String,
    unscored_worlds: HashSet<String>,
}

impl JourneyService {
    pub fn new(store: Arc<dyn JourneyStore>, config: &EngineConfig) -> Self {
        let objects: Arc<dyn ObjectStore> = match &config.object_store {
            Some(cfg) => Arc::new(S3ObjectStore::new(cfg.clone())),
            None => Arc::new(Unconfigured),
        };
        let catalog = PlaybookCatalog::new(store.clone()).with_default_locale(&config.default_locale);
        Self {
            store,
            catalog: Arc::new(catalog),
            registry: TransitionRegistry::standard(),
            validators: ValidatorRegistry::with_defaults(
                &config.profile_node,
                &config.publications_node,
            ),
            objects,
            local: LocalUploads::new(&config.upload_root),
            notifier: NotificationSink::new(
                config.notify_student_on_review,
                config.notify_webhook_url.clone(),
            ),
            max_retries: config.max_retries,
            max_upload_bytes: config.max_upload_bytes,
            profile_node: config.profile_node.clone(),
            unscored_worlds: config.unscored_worlds.iter().cloned().collect(),
        }
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_registry(mut self, registry: TransitionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn catalog(&self) -> &Arc<PlaybookCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &TransitionRegistry {
        &self.registry
    }

    // ── Retry / cancellation ─────────────────────────────────

    /// Run one transactional attempt at a time, retrying serialization
    /// conflicts up to `max_retries` extra times. Each attempt is raced
    /// against `cancel`; a cancelled attempt drops its transaction.
    async fn retrying<T, F, Fut>(&self, op: &'static str, cancel: &Cancellation, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match cancel.run(attempt()).await {
                Err(err) if err.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    tracing::warn!(op, retries, error = %err, "transaction conflict, retrying");
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(op, retries, error = %err, "transaction conflict, giving up");
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    async fn playbook(&self, tenant_id: Uuid, cancel: &Cancellation) -> Result<Arc<Playbook>> {
        cancel.run(self.catalog.load_current(tenant_id)).await
    }

    // ── Playbooks ────────────────────────────────────────────

    #[instrument(skip(self, raw, cancel), fields(tenant_id = %actor.tenant_id))]
    pub async fn ingest_playbook(
        &self,
        actor: &Principal,
        raw: &[u8],
        cancel: &Cancellation,
    ) -> Result<Ingested> {
        actor.require_admin()?;
        cancel.run(self.catalog.ingest(actor.tenant_id, raw)).await
    }

    pub async fn current_playbook(
        &self,
        actor: &Principal,
        cancel: &Cancellation,
    ) -> Result<Arc<Playbook>> {
        self.playbook(actor.tenant_id, cancel).await
    }

    // ── Submissions ──────────────────────────────────────────

    /// Submission view of `user_id`'s node, creating the instance on first
    /// access.
    #[instrument(skip(self, cancel), fields(tenant_id = %actor.tenant_id))]
    pub async fn get_submission(
        &self,
        actor: &Principal,
        user_id: Uuid,
        node_id: &str,
        locale: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<SubmissionDto> {
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let pb = pb.as_ref();
        self.retrying("get_submission", cancel, || async move {
            let mut tx = self.store.begin().await?;
            authz::authorize_subject(tx.as_mut(), actor, user_id).await?;
            let inst = instances::ensure_instance(tx.as_mut(), pb, user_id, node_id, locale).await?;
            let dto = build_submission(tx.as_mut(), pb, &inst, locale).await?;
            tx.commit().await?;
            Ok(dto)
        })
        .await
    }

    /// Save form data and/or move the node, as one atomic change.
    ///
    /// Form data is validated before any transaction opens; an invalid
    /// payload leaves the node untouched.
    #[instrument(skip(self, req, cancel), fields(tenant_id = %actor.tenant_id, to = ?req.state))]
    pub async fn put_submission(
        &self,
        actor: &Principal,
        user_id: Uuid,
        node_id: &str,
        req: &SubmissionRequest,
        cancel: &Cancellation,
    ) -> Result<SubmissionDto> {
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let pb = pb.as_ref();
        let node = pb.require_node(node_id)?;

        let form = match &req.data {
            Some(data) => {
                authz::authorize_author(actor, user_id)?;
                let raw = serde_json::to_vec(data)
                    .map_err(|e| JourneyError::InvalidInput(format!("malformed JSON: {e}")))?;
                Some(self.validators.validate(node, &raw)?)
            }
            None => None,
        };
        let form = form.as_ref();
        let locale = req.locale.as_deref();

        let (dto, outbox) = self
            .retrying("put_submission", cancel, || async move {
                self.put_once(actor, pb, user_id, node_id, locale, req.state, form)
                    .await
            })
            .await?;
        self.notifier.deliver(outbox).await;
        Ok(dto)
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_once(
        &self,
        actor: &Principal,
        pb: &Playbook,
        user_id: Uuid,
        node_id: &str,
        locale: Option<&str>,
        to_state: Option<NodeState>,
        form: Option<&(serde_json::Value, serde_json::Value)>,
    ) -> Result<(SubmissionDto, Vec<Outbound>)> {
        let tenant_id = actor.tenant_id;
        let mut outbox = Vec::new();
        let mut tx = self.store.begin().await?;
        authz::authorize_subject(tx.as_mut(), actor, user_id).await?;
        let mut inst = instances::ensure_instance(tx.as_mut(), pb, user_id, node_id, locale).await?;

        if let Some((normalized, summary)) = form {
            if inst.state == NodeState::Locked {
                return Err(JourneyError::Unprocessable(format!(
                    "node '{node_id}' is locked"
                )));
            }
            let rev = tx
                .record_form_revision(
                    tenant_id,
                    inst.id,
                    normalized.clone(),
                    actor.actor_id(),
                    locale.map(String::from),
                )
                .await?;
            instances::record_event(
                tx.as_mut(),
                &inst,
                EventType::DraftSaved,
                json!({ "rev": rev.rev, "summary": summary }),
                actor.actor_id(),
            )
            .await?;
            if node_id == self.profile_node {
                tx.upsert_profile_submission(tenant_id, user_id, normalized.clone())
                    .await?;
            }
            inst = tx
                .get_instance(tenant_id, inst.id)
                .await?
                .ok_or_else(|| JourneyError::NotFound(format!("node instance {}", inst.id)))?;
        }

        if let Some(to) = to_state {
            let t = instances::transition_state(tx.as_mut(), pb, &self.registry, actor, &inst, to)
                .await?;
            if t.changed && to == NodeState::Submitted {
                let title = node_title(pb, &t.instance, locale);
                self.notifier
                    .on_submitted(
                        tx.as_mut(),
                        &t.instance,
                        &title,
                        json!({ "from": t.from, "to": to }),
                        &mut outbox,
                    )
                    .await?;
            }
            inst = t.instance;
        }

        let dto = build_submission(tx.as_mut(), pb, &inst, locale).await?;
        tx.commit().await?;
        Ok((dto, outbox))
    }

    /// State-only variant of [`JourneyService::put_submission`].
    pub async fn patch_state(
        &self,
        actor: &Principal,
        user_id: Uuid,
        node_id: &str,
        to: NodeState,
        cancel: &Cancellation,
    ) -> Result<SubmissionDto> {
        let req = SubmissionRequest {
            state: Some(to),
            ..Default::default()
        };
        self.put_submission(actor, user_id, node_id, &req, cancel)
            .await
    }

    // ── Uploads ──────────────────────────────────────────────

    /// Mint an upload target for a slot. Never touches the database.
    #[instrument(skip(self, req, cancel), fields(tenant_id = %actor.tenant_id, slot_key = %req.slot_key))]
    pub async fn presign_upload(
        &self,
        actor: &Principal,
        user_id: Uuid,
        node_id: &str,
        req: &PresignRequest,
        cancel: &Cancellation,
    ) -> Result<PresignResponse> {
        authz::authorize_author(actor, user_id)?;
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let node = pb.require_node(node_id)?;
        check_upload(
            node,
            &req.slot_key,
            &req.content_type,
            req.size_bytes,
            self.max_upload_bytes,
        )?;

        let key = object_store::object_key(
            actor.tenant_id,
            user_id,
            node_id,
            &req.slot_key,
            Uuid::new_v4(),
            &req.filename,
        );

        if let Some(bucket) = self.objects.bucket().filter(|_| self.objects.is_configured()) {
            let url = cancel
                .run(async {
                    Ok(self
                        .objects
                        .presign_put(
                            bucket,
                            &key,
                            &req.content_type,
                            req.size_bytes,
                            self.objects.default_expiry(),
                        )
                        .await?)
                })
                .await?;
            return Ok(PresignResponse {
                url: url.to_string(),
                object_key: key,
                storage: StorageKind::Object,
            });
        }

        let path = self.local.path_for(actor.tenant_id, &key)?;
        self.local.prepare(&path).await?;
        Ok(PresignResponse {
            url: path.display().to_string(),
            object_key: key,
            storage: StorageKind::Local,
        })
    }

    /// Bind an uploaded object to its slot, replacing the previous active
    /// attachment.
    #[instrument(skip(self, req, cancel), fields(tenant_id = %actor.tenant_id, slot_key = %req.slot_key))]
    pub async fn attach_upload(
        &self,
        actor: &Principal,
        user_id: Uuid,
        node_id: &str,
        req: &AttachRequest,
        cancel: &Cancellation,
    ) -> Result<AttachmentDto> {
        authz::authorize_author(actor, user_id)?;
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let pb = pb.as_ref();
        let node = pb.require_node(node_id)?;
        check_upload(
            node,
            &req.slot_key,
            &req.content_type,
            req.size_bytes,
            self.max_upload_bytes,
        )?;

        let prefix = object_store::slot_prefix(actor.tenant_id, user_id, node_id, &req.slot_key);
        if !req.object_key.starts_with(&prefix) || req.object_key.contains("..") {
            return Err(JourneyError::InvalidInput(format!(
                "object key does not belong to slot '{}'",
                req.slot_key
            )));
        }
        let location = if self.objects.is_configured() {
            StoredAt::Object {
                bucket: self.objects.bucket().unwrap_or_default().to_string(),
                key: req.object_key.clone(),
            }
        } else {
            let path = self.local.path_for(actor.tenant_id, &req.object_key)?;
            StoredAt::Local(path.display().to_string())
        };
        let location = &location;

        let (dto, outbox) = self
            .retrying("attach_upload", cancel, || async move {
                self.attach_once(actor, pb, user_id, node_id, req, location)
                    .await
            })
            .await?;
        self.notifier.deliver(outbox).await;
        Ok(dto)
    }

    async fn attach_once(
        &self,
        actor: &Principal,
        pb: &Playbook,
        user_id: Uuid,
        node_id: &str,
        req: &AttachRequest,
        location: &StoredAt,
    ) -> Result<(AttachmentDto, Vec<Outbound>)> {
        let tenant_id = actor.tenant_id;
        let mut outbox = Vec::new();
        let mut tx = self.store.begin().await?;
        let inst = instances::ensure_instance(tx.as_mut(), pb, user_id, node_id, None).await?;
        if inst.state == NodeState::Locked {
            return Err(JourneyError::Unprocessable(format!(
                "node '{node_id}' is locked"
            )));
        }
        let slot = tx.ensure_slot(tenant_id, inst.id, &req.slot_key).await?;

        let title = format!("node:{node_id}:{}", req.slot_key);
        let document = match tx
            .find_document(tenant_id, user_id, SLOT_DOCUMENT_KIND, &title)
            .await?
        {
            Some(doc) => doc,
            None => {
                tx.insert_document(NewDocument {
                    tenant_id,
                    user_id,
                    kind: SLOT_DOCUMENT_KIND.to_string(),
                    title,
                })
                .await?
            }
        };
        let (storage_path, bucket, object_key) = match location {
            StoredAt::Object { bucket, key } => (None, Some(bucket.clone()), Some(key.clone())),
            StoredAt::Local(path) => (Some(path.clone()), None, None),
        };
        let version = tx
            .insert_document_version(NewDocumentVersion {
                tenant_id,
                document_id: document.id,
                storage_path,
                bucket,
                object_key,
                mime_type: req.content_type.clone(),
                size_bytes: req.size_bytes,
                uploaded_by: actor.user_id,
            })
            .await?;

        let replaced = tx.deactivate_attachments(tenant_id, slot.id).await?;
        let attachment = tx
            .insert_attachment(NewAttachment {
                tenant_id,
                slot_id: slot.id,
                document_version_id: version.id,
                filename: req.filename.clone(),
                size_bytes: req.size_bytes,
                attached_by: actor.user_id,
            })
            .await?;
        instances::record_event(
            tx.as_mut(),
            &inst,
            EventType::Submitted,
            json!({
                "attachment_id": attachment.id,
                "slot_key": req.slot_key,
                "filename": req.filename,
                "document_version_id": version.id,
            }),
            actor.actor_id(),
        )
        .await?;

        let node_title = node_title(pb, &inst, None);
        self.notifier
            .on_submitted(
                tx.as_mut(),
                &inst,
                &node_title,
                json!({
                    "attachment_id": attachment.id,
                    "slot_key": req.slot_key,
                    "filename": req.filename,
                }),
                &mut outbox,
            )
            .await?;

        tx.commit().await?;
        tracing::info!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            node_id,
            slot_key = %req.slot_key,
            attachment_id = %attachment.id,
            replaced,
            "attachment bound"
        );
        Ok((AttachmentDto::from(&attachment), outbox))
    }

    // ── Review ───────────────────────────────────────────────

    /// Record a reviewer's decision on an active attachment.
    ///
    /// Approval completes the node once every required slot holds an
    /// approving attachment and the registry lets the reviewer move the
    /// node to `done`. Rejection sends a submitted node back to
    /// `needs_fixes`.
    #[instrument(skip(self, req, cancel), fields(tenant_id = %actor.tenant_id, decision = ?req.decision))]
    pub async fn review_attachment(
        &self,
        actor: &Principal,
        attachment_id: Uuid,
        req: &ReviewRequest,
        cancel: &Cancellation,
    ) -> Result<ReviewOutcome> {
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let pb = pb.as_ref();
        let (outcome, outbox) = self
            .retrying("review_attachment", cancel, || async move {
                self.review_once(actor, pb, attachment_id, req).await
            })
            .await?;
        self.notifier.deliver(outbox).await;
        Ok(outcome)
    }

    async fn review_once(
        &self,
        actor: &Principal,
        pb: &Playbook,
        attachment_id: Uuid,
        req: &ReviewRequest,
    ) -> Result<(ReviewOutcome, Vec<Outbound>)> {
        let tenant_id = actor.tenant_id;
        let mut outbox = Vec::new();
        let mut tx = self.store.begin().await?;

        let attachment = tx
            .get_attachment(tenant_id, attachment_id)
            .await?
            .ok_or_else(|| JourneyError::NotFound(format!("attachment {attachment_id}")))?;
        let slot = tx
            .get_slot(tenant_id, attachment.slot_id)
            .await?
            .ok_or_else(|| JourneyError::NotFound(format!("slot {}", attachment.slot_id)))?;
        let inst = tx
            .get_instance(tenant_id, slot.node_instance_id)
            .await?
            .ok_or_else(|| {
                JourneyError::NotFound(format!("node instance {}", slot.node_instance_id))
            })?;
        let student_id = inst.user_id;

        authz::authorize_review(tx.as_mut(), actor, student_id).await?;
        if !attachment.is_active {
            return Err(JourneyError::Unprocessable(format!(
                "attachment {attachment_id} has been replaced"
            )));
        }

        let note = req
            .note
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from);
        let decision = req.decision;
        let reviewed = tx
            .review_attachment(
                tenant_id,
                attachment_id,
                AttachmentReview {
                    status: decision.status(),
                    reviewed_by: actor.user_id,
                    review_note: note.clone(),
                },
            )
            .await?;
        let event_type = if decision.is_approving() {
            EventType::Approved
        } else {
            EventType::Rejected
        };
        instances::record_event(
            tx.as_mut(),
            &inst,
            event_type,
            json!({
                "attachment_id": attachment_id,
                "slot_key": slot.slot_key,
                "status": decision.status(),
                "note": note,
            }),
            actor.actor_id(),
        )
        .await?;

        let node = pb.require_node(&inst.node_id)?;
        let is_owner = actor.is_owner_of(student_id);
        let mut state = inst.state;
        if decision.is_approving() {
            if state != NodeState::Done
                && self.registry.is_allowed(state, NodeState::Done, actor.role, is_owner)
                && all_required_approved(tx.as_mut(), node, &inst).await?
            {
                let t = instances::transition_state(
                    tx.as_mut(),
                    pb,
                    &self.registry,
                    actor,
                    &inst,
                    NodeState::Done,
                )
                .await?;
                state = t.instance.state;
            }
        } else if state != NodeState::NeedsFixes
            && self
                .registry
                .is_allowed(state, NodeState::NeedsFixes, actor.role, is_owner)
        {
            let t = instances::transition_state(
                tx.as_mut(),
                pb,
                &self.registry,
                actor,
                &inst,
                NodeState::NeedsFixes,
            )
            .await?;
            instances::record_event(
                tx.as_mut(),
                &t.instance,
                EventType::Returned,
                json!({ "attachment_id": attachment_id, "note": note }),
                actor.actor_id(),
            )
            .await?;
            state = t.instance.state;
        }

        self.notifier
            .on_reviewed(
                tx.as_mut(),
                &reviewed,
                student_id,
                decision,
                note.as_deref(),
                &mut outbox,
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            student_id = %student_id,
            node_id = %inst.node_id,
            attachment_id = %attachment_id,
            status = %decision.status(),
            state = %state,
            "attachment reviewed"
        );
        Ok((
            ReviewOutcome {
                attachment: AttachmentDto::from(&reviewed),
                student_id,
                node_id: inst.node_id,
                state,
            },
            outbox,
        ))
    }

    /// Where to fetch an attachment's bytes.
    pub async fn download_url(
        &self,
        actor: &Principal,
        attachment_id: Uuid,
        cancel: &Cancellation,
    ) -> Result<DownloadLink> {
        let tenant_id = actor.tenant_id;
        let (attachment, version) = cancel
            .run(async {
                let mut tx = self.store.begin_read().await?;
                let attachment = tx
                    .get_attachment(tenant_id, attachment_id)
                    .await?
                    .ok_or_else(|| JourneyError::NotFound(format!("attachment {attachment_id}")))?;
                let slot = tx
                    .get_slot(tenant_id, attachment.slot_id)
                    .await?
                    .ok_or_else(|| JourneyError::NotFound(format!("slot {}", attachment.slot_id)))?;
                let inst = tx
                    .get_instance(tenant_id, slot.node_instance_id)
                    .await?
                    .ok_or_else(|| {
                        JourneyError::NotFound(format!("node instance {}", slot.node_instance_id))
                    })?;
                authz::authorize_subject(tx.as_mut(), actor, inst.user_id).await?;
                let version = tx
                    .get_document_version(tenant_id, attachment.document_version_id)
                    .await?
                    .ok_or_else(|| {
                        JourneyError::NotFound(format!(
                            "document version {}",
                            attachment.document_version_id
                        ))
                    })?;
                tx.rollback().await?;
                Ok((attachment, version))
            })
            .await?;

        match (&version.bucket, &version.object_key, &version.storage_path) {
            (Some(bucket), Some(key), _) => {
                if !self.objects.is_configured() {
                    return Err(JourneyError::StorageUnavailable(
                        "file is in the object store but no object store is configured".into(),
                    ));
                }
                let url = cancel
                    .run(async {
                        Ok(self
                            .objects
                            .presign_get(bucket, key, self.objects.default_expiry())
                            .await?)
                    })
                    .await?;
                Ok(DownloadLink {
                    url: url.to_string(),
                    storage: StorageKind::Object,
                    filename: attachment.filename,
                    mime_type: version.mime_type,
                })
            }
            (_, _, Some(path)) => {
                if self.objects.is_configured() {
                    return Err(JourneyError::StorageUnavailable(
                        "file is on local disk but the object store is configured".into(),
                    ));
                }
                Ok(DownloadLink {
                    url: path.clone(),
                    storage: StorageKind::Local,
                    filename: attachment.filename,
                    mime_type: version.mime_type,
                })
            }
            _ => Err(JourneyError::Internal(anyhow::anyhow!(
                "document version {} has no storage location",
                version.id
            ))),
        }
    }

    // ── Profile / journey / scoreboard ───────────────────────

    pub async fn get_profile(
        &self,
        actor: &Principal,
        user_id: Uuid,
        cancel: &Cancellation,
    ) -> Result<ProfileDto> {
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        cancel
            .run(async {
                let mut tx = self.store.begin_read().await?;
                authz::authorize_subject(tx.as_mut(), actor, user_id).await?;
                let submission = tx.get_profile_submission(actor.tenant_id, user_id).await?;
                let inst = instances::read_instance(tx.as_mut(), &pb, user_id, &self.profile_node)
                    .await?;
                tx.rollback().await?;

                let rp_required = submission
                    .as_ref()
                    .and_then(|s| s.form_data.get("rp_required"))
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                Ok(ProfileDto {
                    user_id,
                    node_id: self.profile_node.clone(),
                    state: inst.map(|i| i.state),
                    updated_at: submission.as_ref().map(|s| s.updated_at),
                    form_data: submission.map(|s| s.form_data),
                    rp_required,
                })
            })
            .await
    }

    /// Admin-only. Clears the journey projection for the user; instances
    /// and events are kept.
    #[instrument(skip(self, cancel), fields(tenant_id = %actor.tenant_id))]
    pub async fn reset_journey(
        &self,
        actor: &Principal,
        user_id: Uuid,
        cancel: &Cancellation,
    ) -> Result<u64> {
        actor.require_admin()?;
        let removed = self
            .retrying("reset_journey", cancel, || async move {
                let mut tx = self.store.begin().await?;
                let n = tx.delete_journey_states(actor.tenant_id, user_id).await?;
                tx.commit().await?;
                Ok(n)
            })
            .await?;
        tracing::info!(
            tenant_id = %actor.tenant_id,
            user_id = %user_id,
            removed,
            "journey reset"
        );
        Ok(removed)
    }

    /// Worlds and node states for the user, in playbook order.
    pub async fn get_journey(
        &self,
        actor: &Principal,
        user_id: Uuid,
        locale: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<JourneySnapshot> {
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let states = cancel
            .run(async {
                let mut tx = self.store.begin_read().await?;
                authz::authorize_subject(tx.as_mut(), actor, user_id).await?;
                let rows = tx.list_journey_states(actor.tenant_id, user_id).await?;
                tx.rollback().await?;
                Ok(rows)
            })
            .await?;
        Ok(journey_snapshot(&pb, user_id, &states, locale))
    }

    pub async fn get_scoreboard(
        &self,
        actor: &Principal,
        cancel: &Cancellation,
    ) -> Result<Scoreboard> {
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let rows = cancel
            .run(async {
                let mut tx = self.store.begin_read().await?;
                let rows = tx.list_tenant_journey_states(actor.tenant_id, None).await?;
                tx.rollback().await?;
                Ok(rows)
            })
            .await?;
        Ok(scoreboard(&pb, &self.unscored_worlds, &rows, actor.user_id))
    }

    // ── Advisors & notifications ─────────────────────────────

    #[instrument(skip(self, cancel), fields(tenant_id = %actor.tenant_id))]
    pub async fn assign_advisor(
        &self,
        actor: &Principal,
        student_id: Uuid,
        advisor_id: Uuid,
        cancel: &Cancellation,
    ) -> Result<()> {
        actor.require_admin()?;
        self.retrying("assign_advisor", cancel, || async move {
            let mut tx = self.store.begin().await?;
            tx.assign_advisor(actor.tenant_id, student_id, advisor_id)
                .await?;
            tx.commit().await
        })
        .await
    }

    /// Advisor-visible notifications. Advisors see rows for their assigned
    /// students only; admin-level roles see the whole tenant.
    pub async fn list_admin_notifications(
        &self,
        actor: &Principal,
        unread_only: bool,
        cancel: &Cancellation,
    ) -> Result<Vec<AdminNotification>> {
        cancel
            .run(async {
                let mut tx = self.store.begin_read().await?;
                let rows = if actor.role.is_admin_level() {
                    tx.list_admin_notifications(actor.tenant_id, None, unread_only)
                        .await?
                } else if actor.role == Role::Advisor {
                    let students = tx.list_advisees(actor.tenant_id, actor.user_id).await?;
                    tx.list_admin_notifications(actor.tenant_id, Some(&students), unread_only)
                        .await?
                } else {
                    return Err(JourneyError::Forbidden(
                        "only advisors and admins read review notifications".into(),
                    ));
                };
                tx.rollback().await?;
                Ok(rows)
            })
            .await
    }

    pub async fn mark_notification_read(
        &self,
        actor: &Principal,
        notification_id: Uuid,
        cancel: &Cancellation,
    ) -> Result<bool> {
        self.retrying("mark_notification_read", cancel, || async move {
            let mut tx = self.store.begin().await?;
            let row = tx
                .get_admin_notification(actor.tenant_id, notification_id)
                .await?
                .ok_or_else(|| {
                    JourneyError::NotFound(format!("notification {notification_id}"))
                })?;
            if !actor.role.is_admin_level() {
                let assigned = actor.role == Role::Advisor
                    && tx
                        .is_assigned_advisor(actor.tenant_id, row.student_id, actor.user_id)
                        .await?;
                if !assigned {
                    return Err(JourneyError::Forbidden(format!(
                        "notification {notification_id} is not addressed to {}",
                        actor.user_id
                    )));
                }
            }
            let changed = tx
                .mark_admin_notification_read(actor.tenant_id, notification_id)
                .await?;
            tx.commit().await?;
            Ok(changed)
        })
        .await
    }

    /// The caller's own student-visible notifications.
    pub async fn list_student_notifications(
        &self,
        actor: &Principal,
        cancel: &Cancellation,
    ) -> Result<Vec<StudentNotification>> {
        cancel
            .run(async {
                let mut tx = self.store.begin_read().await?;
                let rows = tx
                    .list_student_notifications(actor.tenant_id, actor.user_id)
                    .await?;
                tx.rollback().await?;
                Ok(rows)
            })
            .await
    }

    /// Unlock successors of a node that is already `done`. Used by the
    /// admin CLI to repair journeys after a playbook gains new edges.
    #[instrument(skip(self, cancel), fields(tenant_id = %actor.tenant_id))]
    pub async fn reactivate(
        &self,
        actor: &Principal,
        user_id: Uuid,
        node_id: &str,
        cancel: &Cancellation,
    ) -> Result<Vec<NodeInstance>> {
        actor.require_admin()?;
        let pb = self.playbook(actor.tenant_id, cancel).await?;
        let pb = pb.as_ref();
        self.retrying("reactivate", cancel, || async move {
            let mut tx = self.store.begin().await?;
            let inst = instances::read_instance(tx.as_mut(), pb, user_id, node_id)
                .await?
                .ok_or_else(|| JourneyError::NotFound(format!("node instance for '{node_id}'")))?;
            if inst.state != NodeState::Done {
                return Err(JourneyError::Unprocessable(format!(
                    "node '{node_id}' is {} not done",
                    inst.state
                )));
            }
            let opened = activation::activate_next(tx.as_mut(), pb, &inst).await?;
            tx.commit().await?;
            Ok(opened)
        })
        .await
    }
}

enum StoredAt {
    Object { bucket: String, key: String },
    Local(String),
}

/// Slot lookup plus mime and size checks. The size limit is the slot's
/// `max_size` clamped to the engine-wide `max_upload_bytes`.
fn check_upload<'a>(
    node: &'a Node,
    slot_key: &str,
    content_type: &str,
    size_bytes: i64,
    max_upload_bytes: i64,
) -> Result<&'a UploadRequirement> {
    let up = node.upload(slot_key).ok_or_else(|| {
        JourneyError::NotFound(format!("slot '{slot_key}' on node '{}'", node.id))
    })?;
    if size_bytes <= 0 {
        return Err(JourneyError::InvalidInput(
            "size_bytes must be positive".into(),
        ));
    }
    if !up.accepts_mime(content_type) {
        return Err(JourneyError::InvalidInput(format!(
            "content type '{content_type}' is not allowed for slot '{slot_key}'"
        )));
    }
    let max = up
        .max_size
        .map_or(max_upload_bytes, |m| m.min(max_upload_bytes));
    if size_bytes > max {
        return Err(JourneyError::PayloadTooLarge {
            size: size_bytes,
            max,
        });
    }
    Ok(up)
}

fn node_title(pb: &Playbook, inst: &NodeInstance, requested: Option<&str>) -> String {
    let locale = resolve_locale(pb, inst, requested);
    pb.node_title(&inst.node_id, &locale)
        .unwrap_or_else(|| inst.node_id.clone())
}

/// requested -> instance locale -> playbook default.
fn resolve_locale(pb: &Playbook, inst: &NodeInstance, requested: Option<&str>) -> String {
    let requested = requested
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .or(inst.locale.as_deref());
    pb.resolve_locale(requested)
}

async fn all_required_approved(
    tx: &mut dyn JourneyTx,
    node: &Node,
    inst: &NodeInstance,
) -> Result<bool> {
    for req in node.required_slots() {
        let slot = tx.ensure_slot(inst.tenant_id, inst.id, &req.key).await?;
        match tx.active_attachment(inst.tenant_id, slot.id).await? {
            Some(a) if a.status.is_approving() => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

async fn build_submission(
    tx: &mut dyn JourneyTx,
    pb: &Playbook,
    inst: &NodeInstance,
    requested_locale: Option<&str>,
) -> Result<SubmissionDto> {
    let tenant_id = inst.tenant_id;
    let node = pb.require_node(&inst.node_id)?;
    let locale = resolve_locale(pb, inst, requested_locale);

    let form_data = tx
        .latest_form_revision(tenant_id, inst.id)
        .await?
        .map(|r| r.form_data)
        .unwrap_or_else(|| json!({}));

    let slot_ids: HashMap<String, Uuid> = tx
        .list_slots(tenant_id, inst.id)
        .await?
        .into_iter()
        .map(|s| (s.slot_key, s.id))
        .collect();
    let mut slots = Vec::with_capacity(node.uploads().len());
    for up in node.uploads() {
        let attachments = match slot_ids.get(&up.key) {
            Some(id) => tx
                .list_attachments(tenant_id, *id)
                .await?
                .iter()
                .map(AttachmentDto::from)
                .collect(),
            None => Vec::new(),
        };
        slots.push(SlotDto {
            slot_key: up.key.clone(),
            required: up.required,
            mime: up.mime.clone(),
            max_size: up.max_size,
            attachments,
        });
    }

    let last_event_at = tx
        .list_events(tenant_id, inst.id)
        .await?
        .last()
        .map(|e| e.created_at);

    Ok(SubmissionDto {
        node_id: inst.node_id.clone(),
        state: inst.state,
        title: pb.node_title(&inst.node_id, &locale),
        locale,
        form_data,
        rev: inst.current_rev,
        slots,
        last_event_at,
    })
}

/// Journey view over the projection rows. Nodes without a row are `locked`.
pub fn journey_snapshot(
    pb: &Playbook,
    user_id: Uuid,
    states: &[JourneyState],
    locale: Option<&str>,
) -> JourneySnapshot {
    let locale = pb.resolve_locale(locale);
    let by_node: HashMap<&str, NodeState> = states
        .iter()
        .map(|s| (s.node_id.as_str(), s.state))
        .collect();

    let mut worlds = Vec::with_capacity(pb.worlds_order().len());
    let (mut done, mut total) = (0, 0);
    for world_id in pb.worlds_order() {
        let mut nodes = Vec::new();
        let mut world_done = 0;
        for node_id in pb.world_nodes(world_id) {
            let Some(node) = pb.node(node_id) else {
                continue;
            };
            let state = by_node
                .get(node_id.as_str())
                .copied()
                .unwrap_or(NodeState::Locked);
            if state == NodeState::Done {
                world_done += 1;
            }
            nodes.push(NodeSnapshot {
                id: node_id.clone(),
                title: pb.node_title(node_id, &locale),
                kind: node.kind.clone(),
                state,
            });
        }
        done += world_done;
        total += nodes.len();
        worlds.push(WorldSnapshot {
            id: world_id.clone(),
            title: pb.world_title(world_id, &locale),
            done: world_done,
            total: nodes.len(),
            nodes,
        });
    }

    JourneySnapshot {
        user_id,
        playbook_version: pb.version.clone(),
        locale,
        worlds,
        done,
        total,
    }
}

/// Rank every user that has earned points in the tenant.
///
/// Users with no done node in a scored world are not ranked and do not
/// count towards `total_users` or the average.
pub fn scoreboard(
    pb: &Playbook,
    unscored_worlds: &HashSet<String>,
    rows: &[JourneyState],
    me: Uuid,
) -> Scoreboard {
    let mut scores: BTreeMap<Uuid, i64> = BTreeMap::new();
    for row in rows {
        if row.state != NodeState::Done {
            continue;
        }
        match pb.world_of(&row.node_id) {
            Some(world) if !unscored_worlds.contains(world) => {
                *scores.entry(row.user_id).or_insert(0) += POINTS_PER_NODE;
            }
            _ => {}
        }
    }

    let mut ranked: Vec<(Uuid, i64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let entries: Vec<ScoreboardEntry> = ranked
        .iter()
        .enumerate()
        .map(|(i, (user_id, score))| ScoreboardEntry {
            rank: i + 1,
            user_id: *user_id,
            score: *score,
        })
        .collect();

    let total_users = entries.len();
    let average_score = if total_users == 0 {
        0
    } else {
        entries.iter().map(|e| e.score).sum::<i64>() / total_users as i64
    };
    let me = entries
        .iter()
        .find(|e| e.user_id == me)
        .cloned()
        .unwrap_or(ScoreboardEntry {
            rank: total_users + 1,
            user_id: me,
            score: 0,
        });

    Scoreboard {
        top_5: entries.iter().take(SCOREBOARD_TOP).cloned().collect(),
        average_score,
        me,
        total_users,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::PlaybookDocument;
    use chrono::Utc;

    fn pb() -> Playbook {
        let doc: PlaybookDocument = serde_json::from_value(json!({
            "version": "3",
            "locale_default": "en",
            "worlds": [
                {"id": "W1", "title": {"en": "One"}, "nodes": [
                    {"id": "a", "title": {"en": "A"}, "next": ["b"]},
                    {"id": "b"}
                ]},
                {"id": "W3", "nodes": [{"id": "c"}]}
            ]
        }))
        .unwrap();
        Playbook::build(Uuid::new_v4(), Uuid::new_v4(), "sum".into(), doc).unwrap()
    }

    fn row(user: Uuid, node: &str, state: NodeState) -> JourneyState {
        JourneyState {
            tenant_id: Uuid::nil(),
            user_id: user,
            node_id: node.into(),
            state,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_defaults_to_locked() {
        let pb = pb();
        let user = Uuid::new_v4();
        let snap = journey_snapshot(&pb, user, &[row(user, "a", NodeState::Done)], None);
        assert_eq!(snap.locale, "en");
        assert_eq!(snap.total, 3);
        assert_eq!(snap.done, 1);
        assert_eq!(snap.worlds[0].title.as_deref(), Some("One"));
        assert_eq!(snap.worlds[0].nodes[1].state, NodeState::Locked);
        assert_eq!(snap.worlds[1].done, 0);
    }

    #[test]
    fn scoreboard_ranks_and_skips_unscored_worlds() {
        let pb = pb();
        let unscored: HashSet<String> = ["W3".to_string()].into_iter().collect();
        let (u1, u2, u3) = (Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3));
        let rows = vec![
            row(u1, "a", NodeState::Done),
            row(u1, "c", NodeState::Done),
            row(u2, "a", NodeState::Done),
            row(u2, "b", NodeState::Done),
            row(u3, "a", NodeState::Active),
        ];
        let board = scoreboard(&pb, &unscored, &rows, u1);
        assert_eq!(board.total_users, 2);
        assert_eq!(board.top_5[0].user_id, u2);
        assert_eq!(board.top_5[0].score, 200);
        assert_eq!(board.me.rank, 2);
        assert_eq!(board.me.score, 100);
        assert_eq!(board.average_score, 150);

        let stranger = Uuid::from_u128(9);
        let board = scoreboard(&pb, &unscored, &rows, stranger);
        assert_eq!(board.me.rank, 3);
        assert_eq!(board.me.score, 0);
    }

    #[test]
    fn scoreboard_ignores_users_without_points() {
        let pb = pb();
        let unscored: HashSet<String> = ["W3".to_string()].into_iter().collect();
        let (u1, u2, u3, u4) = (
            Uuid::from_u128(1),
            Uuid::from_u128(2),
            Uuid::from_u128(3),
            Uuid::from_u128(4),
        );
        let rows = vec![
            row(u1, "a", NodeState::Done),
            row(u2, "a", NodeState::Active),
            row(u3, "c", NodeState::Done),
            row(u4, "b", NodeState::Submitted),
        ];
        let board = scoreboard(&pb, &unscored, &rows, u2);
        assert_eq!(board.total_users, 1);
        assert_eq!(board.average_score, 100);
        assert_eq!(board.top_5.len(), 1);
        assert_eq!(board.top_5[0].user_id, u1);
        assert_eq!(board.me.rank, 2);
        assert_eq!(board.me.score, 0);

        let empty = scoreboard(&pb, &unscored, &[row(u2, "a", NodeState::Locked)], u2);
        assert_eq!(empty.total_users, 0);
        assert_eq!(empty.average_score, 0);
        assert_eq!(empty.me.rank, 1);
    }

    #[test]
    fn scoreboard_ties_break_on_user_id() {
        let pb = pb();
        let (u1, u2) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let rows = vec![row(u2, "a", NodeState::Done), row(u1, "a", NodeState::Done)];
        let board = scoreboard(&pb, &HashSet::new(), &rows, u2);
        assert_eq!(board.top_5[0].user_id, u1);
        assert_eq!(board.me.rank, 2);
    }

    #[test]
    fn upload_checks() {
        let doc: PlaybookDocument = serde_json::from_value(json!({
            "version": "1",
            "worlds": [{"id": "W1", "nodes": [{"id": "n", "requirements": {"uploads": [
                {"key": "pdf", "required": true, "mime": ["application/pdf"], "max_size": 1048576},
                {"key": "any", "required": false, "mime": ["application/pdf"]}
            ]}}]}]
        }))
        .unwrap();
        let pb = Playbook::build(Uuid::new_v4(), Uuid::new_v4(), "s".into(), doc).unwrap();
        let node = pb.node("n").unwrap();
        let cap = 10 * 1048576;

        assert!(matches!(
            check_upload(node, "pdf", "image/jpeg", 1024, cap),
            Err(JourneyError::InvalidInput(_))
        ));
        assert!(matches!(
            check_upload(node, "pdf", "application/pdf", 5 * 1048576, cap),
            Err(JourneyError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            check_upload(node, "nope", "application/pdf", 1, cap),
            Err(JourneyError::NotFound(_))
        ));
        assert!(check_upload(node, "pdf", "application/pdf", 1048576, cap).is_ok());
    }

    #[test]
    fn global_cap_bounds_every_slot() {
        let doc: PlaybookDocument = serde_json::from_value(json!({
            "version": "1",
            "worlds": [{"id": "W1", "nodes": [{"id": "n", "requirements": {"uploads": [
                {"key": "big", "required": true, "mime": ["application/pdf"], "max_size": 50 * 1048576},
                {"key": "open", "required": false, "mime": ["application/pdf"]}
            ]}}]}]
        }))
        .unwrap();
        let pb = Playbook::build(Uuid::new_v4(), Uuid::new_v4(), "s".into(), doc).unwrap();
        let node = pb.node("n").unwrap();
        let cap = 5 * 1048576;

        // No slot limit: the cap applies.
        assert!(check_upload(node, "open", "application/pdf", cap, cap).is_ok());
        assert!(matches!(
            check_upload(node, "open", "application/pdf", cap + 1, cap),
            Err(JourneyError::PayloadTooLarge { max, .. }) if max == cap
        ));
        // Slot limit above the cap: the cap wins.
        assert!(matches!(
            check_upload(node, "big", "application/pdf", 20 * 1048576, cap),
            Err(JourneyError::PayloadTooLarge { max, .. }) if max == cap
        ));
    }
}
