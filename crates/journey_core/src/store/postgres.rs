//! PostgreSQL store.
//!
//! Mutations run at `SERIALIZABLE`; reads use a `REPEATABLE READ`
//! snapshot. Serialization failures, deadlocks and racing unique inserts
//! surface as [`JourneyError::Conflict`] so the service can retry them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::*;
use crate::config::DatabaseConfig;
use crate::error::JourneyError;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK: &str = "40P01";
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

const INSTANCE_COLUMNS: &str = "id, tenant_id, user_id, node_id, playbook_version_id, state, \
     locale, current_rev, opened_at, updated_at";
const ATTACHMENT_COLUMNS: &str = "id, tenant_id, slot_id, document_version_id, is_active, \
     status, filename, size_bytes, attached_by, reviewed_by, review_note, reviewed_at, created_at";
const VERSION_COLUMNS: &str = "id, tenant_id, document_id, storage_path, bucket, object_key, \
     mime_type, size_bytes, uploaded_by, created_at";
const ADMIN_NOTIFICATION_COLUMNS: &str = "id, tenant_id, student_id, node_id, node_instance_id, \
     event_type, message, metadata, is_read, created_at";
const NOTIFICATION_COLUMNS: &str =
    "id, tenant_id, recipient_id, title, message, link, kind, is_read, created_at";

pub(crate) fn map_db_err(err: sqlx::Error) -> JourneyError {
    if let sqlx::Error::Database(db) = &err {
        let code = db.code();
        if matches!(
            code.as_deref(),
            Some(SQLSTATE_SERIALIZATION_FAILURE | SQLSTATE_DEADLOCK | SQLSTATE_UNIQUE_VIOLATION)
        ) {
            return JourneyError::Conflict(db.message().to_string());
        }
    }
    if matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    ) {
        return JourneyError::StorageUnavailable(err.to_string());
    }
    JourneyError::Internal(anyhow::Error::new(err).context("database error"))
}

fn corrupt(e: impl std::fmt::Display) -> JourneyError {
    JourneyError::Internal(anyhow::anyhow!("corrupt row: {e}"))
}

// ── Rows with enum columns ───────────────────────────────────

#[derive(FromRow)]
struct InstanceRow {
    id: Uuid,
    tenant_id: Uuid,
    user_id: Uuid,
    node_id: String,
    playbook_version_id: Uuid,
    state: String,
    locale: Option<String>,
    current_rev: i32,
    opened_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for NodeInstance {
    type Error = JourneyError;

    fn try_from(r: InstanceRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            tenant_id: r.tenant_id,
            user_id: r.user_id,
            node_id: r.node_id,
            playbook_version_id: r.playbook_version_id,
            state: r.state.parse().map_err(corrupt)?,
            locale: r.locale,
            current_rev: r.current_rev,
            opened_at: r.opened_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: i64,
    tenant_id: Uuid,
    node_instance_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    actor_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for NodeEvent {
    type Error = JourneyError;

    fn try_from(r: EventRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            tenant_id: r.tenant_id,
            node_instance_id: r.node_instance_id,
            event_type: r.event_type.parse().map_err(corrupt)?,
            payload: r.payload,
            actor_id: r.actor_id,
            created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
struct JourneyStateRow {
    tenant_id: Uuid,
    user_id: Uuid,
    node_id: String,
    state: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JourneyStateRow> for JourneyState {
    type Error = JourneyError;

    fn try_from(r: JourneyStateRow) -> Result<Self> {
        Ok(Self {
            tenant_id: r.tenant_id,
            user_id: r.user_id,
            node_id: r.node_id,
            state: r.state.parse().map_err(corrupt)?,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AttachmentRow {
    id: Uuid,
    tenant_id: Uuid,
    slot_id: Uuid,
    document_version_id: Uuid,
    is_active: bool,
    status: String,
    filename: String,
    size_bytes: i64,
    attached_by: Uuid,
    reviewed_by: Option<Uuid>,
    review_note: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AttachmentRow> for Attachment {
    type Error = JourneyError;

    fn try_from(r: AttachmentRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            tenant_id: r.tenant_id,
            slot_id: r.slot_id,
            document_version_id: r.document_version_id,
            is_active: r.is_active,
            status: r.status.parse().map_err(corrupt)?,
            filename: r.filename,
            size_bytes: r.size_bytes,
            attached_by: r.attached_by,
            reviewed_by: r.reviewed_by,
            review_note: r.review_note,
            reviewed_at: r.reviewed_at,
            created_at: r.created_at,
        })
    }
}

fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = JourneyError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ── Store ────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a pool with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(url = %config.masked_url(), "connecting to database");

        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout);
        if let Some(idle_timeout) = config.idle_timeout {
            options = options.idle_timeout(idle_timeout);
        }
        if let Some(max_lifetime) = config.max_lifetime {
            options = options.max_lifetime(max_lifetime);
        }

        let pool = options.connect(&config.database_url).await.map_err(|e| {
            warn!(error = %e, "failed to connect to database");
            map_db_err(e)
        })?;
        info!("database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("running journey migrations");
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| JourneyError::Internal(anyhow::Error::new(e).context("migration failed")))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn open(&self, isolation: &'static str) -> Result<Box<dyn JourneyTx>> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        sqlx::query(isolation)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        Ok(Box::new(PgTx { tx }))
    }
}

#[async_trait]
impl JourneyStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn JourneyTx>> {
        self.open("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").await
    }

    async fn begin_read(&self) -> Result<Box<dyn JourneyTx>> {
        self.open("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ").await
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl JourneyTx for PgTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_db_err)
    }

    // ── Playbooks ────────────────────────────────────────────

    async fn find_playbook_by_checksum(
        &mut self,
        tenant_id: Uuid,
        checksum: &str,
    ) -> Result<Option<PlaybookVersion>> {
        sqlx::query_as::<_, PlaybookVersion>(
            r#"
            SELECT id, tenant_id, version, checksum, raw_json, created_at
            FROM playbook_versions
            WHERE tenant_id = $1 AND checksum = $2
            "#,
        )
        .bind(tenant_id)
        .bind(checksum)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn insert_playbook(&mut self, new: NewPlaybookVersion) -> Result<PlaybookVersion> {
        sqlx::query_as::<_, PlaybookVersion>(
            r#"
            INSERT INTO playbook_versions (id, tenant_id, version, checksum, raw_json)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, tenant_id, version, checksum, raw_json, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(&new.version)
        .bind(&new.checksum)
        .bind(&new.raw_json)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn latest_playbook(&mut self, tenant_id: Uuid) -> Result<Option<PlaybookVersion>> {
        sqlx::query_as::<_, PlaybookVersion>(
            r#"
            SELECT id, tenant_id, version, checksum, raw_json, created_at
            FROM playbook_versions
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    // ── Node instances ───────────────────────────────────────

    async fn find_instance(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        node_id: &str,
        playbook_version_id: Uuid,
    ) -> Result<Option<NodeInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM node_instances \
             WHERE tenant_id = $1 AND user_id = $2 AND node_id = $3 AND playbook_version_id = $4 \
             FOR UPDATE"
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(tenant_id)
            .bind(user_id)
            .bind(node_id)
            .bind(playbook_version_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .map(NodeInstance::try_from)
            .transpose()
    }

    async fn get_instance(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<NodeInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM node_instances WHERE tenant_id = $1 AND id = $2"
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .map(NodeInstance::try_from)
            .transpose()
    }

    async fn insert_instance(&mut self, new: NewNodeInstance) -> Result<NodeInstance> {
        let sql = format!(
            "INSERT INTO node_instances \
                 (id, tenant_id, user_id, node_id, playbook_version_id, state, locale, opened_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, CASE WHEN $8 THEN now() END) \
             ON CONFLICT (tenant_id, user_id, node_id, playbook_version_id) DO NOTHING \
             RETURNING {INSTANCE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.tenant_id)
            .bind(new.user_id)
            .bind(&new.node_id)
            .bind(new.playbook_version_id)
            .bind(new.state.as_str())
            .bind(&new.locale)
            .bind(new.state.is_unlocked())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?;

        match inserted {
            Some(row) => row.try_into(),
            None => self
                .find_instance(
                    new.tenant_id,
                    new.user_id,
                    &new.node_id,
                    new.playbook_version_id,
                )
                .await?
                .ok_or_else(|| {
                    JourneyError::Conflict(format!("node instance '{}' vanished", new.node_id))
                }),
        }
    }

    async fn update_instance_state(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
        state: NodeState,
    ) -> Result<NodeInstance> {
        let sql = format!(
            "UPDATE node_instances SET state = $3, updated_at = now() \
             WHERE tenant_id = $1 AND id = $2 \
             RETURNING {INSTANCE_COLUMNS}"
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(tenant_id)
            .bind(id)
            .bind(state.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| JourneyError::NotFound(format!("node instance {id}")))?
            .try_into()
    }

    async fn mark_instance_opened(&mut self, tenant_id: Uuid, id: Uuid) -> Result<NodeInstance> {
        let sql = format!(
            "UPDATE node_instances SET opened_at = COALESCE(opened_at, now()), updated_at = now() \
             WHERE tenant_id = $1 AND id = $2 \
             RETURNING {INSTANCE_COLUMNS}"
        );
        sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| JourneyError::NotFound(format!("node instance {id}")))?
            .try_into()
    }

    async fn list_instances(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<NodeInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM node_instances \
             WHERE tenant_id = $1 AND user_id = $2 ORDER BY node_id"
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(tenant_id)
            .bind(user_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        convert(rows)
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
        let rev: i32 = sqlx::query_scalar(
            r#"
            UPDATE node_instances
            SET current_rev = current_rev + 1,
                locale = COALESCE($3, locale),
                updated_at = now()
            WHERE tenant_id = $1 AND id = $2
            RETURNING current_rev
            "#,
        )
        .bind(tenant_id)
        .bind(instance_id)
        .bind(&locale)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| JourneyError::NotFound(format!("node instance {instance_id}")))?;

        sqlx::query_as::<_, FormRevision>(
            r#"
            INSERT INTO node_instance_form_revisions
                (node_instance_id, rev, tenant_id, form_data, edited_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING node_instance_id, rev, form_data, edited_by, created_at
            "#,
        )
        .bind(instance_id)
        .bind(rev)
        .bind(tenant_id)
        .bind(&form_data)
        .bind(edited_by)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn latest_form_revision(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Option<FormRevision>> {
        sqlx::query_as::<_, FormRevision>(
            r#"
            SELECT node_instance_id, rev, form_data, edited_by, created_at
            FROM node_instance_form_revisions
            WHERE tenant_id = $1 AND node_instance_id = $2
            ORDER BY rev DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(instance_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn upsert_profile_submission(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        form_data: serde_json::Value,
    ) -> Result<ProfileSubmission> {
        sqlx::query_as::<_, ProfileSubmission>(
            r#"
            INSERT INTO profile_submissions (tenant_id, user_id, form_data)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, user_id)
            DO UPDATE SET form_data = EXCLUDED.form_data, updated_at = now()
            RETURNING tenant_id, user_id, form_data, updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(&form_data)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn get_profile_submission(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ProfileSubmission>> {
        sqlx::query_as::<_, ProfileSubmission>(
            r#"
            SELECT tenant_id, user_id, form_data, updated_at
            FROM profile_submissions
            WHERE tenant_id = $1 AND user_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    // ── Events ───────────────────────────────────────────────

    async fn append_event(&mut self, new: NewNodeEvent) -> Result<NodeEvent> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO node_events (tenant_id, node_instance_id, event_type, payload, actor_id)
            SELECT $1, $2, $3, $4, $5
            WHERE EXISTS (SELECT 1 FROM node_instances WHERE tenant_id = $1 AND id = $2)
            RETURNING id, tenant_id, node_instance_id, event_type, payload, actor_id, created_at
            "#,
        )
        .bind(new.tenant_id)
        .bind(new.node_instance_id)
        .bind(new.event_type.as_str())
        .bind(&new.payload)
        .bind(new.actor_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| JourneyError::NotFound(format!("node instance {}", new.node_instance_id)))?;
        row.try_into()
    }

    async fn list_events(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Vec<NodeEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, tenant_id, node_instance_id, event_type, payload, actor_id, created_at
            FROM node_events
            WHERE tenant_id = $1 AND node_instance_id = $2
            ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id)
        .bind(instance_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        convert(rows)
    }

    // ── Journey projection ───────────────────────────────────

    async fn upsert_journey_state(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        node_id: &str,
        state: NodeState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO journey_states (tenant_id, user_id, node_id, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, user_id, node_id)
            DO UPDATE SET state = EXCLUDED.state, updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(node_id)
        .bind(state.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn list_journey_states(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<JourneyState>> {
        let rows = sqlx::query_as::<_, JourneyStateRow>(
            r#"
            SELECT tenant_id, user_id, node_id, state, updated_at
            FROM journey_states
            WHERE tenant_id = $1 AND user_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        convert(rows)
    }

    async fn list_tenant_journey_states(
        &mut self,
        tenant_id: Uuid,
        state: Option<NodeState>,
    ) -> Result<Vec<JourneyState>> {
        let rows = sqlx::query_as::<_, JourneyStateRow>(
            r#"
            SELECT tenant_id, user_id, node_id, state, updated_at
            FROM journey_states
            WHERE tenant_id = $1 AND ($2::text IS NULL OR state = $2)
            "#,
        )
        .bind(tenant_id)
        .bind(state.map(|s| s.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        convert(rows)
    }

    async fn delete_journey_states(&mut self, tenant_id: Uuid, user_id: Uuid) -> Result<u64> {
        let done = sqlx::query("DELETE FROM journey_states WHERE tenant_id = $1 AND user_id = $2")
            .bind(tenant_id)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        Ok(done.rows_affected())
    }

    // ── Slots ────────────────────────────────────────────────

    async fn ensure_slot(
        &mut self,
        tenant_id: Uuid,
        instance_id: Uuid,
        slot_key: &str,
    ) -> Result<Slot> {
        sqlx::query(
            r#"
            INSERT INTO node_instance_slots (id, tenant_id, node_instance_id, slot_key)
            SELECT $1, $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM node_instances WHERE tenant_id = $2 AND id = $3)
            ON CONFLICT (node_instance_id, slot_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(instance_id)
        .bind(slot_key)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;

        sqlx::query_as::<_, Slot>(
            r#"
            SELECT id, tenant_id, node_instance_id, slot_key, created_at
            FROM node_instance_slots
            WHERE tenant_id = $1 AND node_instance_id = $2 AND slot_key = $3
            "#,
        )
        .bind(tenant_id)
        .bind(instance_id)
        .bind(slot_key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| JourneyError::NotFound(format!("node instance {instance_id}")))
    }

    async fn get_slot(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<Slot>> {
        sqlx::query_as::<_, Slot>(
            r#"
            SELECT id, tenant_id, node_instance_id, slot_key, created_at
            FROM node_instance_slots
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn list_slots(&mut self, tenant_id: Uuid, instance_id: Uuid) -> Result<Vec<Slot>> {
        sqlx::query_as::<_, Slot>(
            r#"
            SELECT id, tenant_id, node_instance_id, slot_key, created_at
            FROM node_instance_slots
            WHERE tenant_id = $1 AND node_instance_id = $2
            ORDER BY created_at, slot_key
            "#,
        )
        .bind(tenant_id)
        .bind(instance_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    // ── Documents ────────────────────────────────────────────

    async fn find_document(
        &mut self,
        tenant_id: Uuid,
        user_id: Uuid,
        kind: &str,
        title: &str,
    ) -> Result<Option<Document>> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT id, tenant_id, user_id, kind, title, created_at
            FROM documents
            WHERE tenant_id = $1 AND user_id = $2 AND kind = $3 AND title = $4
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(kind)
        .bind(title)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn insert_document(&mut self, new: NewDocument) -> Result<Document> {
        sqlx::query_as::<_, Document>(
            r#"
            INSERT INTO documents (id, tenant_id, user_id, kind, title)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, tenant_id, user_id, kind, title, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(new.user_id)
        .bind(&new.kind)
        .bind(&new.title)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn insert_document_version(
        &mut self,
        new: NewDocumentVersion,
    ) -> Result<DocumentVersion> {
        let sql = format!(
            "INSERT INTO document_versions \
                 (id, tenant_id, document_id, storage_path, bucket, object_key, mime_type, size_bytes, uploaded_by) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9 \
             WHERE EXISTS (SELECT 1 FROM documents WHERE tenant_id = $2 AND id = $3) \
             RETURNING {VERSION_COLUMNS}"
        );
        sqlx::query_as::<_, DocumentVersion>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.tenant_id)
            .bind(new.document_id)
            .bind(&new.storage_path)
            .bind(&new.bucket)
            .bind(&new.object_key)
            .bind(&new.mime_type)
            .bind(new.size_bytes)
            .bind(new.uploaded_by)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| JourneyError::NotFound(format!("document {}", new.document_id)))
    }

    async fn get_document_version(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<DocumentVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE tenant_id = $1 AND id = $2"
        );
        sqlx::query_as::<_, DocumentVersion>(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)
    }

    // ── Attachments ──────────────────────────────────────────

    async fn deactivate_attachments(&mut self, tenant_id: Uuid, slot_id: Uuid) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE node_instance_slot_attachments
            SET is_active = false
            WHERE tenant_id = $1 AND slot_id = $2 AND is_active
            "#,
        )
        .bind(tenant_id)
        .bind(slot_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(done.rows_affected())
    }

    async fn insert_attachment(&mut self, new: NewAttachment) -> Result<Attachment> {
        let sql = format!(
            "INSERT INTO node_instance_slot_attachments \
                 (id, tenant_id, slot_id, document_version_id, filename, size_bytes, attached_by) \
             SELECT $1, $2, $3, $4, $5, $6, $7 \
             WHERE EXISTS (SELECT 1 FROM node_instance_slots WHERE tenant_id = $2 AND id = $3) \
             RETURNING {ATTACHMENT_COLUMNS}"
        );
        sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.tenant_id)
            .bind(new.slot_id)
            .bind(new.document_version_id)
            .bind(&new.filename)
            .bind(new.size_bytes)
            .bind(new.attached_by)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| JourneyError::NotFound(format!("slot {}", new.slot_id)))?
            .try_into()
    }

    async fn get_attachment(&mut self, tenant_id: Uuid, id: Uuid) -> Result<Option<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM node_instance_slot_attachments \
             WHERE tenant_id = $1 AND id = $2"
        );
        sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .map(Attachment::try_from)
            .transpose()
    }

    async fn list_attachments(
        &mut self,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM node_instance_slot_attachments \
             WHERE tenant_id = $1 AND slot_id = $2 \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(tenant_id)
            .bind(slot_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        convert(rows)
    }

    async fn active_attachment(
        &mut self,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<Option<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM node_instance_slot_attachments \
             WHERE tenant_id = $1 AND slot_id = $2 AND is_active"
        );
        sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(tenant_id)
            .bind(slot_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .map(Attachment::try_from)
            .transpose()
    }

    async fn review_attachment(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
        review: AttachmentReview,
    ) -> Result<Attachment> {
        let sql = format!(
            "UPDATE node_instance_slot_attachments \
             SET status = $3, reviewed_by = $4, review_note = $5, reviewed_at = now() \
             WHERE tenant_id = $1 AND id = $2 \
             RETURNING {ATTACHMENT_COLUMNS}"
        );
        sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(tenant_id)
            .bind(id)
            .bind(review.status.as_str())
            .bind(review.reviewed_by)
            .bind(&review.review_note)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| JourneyError::NotFound(format!("attachment {id}")))?
            .try_into()
    }

    // ── Advisors ─────────────────────────────────────────────

    async fn list_advisors(&mut self, tenant_id: Uuid, student_id: Uuid) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT advisor_id FROM student_advisors \
             WHERE tenant_id = $1 AND student_id = $2 ORDER BY created_at, advisor_id",
        )
        .bind(tenant_id)
        .bind(student_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn list_advisees(&mut self, tenant_id: Uuid, advisor_id: Uuid) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT student_id FROM student_advisors \
             WHERE tenant_id = $1 AND advisor_id = $2 ORDER BY created_at, student_id",
        )
        .bind(tenant_id)
        .bind(advisor_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn is_assigned_advisor(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
        advisor_id: Uuid,
    ) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM student_advisors \
             WHERE tenant_id = $1 AND student_id = $2 AND advisor_id = $3)",
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(advisor_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_err)
    }

    async fn assign_advisor(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
        advisor_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO student_advisors (tenant_id, student_id, advisor_id) \
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(tenant_id)
        .bind(student_id)
        .bind(advisor_id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    // ── Notifications ────────────────────────────────────────

    async fn insert_admin_notification(
        &mut self,
        new: NewAdminNotification,
    ) -> Result<AdminNotification> {
        let sql = format!(
            "INSERT INTO admin_notifications \
                 (id, tenant_id, student_id, node_id, node_instance_id, event_type, message, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {ADMIN_NOTIFICATION_COLUMNS}"
        );
        sqlx::query_as::<_, AdminNotification>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.tenant_id)
            .bind(new.student_id)
            .bind(&new.node_id)
            .bind(new.node_instance_id)
            .bind(&new.event_type)
            .bind(&new.message)
            .bind(&new.metadata)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_db_err)
    }

    async fn list_admin_notifications(
        &mut self,
        tenant_id: Uuid,
        students: Option<&[Uuid]>,
        unread_only: bool,
    ) -> Result<Vec<AdminNotification>> {
        let sql = format!(
            "SELECT {ADMIN_NOTIFICATION_COLUMNS} FROM admin_notifications \
             WHERE tenant_id = $1 \
               AND ($2::uuid[] IS NULL OR student_id = ANY($2)) \
               AND (NOT $3 OR NOT is_read) \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, AdminNotification>(&sql)
            .bind(tenant_id)
            .bind(students.map(<[Uuid]>::to_vec))
            .bind(unread_only)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_err)
    }

    async fn get_admin_notification(
        &mut self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<AdminNotification>> {
        let sql = format!(
            "SELECT {ADMIN_NOTIFICATION_COLUMNS} FROM admin_notifications \
             WHERE tenant_id = $1 AND id = $2"
        );
        sqlx::query_as::<_, AdminNotification>(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_err)
    }

    async fn mark_admin_notification_read(&mut self, tenant_id: Uuid, id: Uuid) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE admin_notifications SET is_read = true WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(done.rows_affected() > 0)
    }

    async fn insert_student_notification(
        &mut self,
        new: NewStudentNotification,
    ) -> Result<StudentNotification> {
        let sql = format!(
            "INSERT INTO notifications (id, tenant_id, recipient_id, title, message, link, kind) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {NOTIFICATION_COLUMNS}"
        );
        sqlx::query_as::<_, StudentNotification>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.tenant_id)
            .bind(new.recipient_id)
            .bind(&new.title)
            .bind(&new.message)
            .bind(&new.link)
            .bind(&new.kind)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_db_err)
    }

    async fn list_student_notifications(
        &mut self,
        tenant_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Vec<StudentNotification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE tenant_id = $1 AND recipient_id = $2 \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, StudentNotification>(&sql)
            .bind(tenant_id)
            .bind(recipient_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_err)
    }
}
