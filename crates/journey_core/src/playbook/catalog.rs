use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{canonicalize, Playbook, PlaybookDocument, FALLBACK_LOCALE};
use crate::error::{JourneyError, Result};
use crate::store::{JourneyStore, NewPlaybookVersion, PlaybookVersion};

/// What an ingest did with the submitted bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// New row written; it is now the tenant's current playbook.
    Created,
    /// Same checksum as the current playbook; nothing changed.
    AlreadyCurrent,
    /// Matches an older stored version. The newer one stays current.
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ingested {
    #[serde(flatten)]
    pub version: PlaybookVersion,
    pub status: IngestStatus,
}

/// Per-tenant current playbook, copy-on-swap.
///
/// Readers get an `Arc<Playbook>` snapshot and keep it for the whole call.
/// `ingest` builds a fresh index and replaces the pointer; an index is never
/// mutated after it is published.
pub struct PlaybookCatalog {
    store: Arc<dyn JourneyStore>,
    current: RwLock<HashMap<Uuid, Arc<Playbook>>>,
    /// Used when a document does not declare `locale_default`.
    default_locale: String,
}

impl PlaybookCatalog {
    pub fn new(store: Arc<dyn JourneyStore>) -> Self {
        Self {
            store,
            current: RwLock::new(HashMap::new()),
            default_locale: FALLBACK_LOCALE.to_string(),
        }
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        let locale = locale.into();
        if !locale.trim().is_empty() {
            self.default_locale = locale;
        }
        self
    }

    fn index(
        &self,
        version_id: Uuid,
        tenant_id: Uuid,
        checksum: String,
        doc: PlaybookDocument,
    ) -> Result<Playbook> {
        let declared = doc
            .locale_default
            .as_deref()
            .is_some_and(|l| !l.trim().is_empty());
        let mut pb = Playbook::build(version_id, tenant_id, checksum, doc)?;
        if !declared {
            pb.locale_default = self.default_locale.clone();
        }
        Ok(pb)
    }

    fn index_row(&self, row: &PlaybookVersion) -> Result<Playbook> {
        let doc: PlaybookDocument = serde_json::from_value(row.raw_json.clone())
            .map_err(|e| JourneyError::InvalidPlaybook(e.to_string()))?;
        self.index(row.id, row.tenant_id, row.checksum.clone(), doc)
    }

    /// Current playbook for the tenant, loading it from the store on first use.
    pub async fn load_current(&self, tenant_id: Uuid) -> Result<Arc<Playbook>> {
        if let Some(pb) = self.current.read().await.get(&tenant_id) {
            return Ok(pb.clone());
        }

        let mut tx = self.store.begin_read().await?;
        let row = tx.latest_playbook(tenant_id).await?;
        tx.rollback().await?;

        let row = row.ok_or_else(|| {
            JourneyError::NotFound(format!("no playbook ingested for tenant {tenant_id}"))
        })?;
        let pb = Arc::new(self.index_row(&row)?);

        let mut current = self.current.write().await;
        // Another caller may have published a newer index meanwhile.
        let entry = current.entry(tenant_id).or_insert_with(|| pb.clone());
        tracing::debug!(
            tenant_id = %tenant_id,
            version = %entry.version,
            checksum = %entry.checksum,
            "playbook loaded"
        );
        Ok(entry.clone())
    }

    /// Store a playbook document for the tenant.
    ///
    /// The bytes are canonicalized and hashed. If the tenant already has a
    /// version with that checksum it is returned untouched and no rollback
    /// happens; `status` says whether it was current or superseded.
    /// Otherwise a new row is written and becomes the tenant's current
    /// playbook. Documents that fail validation are never persisted.
    pub async fn ingest(&self, tenant_id: Uuid, raw: &[u8]) -> Result<Ingested> {
        let (canonical, checksum) = canonicalize(raw)?;
        let doc: PlaybookDocument = serde_json::from_value(canonical.clone())
            .map_err(|e| JourneyError::InvalidPlaybook(e.to_string()))?;
        // Validate before touching the store.
        self.index(Uuid::nil(), tenant_id, checksum.clone(), doc.clone())?;

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.find_playbook_by_checksum(tenant_id, &checksum).await? {
            let latest = tx.latest_playbook(tenant_id).await?;
            tx.rollback().await?;
            let status = match latest {
                Some(latest) if latest.id != existing.id => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        version = %existing.version,
                        current_version = %latest.version,
                        checksum = %checksum,
                        "playbook matches an older version; current version kept"
                    );
                    IngestStatus::Superseded
                }
                _ => {
                    tracing::info!(
                        tenant_id = %tenant_id,
                        version = %existing.version,
                        checksum = %checksum,
                        "playbook already current"
                    );
                    IngestStatus::AlreadyCurrent
                }
            };
            return Ok(Ingested {
                version: existing,
                status,
            });
        }
        let row = tx
            .insert_playbook(NewPlaybookVersion {
                tenant_id,
                version: doc.version.clone(),
                checksum: checksum.clone(),
                raw_json: canonical,
            })
            .await?;
        tx.commit().await?;

        let pb = Arc::new(self.index(row.id, tenant_id, checksum, doc)?);
        self.current.write().await.insert(tenant_id, pb);
        tracing::info!(
            tenant_id = %tenant_id,
            version = %row.version,
            checksum = %row.checksum,
            "playbook ingested"
        );
        Ok(Ingested {
            version: row,
            status: IngestStatus::Created,
        })
    }

    /// Drop the cached index so the next read reloads from the store.
    pub async fn invalidate(&self, tenant_id: Uuid) {
        self.current.write().await.remove(&tenant_id);
    }
}
