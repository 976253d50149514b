//! Notification sink.
//!
//! Rows are written inside the caller's transaction, so a failed write
//! rolls back the mutation that caused it. The optional outbound webhook
//! only runs after commit and never fails a request.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use crate::error::Result;
use crate::state::ReviewDecision;
use crate::store::{
    AdminNotification, Attachment, JourneyTx, NewAdminNotification, NewStudentNotification,
    NodeInstance, StudentNotification,
};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload posted to the outbound webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    Submitted {
        tenant_id: Uuid,
        student_id: Uuid,
        node_id: String,
        advisors: Vec<Uuid>,
        message: String,
    },
    Reviewed {
        tenant_id: Uuid,
        recipient_id: Uuid,
        title: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct NotificationSink {
    notify_student_on_review: bool,
    webhook: Option<Webhook>,
}

impl Default for NotificationSink {
    fn default() -> Self {
        Self {
            notify_student_on_review: true,
            webhook: None,
        }
    }
}

impl NotificationSink {
    pub fn new(notify_student_on_review: bool, webhook_url: Option<Url>) -> Self {
        Self {
            notify_student_on_review,
            webhook: webhook_url.map(Webhook::new),
        }
    }

    /// One advisor-visible row per submission, written only when the
    /// student has at least one advisor.
    pub async fn on_submitted(
        &self,
        tx: &mut dyn JourneyTx,
        inst: &NodeInstance,
        node_title: &str,
        metadata: serde_json::Value,
        outbox: &mut Vec<Outbound>,
    ) -> Result<Option<AdminNotification>> {
        let advisors = tx.list_advisors(inst.tenant_id, inst.user_id).await?;
        if advisors.is_empty() {
            tracing::debug!(
                tenant_id = %inst.tenant_id,
                student_id = %inst.user_id,
                node_id = %inst.node_id,
                "no advisors assigned, skipping notification"
            );
            return Ok(None);
        }

        let message = format!("Student submitted \"{node_title}\" for review");
        let mut metadata = match metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert("advisors".into(), json!(advisors));

        let row = tx
            .insert_admin_notification(NewAdminNotification {
                tenant_id: inst.tenant_id,
                student_id: inst.user_id,
                node_id: inst.node_id.clone(),
                node_instance_id: Some(inst.id),
                event_type: "submitted".to_string(),
                message: message.clone(),
                metadata: serde_json::Value::Object(metadata),
            })
            .await?;

        outbox.push(Outbound::Submitted {
            tenant_id: inst.tenant_id,
            student_id: inst.user_id,
            node_id: inst.node_id.clone(),
            advisors,
            message,
        });
        Ok(Some(row))
    }

    /// Tell the student their document was reviewed.
    pub async fn on_reviewed(
        &self,
        tx: &mut dyn JourneyTx,
        attachment: &Attachment,
        student_id: Uuid,
        decision: ReviewDecision,
        note: Option<&str>,
        outbox: &mut Vec<Outbound>,
    ) -> Result<Option<StudentNotification>> {
        if !self.notify_student_on_review {
            return Ok(None);
        }
        let title = format!("Document Reviewed: {}", attachment.filename);
        let message = review_message(decision, note);

        let row = tx
            .insert_student_notification(NewStudentNotification {
                tenant_id: attachment.tenant_id,
                recipient_id: student_id,
                title: title.clone(),
                message: message.clone(),
                link: Some("/journey".to_string()),
                kind: "document_review".to_string(),
            })
            .await?;

        outbox.push(Outbound::Reviewed {
            tenant_id: attachment.tenant_id,
            recipient_id: student_id,
            title,
            message,
        });
        Ok(Some(row))
    }

    /// Post collected payloads to the webhook. Call after commit.
    pub async fn deliver(&self, outbox: Vec<Outbound>) {
        let Some(webhook) = &self.webhook else {
            return;
        };
        for item in outbox {
            webhook.post(&item).await;
        }
    }
}

pub fn review_message(decision: ReviewDecision, note: Option<&str>) -> String {
    let mut msg = if decision.is_approving() {
        "Your document has been approved.".to_string()
    } else {
        "Changes requested for your document.".to_string()
    };
    if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
        msg.push_str(" Note: ");
        msg.push_str(note);
    }
    msg
}

#[derive(Debug, Clone)]
struct Webhook {
    client: reqwest::Client,
    url: Url,
}

impl Webhook {
    fn new(url: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }

    async fn post(&self, payload: &Outbound) {
        match self
            .client
            .post(self.url.clone())
            .json(payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url = %self.url, "notification webhook delivered");
            }
            Ok(resp) => {
                tracing::warn!(url = %self.url, status = %resp.status(), "notification webhook rejected");
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "notification webhook failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeState;
    use crate::store::{JourneyStore, MemoryStore, NewNodeInstance};

    async fn instance(tx: &mut dyn JourneyTx, tenant: Uuid, student: Uuid) -> NodeInstance {
        tx.insert_instance(NewNodeInstance {
            tenant_id: tenant,
            user_id: student,
            node_id: "n1".into(),
            playbook_version_id: Uuid::new_v4(),
            state: NodeState::Active,
            locale: None,
        })
        .await
        .unwrap()
    }

    #[test]
    fn review_messages() {
        assert_eq!(
            review_message(ReviewDecision::Approved, None),
            "Your document has been approved."
        );
        assert_eq!(
            review_message(ReviewDecision::Rejected, Some(" blurry scan ")),
            "Changes requested for your document. Note: blurry scan"
        );
        assert_eq!(
            review_message(ReviewDecision::ApprovedWithComments, Some("")),
            "Your document has been approved."
        );
    }

    #[tokio::test]
    async fn submission_without_advisors_writes_nothing() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        let inst = instance(tx.as_mut(), tenant, Uuid::new_v4()).await;
        let mut outbox = Vec::new();

        let row = NotificationSink::default()
            .on_submitted(tx.as_mut(), &inst, "Node", json!({}), &mut outbox)
            .await
            .unwrap();
        assert!(row.is_none());
        assert!(outbox.is_empty());
        assert!(tx
            .list_admin_notifications(tenant, None, false)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn submission_writes_single_row_for_all_advisors() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let student = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.assign_advisor(tenant, student, Uuid::new_v4()).await.unwrap();
        tx.assign_advisor(tenant, student, Uuid::new_v4()).await.unwrap();
        let inst = instance(tx.as_mut(), tenant, student).await;
        let mut outbox = Vec::new();

        NotificationSink::default()
            .on_submitted(tx.as_mut(), &inst, "Profile", json!({"slot_key": "cv"}), &mut outbox)
            .await
            .unwrap();
        let rows = tx.list_admin_notifications(tenant, None, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metadata["slot_key"], "cv");
        assert_eq!(rows[0].metadata["advisors"].as_array().unwrap().len(), 2);
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn deliver_without_webhook_is_a_no_op() {
        NotificationSink::new(true, None)
            .deliver(vec![Outbound::Reviewed {
                tenant_id: Uuid::nil(),
                recipient_id: Uuid::nil(),
                title: "t".into(),
                message: "m".into(),
            }])
            .await;
    }
}
