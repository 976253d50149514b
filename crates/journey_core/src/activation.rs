//! Successor activation when a node reaches `done`.

use serde_json::json;

use crate::error::Result;
use crate::instances::{is_done, read_instance, record_event};
use crate::playbook::Playbook;
use crate::state::{EventType, NodeState};
use crate::store::{JourneyTx, NewNodeInstance, NodeInstance};

/// Create or unlock every `next` target of `finished`.
///
/// Locked targets are lifted to `active`; missing ones are created
/// `active`. Targets already past `locked` are left alone, so a node is
/// never lowered or re-opened. A target whose explicit prerequisites are
/// not all `done` yet is skipped; it is unlocked later when its last
/// prerequisite finishes. Returns the instances that were opened.
pub async fn activate_next(
    tx: &mut dyn JourneyTx,
    playbook: &Playbook,
    finished: &NodeInstance,
) -> Result<Vec<NodeInstance>> {
    let tenant_id = finished.tenant_id;
    let user_id = finished.user_id;
    let mut opened = Vec::new();

    for target in playbook.next_of(&finished.node_id) {
        let Some(node) = playbook.node(target) else {
            continue;
        };

        let mut ready = true;
        for pre in &node.prerequisites {
            if !is_done(tx, playbook, user_id, pre).await? {
                ready = false;
                break;
            }
        }
        if !ready {
            tracing::debug!(
                tenant_id = %tenant_id,
                user_id = %user_id,
                node_id = %target,
                "activation skipped: prerequisites pending"
            );
            continue;
        }

        let inst = match read_instance(tx, playbook, user_id, target).await? {
            Some(existing) if existing.state == NodeState::Locked => {
                tx.update_instance_state(tenant_id, existing.id, NodeState::Active)
                    .await?;
                tx.mark_instance_opened(tenant_id, existing.id).await?
            }
            Some(_) => continue,
            None => {
                let created = tx
                    .insert_instance(NewNodeInstance {
                        tenant_id,
                        user_id,
                        node_id: target.clone(),
                        playbook_version_id: playbook.version_id,
                        state: NodeState::Active,
                        locale: finished.locale.clone(),
                    })
                    .await?;
                for up in node.uploads() {
                    tx.ensure_slot(tenant_id, created.id, &up.key).await?;
                }
                created
            }
        };

        record_event(
            tx,
            &inst,
            EventType::Opened,
            json!({ "activated_by": finished.node_id }),
            None,
        )
        .await?;
        tx.upsert_journey_state(tenant_id, user_id, target, NodeState::Active)
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            node_id = %target,
            from_node = %finished.node_id,
            "node activated"
        );
        opened.push(inst);
    }

    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::ensure_instance;
    use crate::playbook::PlaybookDocument;
    use crate::store::{JourneyStore, MemoryStore};
    use uuid::Uuid;

    fn fork_playbook(tenant: Uuid) -> Playbook {
        let doc: PlaybookDocument = serde_json::from_value(json!({
            "version": "1",
            "worlds": [{"id": "W1", "nodes": [
                {"id": "fork", "next": ["branch_a", "branch_b"]},
                {"id": "branch_a", "next": ["join"]},
                {"id": "branch_b", "next": ["join"]},
                {"id": "join", "prerequisites": ["branch_a", "branch_b"]}
            ]}]
        }))
        .unwrap();
        Playbook::build(Uuid::new_v4(), tenant, "sum".into(), doc).unwrap()
    }

    async fn set_state(tx: &mut dyn JourneyTx, inst: &NodeInstance, state: NodeState) -> NodeInstance {
        let row = tx
            .update_instance_state(inst.tenant_id, inst.id, state)
            .await
            .unwrap();
        tx.upsert_journey_state(inst.tenant_id, inst.user_id, &inst.node_id, state)
            .await
            .unwrap();
        row
    }

    #[tokio::test]
    async fn fork_creates_and_lifts_branches() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = fork_playbook(tenant);
        let mut tx = store.begin().await.unwrap();

        let fork = ensure_instance(tx.as_mut(), &pb, user, "fork", None).await.unwrap();
        let b = ensure_instance(tx.as_mut(), &pb, user, "branch_b", None).await.unwrap();
        assert_eq!(b.state, NodeState::Locked);

        let fork = set_state(tx.as_mut(), &fork, NodeState::Done).await;
        let opened = activate_next(tx.as_mut(), &pb, &fork).await.unwrap();
        assert_eq!(opened.len(), 2);

        let lifted = read_instance(tx.as_mut(), &pb, user, "branch_b").await.unwrap().unwrap();
        assert_eq!(lifted.id, b.id, "existing instance is lifted, not recreated");
        assert_eq!(lifted.state, NodeState::Active);
        assert!(lifted.opened_at.is_some());
        assert_eq!(tx.list_instances(tenant, user).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn join_waits_for_all_prerequisites() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = fork_playbook(tenant);
        let mut tx = store.begin().await.unwrap();

        let fork = ensure_instance(tx.as_mut(), &pb, user, "fork", None).await.unwrap();
        let fork = set_state(tx.as_mut(), &fork, NodeState::Done).await;
        activate_next(tx.as_mut(), &pb, &fork).await.unwrap();

        let a = read_instance(tx.as_mut(), &pb, user, "branch_a").await.unwrap().unwrap();
        let a = set_state(tx.as_mut(), &a, NodeState::Done).await;
        assert!(activate_next(tx.as_mut(), &pb, &a).await.unwrap().is_empty());
        assert!(read_instance(tx.as_mut(), &pb, user, "join").await.unwrap().is_none());

        let b = read_instance(tx.as_mut(), &pb, user, "branch_b").await.unwrap().unwrap();
        let b = set_state(tx.as_mut(), &b, NodeState::Done).await;
        let opened = activate_next(tx.as_mut(), &pb, &b).await.unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].node_id, "join");
    }

    #[tokio::test]
    async fn never_lowers_or_reopens() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = fork_playbook(tenant);
        let mut tx = store.begin().await.unwrap();

        let fork = ensure_instance(tx.as_mut(), &pb, user, "fork", None).await.unwrap();
        let fork = set_state(tx.as_mut(), &fork, NodeState::Done).await;
        activate_next(tx.as_mut(), &pb, &fork).await.unwrap();

        let a = read_instance(tx.as_mut(), &pb, user, "branch_a").await.unwrap().unwrap();
        set_state(tx.as_mut(), &a, NodeState::Done).await;
        let b = read_instance(tx.as_mut(), &pb, user, "branch_b").await.unwrap().unwrap();
        set_state(tx.as_mut(), &b, NodeState::Submitted).await;

        // Activating again is a no-op for targets past `locked`.
        let opened = activate_next(tx.as_mut(), &pb, &fork).await.unwrap();
        assert!(opened.is_empty());
        let a = read_instance(tx.as_mut(), &pb, user, "branch_a").await.unwrap().unwrap();
        let b = read_instance(tx.as_mut(), &pb, user, "branch_b").await.unwrap().unwrap();
        assert_eq!(a.state, NodeState::Done);
        assert_eq!(b.state, NodeState::Submitted);
    }
}
