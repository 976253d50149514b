//! Node instance lifecycle inside a caller-owned transaction.
//!
//! These helpers never open or commit transactions themselves; the journey
//! service owns the boundary so that data, state, events and activation
//! commit together.

use serde_json::json;
use uuid::Uuid;

use crate::activation;
use crate::error::{JourneyError, Result};
use crate::playbook::{Node, Playbook};
use crate::principal::Principal;
use crate::state::{EventType, NodeState};
use crate::store::{JourneyTx, NewNodeEvent, NewNodeInstance, NodeEvent, NodeInstance, Slot};
use crate::transitions::TransitionRegistry;

/// Result of [`transition_state`].
#[derive(Debug, Clone)]
pub struct Transition {
    pub instance: NodeInstance,
    pub from: NodeState,
    /// False for an accepted self-transition.
    pub changed: bool,
    /// Successors that were created or unlocked because the node reached
    /// `done`.
    pub activated: Vec<NodeInstance>,
}

/// Find or create the instance of `node_id` for `user_id` under the
/// playbook version, and make sure it has a slot for every declared upload.
///
/// A new instance starts `active` when every gating predecessor is `done`
/// for that user, otherwise `locked`.
pub async fn ensure_instance(
    tx: &mut dyn JourneyTx,
    playbook: &Playbook,
    user_id: Uuid,
    node_id: &str,
    locale: Option<&str>,
) -> Result<NodeInstance> {
    let node = playbook.require_node(node_id)?;
    let tenant_id = playbook.tenant_id;

    if let Some(existing) = tx
        .find_instance(tenant_id, user_id, node_id, playbook.version_id)
        .await?
    {
        ensure_slots(tx, &existing, node).await?;
        return Ok(existing);
    }

    let mut gated = false;
    for pred in playbook.gating_predecessors(node_id) {
        if !is_done(tx, playbook, user_id, pred).await? {
            gated = true;
            break;
        }
    }
    let state = if gated {
        NodeState::Locked
    } else {
        NodeState::Active
    };

    let inst = tx
        .insert_instance(NewNodeInstance {
            tenant_id,
            user_id,
            node_id: node_id.to_string(),
            playbook_version_id: playbook.version_id,
            state,
            locale: locale.map(String::from),
        })
        .await?;
    if inst.state.is_unlocked() {
        record_event(
            tx,
            &inst,
            EventType::Opened,
            json!({ "locale": locale }),
            None,
        )
        .await?;
    }
    tx.upsert_journey_state(tenant_id, user_id, node_id, inst.state)
        .await?;
    ensure_slots(tx, &inst, node).await?;

    tracing::debug!(
        tenant_id = %tenant_id,
        user_id = %user_id,
        node_id,
        state = %inst.state,
        "node instance created"
    );
    Ok(inst)
}

/// Instance lookup without creating anything.
pub async fn read_instance(
    tx: &mut dyn JourneyTx,
    playbook: &Playbook,
    user_id: Uuid,
    node_id: &str,
) -> Result<Option<NodeInstance>> {
    tx.find_instance(playbook.tenant_id, user_id, node_id, playbook.version_id)
        .await
}

pub(crate) async fn is_done(
    tx: &mut dyn JourneyTx,
    playbook: &Playbook,
    user_id: Uuid,
    node_id: &str,
) -> Result<bool> {
    Ok(read_instance(tx, playbook, user_id, node_id)
        .await?
        .is_some_and(|i| i.state == NodeState::Done))
}

/// Create missing slots, including ones added by a newer playbook.
async fn ensure_slots(tx: &mut dyn JourneyTx, inst: &NodeInstance, node: &Node) -> Result<Vec<Slot>> {
    let mut slots = Vec::with_capacity(node.uploads().len());
    for up in node.uploads() {
        slots.push(tx.ensure_slot(inst.tenant_id, inst.id, &up.key).await?);
    }
    Ok(slots)
}

pub async fn record_event(
    tx: &mut dyn JourneyTx,
    inst: &NodeInstance,
    event_type: EventType,
    payload: serde_json::Value,
    actor_id: Option<Uuid>,
) -> Result<NodeEvent> {
    tx.append_event(NewNodeEvent {
        tenant_id: inst.tenant_id,
        node_instance_id: inst.id,
        event_type,
        payload,
        actor_id,
    })
    .await
}

/// Fail with `Unprocessable` unless every required slot on the instance has
/// an active attachment.
pub async fn verify_requirements(
    tx: &mut dyn JourneyTx,
    node: &Node,
    inst: &NodeInstance,
) -> Result<()> {
    for req in node.required_slots() {
        let slot = tx.ensure_slot(inst.tenant_id, inst.id, &req.key).await?;
        if tx.active_attachment(inst.tenant_id, slot.id).await?.is_none() {
            return Err(JourneyError::Unprocessable(format!(
                "required file for slot '{}' is missing",
                req.key
            )));
        }
    }
    Ok(())
}

/// Move an instance to `to` on behalf of `actor`.
///
/// The current state is re-read under the row lock, the transition is
/// checked against the registry, and the new state is mirrored into the
/// journey projection with a `state_changed` event. Reaching `done` runs
/// activation in the same transaction.
pub async fn transition_state(
    tx: &mut dyn JourneyTx,
    playbook: &Playbook,
    registry: &TransitionRegistry,
    actor: &Principal,
    instance: &NodeInstance,
    to: NodeState,
) -> Result<Transition> {
    let current = tx
        .find_instance(
            instance.tenant_id,
            instance.user_id,
            &instance.node_id,
            instance.playbook_version_id,
        )
        .await?
        .ok_or_else(|| JourneyError::NotFound(format!("node instance {}", instance.id)))?;
    let from = current.state;
    let is_owner = actor.is_owner_of(current.user_id);

    if !registry.is_allowed(from, to, actor.role, is_owner) {
        return Err(JourneyError::TransitionDenied {
            from,
            to,
            role: actor.role,
        });
    }
    if from == to {
        return Ok(Transition {
            instance: current,
            from,
            changed: false,
            activated: Vec::new(),
        });
    }

    let node = playbook.require_node(&current.node_id)?;
    if to.requires_uploads() {
        verify_requirements(tx, node, &current).await?;
    }

    let updated = tx
        .update_instance_state(current.tenant_id, current.id, to)
        .await?;
    tx.upsert_journey_state(updated.tenant_id, updated.user_id, &updated.node_id, to)
        .await?;
    record_event(
        tx,
        &updated,
        EventType::StateChanged,
        json!({ "from": from, "to": to, "role": actor.role }),
        actor.actor_id(),
    )
    .await?;

    tracing::info!(
        tenant_id = %updated.tenant_id,
        user_id = %updated.user_id,
        node_id = %updated.node_id,
        from = %from,
        to = %to,
        role = %actor.role,
        "node state changed"
    );

    let activated = if to == NodeState::Done {
        activation::activate_next(tx, playbook, &updated).await?
    } else {
        Vec::new()
    };

    Ok(Transition {
        instance: updated,
        from,
        changed: true,
        activated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::PlaybookDocument;
    use crate::principal::Role;
    use crate::store::{JourneyStore, MemoryStore};

    fn playbook(tenant: Uuid) -> Playbook {
        let doc: PlaybookDocument = serde_json::from_value(json!({
            "version": "1",
            "worlds": [{"id": "W1", "nodes": [
                {"id": "a", "type": "form", "next": ["b"]},
                {"id": "b", "type": "confirmTask",
                 "requirements": {"uploads": [{"key": "scan", "required": true}]}}
            ]}]
        }))
        .unwrap();
        Playbook::build(Uuid::new_v4(), tenant, "sum".into(), doc).unwrap()
    }

    #[tokio::test]
    async fn ensure_gates_on_predecessors_and_is_idempotent() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = playbook(tenant);
        let mut tx = store.begin().await.unwrap();

        let a = ensure_instance(tx.as_mut(), &pb, user, "a", Some("en")).await.unwrap();
        assert_eq!(a.state, NodeState::Active);
        let b = ensure_instance(tx.as_mut(), &pb, user, "b", None).await.unwrap();
        assert_eq!(b.state, NodeState::Locked);
        assert_eq!(tx.list_slots(tenant, b.id).await.unwrap().len(), 1);

        let again = ensure_instance(tx.as_mut(), &pb, user, "b", None).await.unwrap();
        assert_eq!(again.id, b.id);
        assert_eq!(tx.list_instances(tenant, user).await.unwrap().len(), 2);

        // Only the unlocked instance gets an `opened` event.
        assert_eq!(tx.list_events(tenant, a.id).await.unwrap().len(), 1);
        assert!(tx.list_events(tenant, b.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let store = MemoryStore::new();
        let pb = playbook(Uuid::new_v4());
        let mut tx = store.begin().await.unwrap();
        let err = ensure_instance(tx.as_mut(), &pb, Uuid::new_v4(), "ghost", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JourneyError::NotFound(_)));
    }

    #[tokio::test]
    async fn transition_records_event_and_projection() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = playbook(tenant);
        let reg = TransitionRegistry::standard();
        let student = Principal::new(tenant, user, Role::Student);
        let mut tx = store.begin().await.unwrap();

        let a = ensure_instance(tx.as_mut(), &pb, user, "a", None).await.unwrap();
        let t = transition_state(tx.as_mut(), &pb, &reg, &student, &a, NodeState::Submitted)
            .await
            .unwrap();
        assert!(t.changed);
        assert_eq!(t.from, NodeState::Active);

        let events = tx.list_events(tenant, a.id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::StateChanged);
        assert_eq!(last.payload["from"], "active");
        assert_eq!(last.payload["to"], "submitted");

        let states = tx.list_journey_states(tenant, user).await.unwrap();
        assert_eq!(states[0].state, NodeState::Submitted);
    }

    #[tokio::test]
    async fn self_transition_is_a_no_op_but_still_checked() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = playbook(tenant);
        let reg = TransitionRegistry::standard();
        let mut tx = store.begin().await.unwrap();
        let a = ensure_instance(tx.as_mut(), &pb, user, "a", None).await.unwrap();
        let before = tx.list_events(tenant, a.id).await.unwrap().len();

        let admin = Principal::new(tenant, Uuid::new_v4(), Role::Admin);
        let t = transition_state(tx.as_mut(), &pb, &reg, &admin, &a, NodeState::Active)
            .await
            .unwrap();
        assert!(!t.changed);
        assert_eq!(tx.list_events(tenant, a.id).await.unwrap().len(), before);

        // A student can never enter `active`, so even s -> s is denied.
        let student = Principal::new(tenant, user, Role::Student);
        let err = transition_state(tx.as_mut(), &pb, &reg, &student, &a, NodeState::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, JourneyError::TransitionDenied { .. }));
    }

    #[tokio::test]
    async fn missing_required_upload_blocks_submission() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = playbook(tenant);
        let reg = TransitionRegistry::standard();
        let root = Principal::new(tenant, Uuid::new_v4(), Role::Superadmin);
        let mut tx = store.begin().await.unwrap();

        let b = ensure_instance(tx.as_mut(), &pb, user, "b", None).await.unwrap();
        let err = transition_state(tx.as_mut(), &pb, &reg, &root, &b, NodeState::Submitted)
            .await
            .unwrap_err();
        assert!(matches!(err, JourneyError::Unprocessable(ref m) if m.contains("'scan'")));
    }

    #[tokio::test]
    async fn done_activates_successor() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let pb = playbook(tenant);
        let reg = TransitionRegistry::standard();
        let root = Principal::new(tenant, Uuid::new_v4(), Role::Superadmin);
        let mut tx = store.begin().await.unwrap();

        let a = ensure_instance(tx.as_mut(), &pb, user, "a", None).await.unwrap();
        let b = ensure_instance(tx.as_mut(), &pb, user, "b", None).await.unwrap();
        assert_eq!(b.state, NodeState::Locked);

        let t = transition_state(tx.as_mut(), &pb, &reg, &root, &a, NodeState::Done)
            .await
            .unwrap();
        assert_eq!(t.activated.len(), 1);
        assert_eq!(t.activated[0].id, b.id);
        assert_eq!(t.activated[0].state, NodeState::Active);
    }
}
