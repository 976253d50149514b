//! Role-gated transition table for node instances.
//!
//! This table is the only place that decides whether a state change is
//! legal. Adding a role means adding a row here.

use crate::principal::Role;
use crate::state::NodeState;

/// Who may take a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Any caller with this role.
    Role(Role),
    /// A student acting on their own node.
    Owner,
}

#[derive(Debug, Clone)]
pub struct TransitionRule {
    pub from: NodeState,
    pub to: NodeState,
    pub grants: Vec<Grant>,
}

impl TransitionRule {
    fn permits(&self, role: Role, is_owner: bool) -> bool {
        self.grants.iter().any(|g| match g {
            Grant::Role(r) => *r == role,
            Grant::Owner => role == Role::Student && is_owner,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRegistry {
    rules: Vec<TransitionRule>,
    /// Role allowed to move any state to any state.
    override_role: Option<Role>,
}

impl Default for TransitionRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransitionRegistry {
    pub fn standard() -> Self {
        use Grant::{Owner, Role as R};
        use NodeState::*;

        let rule = |from, to, grants: &[Grant]| TransitionRule {
            from,
            to,
            grants: grants.to_vec(),
        };

        Self {
            rules: vec![
                rule(Locked, Active, &[R(Role::Admin), R(Role::System)]),
                rule(Active, Submitted, &[Owner, R(Role::Admin)]),
                rule(Submitted, Waiting, &[R(Role::Admin), R(Role::Advisor)]),
                rule(Submitted, Done, &[R(Role::Admin), R(Role::Advisor)]),
                rule(Submitted, NeedsFixes, &[R(Role::Admin), R(Role::Advisor)]),
                rule(NeedsFixes, Submitted, &[Owner]),
                rule(Waiting, Submitted, &[Owner]),
            ],
            override_role: Some(Role::Superadmin),
        }
    }

    pub fn rules(&self) -> &[TransitionRule] {
        &self.rules
    }

    /// Whether `role` may move an instance from `from` to `to`.
    ///
    /// For `from == to` the question becomes whether the role could have
    /// entered `to` at all. Unknown pairs are denied.
    pub fn is_allowed(&self, from: NodeState, to: NodeState, role: Role, is_owner: bool) -> bool {
        if self.override_role == Some(role) {
            return true;
        }
        if from == to {
            return self.can_enter(to, role, is_owner);
        }
        self.rules
            .iter()
            .any(|r| r.from == from && r.to == to && r.permits(role, is_owner))
    }

    fn can_enter(&self, to: NodeState, role: Role, is_owner: bool) -> bool {
        self.rules
            .iter()
            .any(|r| r.to == to && r.permits(role, is_owner))
    }

    /// Target states reachable from `from` for this caller.
    pub fn targets_from(&self, from: NodeState, role: Role, is_owner: bool) -> Vec<NodeState> {
        if self.override_role == Some(role) {
            return NodeState::ALL.into_iter().filter(|s| *s != from).collect();
        }
        self.rules
            .iter()
            .filter(|r| r.from == from && r.permits(role, is_owner))
            .map(|r| r.to)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeState::*;

    fn reg() -> TransitionRegistry {
        TransitionRegistry::standard()
    }

    #[test]
    fn owner_submits_active_node() {
        assert!(reg().is_allowed(Active, Submitted, Role::Student, true));
        assert!(!reg().is_allowed(Active, Submitted, Role::Student, false));
    }

    #[test]
    fn advisor_cannot_submit_for_student() {
        assert!(!reg().is_allowed(Active, Submitted, Role::Advisor, false));
    }

    #[test]
    fn reviewers_close_submitted_nodes() {
        for role in [Role::Admin, Role::Advisor] {
            assert!(reg().is_allowed(Submitted, Done, role, false));
            assert!(reg().is_allowed(Submitted, NeedsFixes, role, false));
            assert!(reg().is_allowed(Submitted, Waiting, role, false));
        }
    }

    #[test]
    fn student_cannot_complete_directly() {
        assert!(!reg().is_allowed(Active, Done, Role::Student, true));
        assert!(!reg().is_allowed(Submitted, Done, Role::Student, true));
    }

    #[test]
    fn resubmission_paths_are_owner_only() {
        assert!(reg().is_allowed(NeedsFixes, Submitted, Role::Student, true));
        assert!(reg().is_allowed(Waiting, Submitted, Role::Student, true));
        assert!(!reg().is_allowed(NeedsFixes, Submitted, Role::Admin, false));
    }

    #[test]
    fn unlock_is_admin_or_system() {
        assert!(reg().is_allowed(Locked, Active, Role::System, false));
        assert!(reg().is_allowed(Locked, Active, Role::Admin, false));
        assert!(!reg().is_allowed(Locked, Active, Role::Student, true));
    }

    #[test]
    fn superadmin_moves_anything() {
        for from in NodeState::ALL {
            for to in NodeState::ALL {
                assert!(reg().is_allowed(from, to, Role::Superadmin, false));
            }
        }
    }

    #[test]
    fn unknown_pair_is_denied() {
        assert!(!reg().is_allowed(Done, Locked, Role::Admin, false));
        assert!(!reg().is_allowed(Locked, Done, Role::Advisor, false));
    }

    #[test]
    fn self_transition_requires_entry_right() {
        assert!(reg().is_allowed(Submitted, Submitted, Role::Student, true));
        assert!(!reg().is_allowed(Submitted, Submitted, Role::Advisor, false));
        assert!(reg().is_allowed(Done, Done, Role::Advisor, false));
        assert!(!reg().is_allowed(Done, Done, Role::Student, true));
    }

    #[test]
    fn targets_from_submitted_for_advisor() {
        let mut t = reg().targets_from(Submitted, Role::Advisor, false);
        t.sort_by_key(|s| s.as_str());
        assert_eq!(t, vec![Done, NeedsFixes, Waiting]);
    }
}
