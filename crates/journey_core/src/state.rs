//! Node, attachment and event vocabularies.
//!
//! ```text
//!   locked ──► active ──► submitted ──► done
//!                            │  ▲
//!                            ▼  │
//!                   waiting / needs_fixes
//! ```
//!
//! Legal moves and who may make them live in [`crate::transitions`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateParseError {
    #[error("unknown node state: {0}")]
    UnknownNodeState(String),
    #[error("unknown attachment status: {0}")]
    UnknownAttachmentStatus(String),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Locked,
    Active,
    Submitted,
    Waiting,
    NeedsFixes,
    Done,
}

impl NodeState {
    pub const ALL: [NodeState; 6] = [
        Self::Locked,
        Self::Active,
        Self::Submitted,
        Self::Waiting,
        Self::NeedsFixes,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Active => "active",
            Self::Submitted => "submitted",
            Self::Waiting => "waiting",
            Self::NeedsFixes => "needs_fixes",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// True once the node has been opened to the student.
    pub fn is_unlocked(&self) -> bool {
        !matches!(self, Self::Locked)
    }

    /// States where the required uploads must all be present.
    pub fn requires_uploads(&self) -> bool {
        matches!(self, Self::Submitted | Self::Done)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "locked" => Ok(Self::Locked),
            "active" => Ok(Self::Active),
            "submitted" => Ok(Self::Submitted),
            "waiting" => Ok(Self::Waiting),
            "needs_fixes" => Ok(Self::NeedsFixes),
            "done" => Ok(Self::Done),
            other => Err(StateParseError::UnknownNodeState(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// AttachmentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Submitted,
    Approved,
    ApprovedWithComments,
    Rejected,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::ApprovedWithComments => "approved_with_comments",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_approving(&self) -> bool {
        matches!(self, Self::Approved | Self::ApprovedWithComments)
    }
}

impl fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentStatus {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "approved" => Ok(Self::Approved),
            "approved_with_comments" => Ok(Self::ApprovedWithComments),
            "rejected" => Ok(Self::Rejected),
            other => Err(StateParseError::UnknownAttachmentStatus(other.to_string())),
        }
    }
}

/// Decision a reviewer may record. `Submitted` is not a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ApprovedWithComments,
    Rejected,
}

impl ReviewDecision {
    pub fn status(&self) -> AttachmentStatus {
        match self {
            Self::Approved => AttachmentStatus::Approved,
            Self::ApprovedWithComments => AttachmentStatus::ApprovedWithComments,
            Self::Rejected => AttachmentStatus::Rejected,
        }
    }

    pub fn is_approving(&self) -> bool {
        self.status().is_approving()
    }
}

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Opened,
    Submitted,
    Returned,
    Approved,
    Rejected,
    StateChanged,
    DraftSaved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Submitted => "submitted",
            Self::Returned => "returned",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::StateChanged => "state_changed",
            Self::DraftSaved => "draft_saved",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opened" => Ok(Self::Opened),
            "submitted" => Ok(Self::Submitted),
            "returned" => Ok(Self::Returned),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "state_changed" => Ok(Self::StateChanged),
            "draft_saved" => Ok(Self::DraftSaved),
            other => Err(StateParseError::UnknownEventType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_state_round_trip() {
        for s in NodeState::ALL {
            assert_eq!(s.as_str().parse::<NodeState>().unwrap(), s);
        }
        assert!("archived".parse::<NodeState>().is_err());
    }

    #[test]
    fn node_state_serde_is_snake_case() {
        let json = serde_json::to_string(&NodeState::NeedsFixes).unwrap();
        assert_eq!(json, "\"needs_fixes\"");
    }

    #[test]
    fn only_done_is_terminal() {
        let terminal: Vec<_> = NodeState::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&NodeState::Done]);
    }

    #[test]
    fn approving_statuses() {
        assert!(AttachmentStatus::Approved.is_approving());
        assert!(AttachmentStatus::ApprovedWithComments.is_approving());
        assert!(!AttachmentStatus::Rejected.is_approving());
        assert!(!AttachmentStatus::Submitted.is_approving());
    }

    #[test]
    fn decision_maps_to_status() {
        assert_eq!(
            ReviewDecision::ApprovedWithComments.status(),
            AttachmentStatus::ApprovedWithComments
        );
        assert!(!ReviewDecision::Rejected.is_approving());
    }

    #[test]
    fn event_type_parse() {
        assert_eq!(
            "state_changed".parse::<EventType>().unwrap(),
            EventType::StateChanged
        );
        assert_eq!(
            "bogus".parse::<EventType>().unwrap_err(),
            StateParseError::UnknownEventType("bogus".into())
        );
    }
}
