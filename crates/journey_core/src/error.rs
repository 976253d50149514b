use thiserror::Error;

use crate::principal::Role;
use crate::state::NodeState;

pub type Result<T, E = JourneyError> = std::result::Result<T, E>;

/// Coarse error codes handed to the web layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    PayloadTooLarge,
    Unprocessable,
    Internal,
}

#[derive(Debug, Error)]
pub enum JourneyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("payload too large: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: i64, max: i64 },

    #[error("invalid playbook: {0}")]
    InvalidPlaybook(String),

    #[error("playbook conflict: {0}")]
    PlaybookConflict(String),

    #[error("transition denied: {role} cannot move {from} -> {to}")]
    TransitionDenied {
        from: NodeState,
        to: NodeState,
        role: Role,
    },

    #[error("review denied: {0}")]
    ReviewDenied(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("missing tenant")]
    MissingTenant,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The request is well-formed but cannot be applied to the node as it
    /// stands, e.g. a required slot has no active attachment.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl JourneyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidInput(_)
            | Self::InvalidPlaybook(_)
            | Self::MissingTenant
            | Self::Cancelled => ErrorCode::BadRequest,
            Self::Unprocessable(_) => ErrorCode::Unprocessable,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::TransitionDenied { .. } | Self::ReviewDenied(_) | Self::Forbidden(_) => {
                ErrorCode::Forbidden
            }
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) | Self::PlaybookConflict(_) => ErrorCode::Conflict,
            Self::StorageUnavailable(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Cancelled => 499,
            Self::StorageUnavailable(_) => 503,
            _ => match self.code() {
                ErrorCode::BadRequest => 400,
                ErrorCode::Unauthorized => 401,
                ErrorCode::Forbidden => 403,
                ErrorCode::NotFound => 404,
                ErrorCode::Conflict => 409,
                ErrorCode::PayloadTooLarge => 413,
                ErrorCode::Unprocessable => 422,
                ErrorCode::Internal => 500,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Message safe to show to an end user. Internal causes stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── http_status ───────────────────────────────────────────────

    #[test]
    fn http_status_invalid_input() {
        assert_eq!(JourneyError::InvalidInput("x".into()).http_status(), 400);
    }

    #[test]
    fn http_status_unprocessable() {
        assert_eq!(JourneyError::Unprocessable("x".into()).http_status(), 422);
    }

    #[test]
    fn http_status_payload_too_large() {
        let err = JourneyError::PayloadTooLarge { size: 10, max: 5 };
        assert_eq!(err.http_status(), 413);
    }

    #[test]
    fn http_status_transition_denied() {
        let err = JourneyError::TransitionDenied {
            from: NodeState::Active,
            to: NodeState::Done,
            role: Role::Student,
        };
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[test]
    fn http_status_review_denied_is_forbidden() {
        assert_eq!(JourneyError::ReviewDenied("x".into()).http_status(), 403);
    }

    #[test]
    fn http_status_conflict() {
        assert_eq!(JourneyError::Conflict("x".into()).http_status(), 409);
    }

    #[test]
    fn http_status_storage_unavailable() {
        assert_eq!(
            JourneyError::StorageUnavailable("x".into()).http_status(),
            503
        );
    }

    #[test]
    fn http_status_internal() {
        let err = JourneyError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(err.http_status(), 500);
    }

    // ── Display / public message ──────────────────────────────────

    #[test]
    fn display_transition_denied() {
        let err = JourneyError::TransitionDenied {
            from: NodeState::Submitted,
            to: NodeState::Done,
            role: Role::Student,
        };
        assert_eq!(
            err.to_string(),
            "transition denied: student cannot move submitted -> done"
        );
    }

    #[test]
    fn internal_is_not_surfaced() {
        let err = JourneyError::Internal(anyhow::anyhow!("connection reset by peer"));
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn only_conflict_is_retryable() {
        assert!(JourneyError::Conflict("serialization".into()).is_retryable());
        assert!(!JourneyError::InvalidInput("x".into()).is_retryable());
    }
}
