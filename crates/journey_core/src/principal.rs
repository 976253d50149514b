//! Caller identity.
//!
//! A `Principal` is built once at the boundary from whatever the
//! collaborator's auth middleware has already verified. Core logic never
//! reads raw tokens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JourneyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Advisor,
    Admin,
    Superadmin,
    /// The engine itself, e.g. when activation unlocks a successor node.
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Advisor => "advisor",
            Self::Admin => "admin",
            Self::Superadmin => "superadmin",
            Self::System => "system",
        }
    }

    /// Admin-level roles bypass advisor assignment checks.
    pub fn is_admin_level(&self) -> bool {
        matches!(self, Self::Admin | Self::Superadmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Self::Student),
            "advisor" => Ok(Self::Advisor),
            "admin" => Ok(Self::Admin),
            "superadmin" => Ok(Self::Superadmin),
            "system" => Ok(Self::System),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Immutable `(tenant, user, role)` triple for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn new(tenant_id: Uuid, user_id: Uuid, role: Role) -> Self {
        Self {
            tenant_id,
            user_id,
            role,
        }
    }

    /// Construct from claims the auth middleware already validated.
    ///
    /// A missing tenant is a precondition failure (`MissingTenant`), not an
    /// authorization failure.
    pub fn from_claims(claims: &AuthClaims) -> Result<Self, JourneyError> {
        let tenant = claims
            .tenant_id
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(JourneyError::MissingTenant)?;
        let tenant_id = Uuid::parse_str(tenant.trim())
            .map_err(|_| JourneyError::InvalidInput(format!("malformed tenant id: {tenant}")))?;

        let sub = claims
            .sub
            .as_deref()
            .ok_or_else(|| JourneyError::Unauthorized("missing sub claim".into()))?;
        let user_id = Uuid::parse_str(sub.trim())
            .map_err(|_| JourneyError::Unauthorized(format!("malformed subject: {sub}")))?;

        let role = claims
            .role
            .as_deref()
            .ok_or_else(|| JourneyError::Unauthorized("missing role claim".into()))?
            .parse::<Role>()
            .map_err(|e| JourneyError::Unauthorized(e.to_string()))?;

        Ok(Self::new(tenant_id, user_id, role))
    }

    /// Engine-internal identity used for side effects such as activation.
    pub fn system(tenant_id: Uuid) -> Self {
        Self::new(tenant_id, Uuid::nil(), Role::System)
    }

    pub fn is_owner_of(&self, student_id: Uuid) -> bool {
        self.user_id == student_id
    }

    pub fn require_admin(&self) -> Result<(), JourneyError> {
        if self.role.is_admin_level() {
            Ok(())
        } else {
            Err(JourneyError::Forbidden(format!(
                "{} is not an admin",
                self.user_id
            )))
        }
    }

    /// Actor id recorded on events and rows. The system identity records none.
    pub fn actor_id(&self) -> Option<Uuid> {
        match self.role {
            Role::System => None,
            _ => Some(self.user_id),
        }
    }
}

/// Claims shape expected from the authenticator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthClaims {
    pub sub: Option<String>,
    pub tenant_id: Option<String>,
    pub role: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(tenant: Option<&str>, sub: Option<&str>, role: Option<&str>) -> AuthClaims {
        AuthClaims {
            sub: sub.map(String::from),
            tenant_id: tenant.map(String::from),
            role: role.map(String::from),
        }
    }

    #[test]
    fn from_claims_happy_path() {
        let t = Uuid::new_v4();
        let u = Uuid::new_v4();
        let p = Principal::from_claims(&claims(
            Some(&t.to_string()),
            Some(&u.to_string()),
            Some("Advisor"),
        ))
        .unwrap();
        assert_eq!(p.tenant_id, t);
        assert_eq!(p.user_id, u);
        assert_eq!(p.role, Role::Advisor);
    }

    #[test]
    fn missing_tenant_is_precondition_failure() {
        let u = Uuid::new_v4().to_string();
        let err = Principal::from_claims(&claims(None, Some(&u), Some("student"))).unwrap_err();
        assert!(matches!(err, JourneyError::MissingTenant));

        let err =
            Principal::from_claims(&claims(Some("  "), Some(&u), Some("student"))).unwrap_err();
        assert!(matches!(err, JourneyError::MissingTenant));
    }

    #[test]
    fn missing_subject_is_unauthorized() {
        let t = Uuid::new_v4().to_string();
        let err = Principal::from_claims(&claims(Some(&t), None, Some("student"))).unwrap_err();
        assert!(matches!(err, JourneyError::Unauthorized(_)));
    }

    #[test]
    fn unknown_role_is_unauthorized() {
        let t = Uuid::new_v4().to_string();
        let u = Uuid::new_v4().to_string();
        let err = Principal::from_claims(&claims(Some(&t), Some(&u), Some("janitor"))).unwrap_err();
        assert!(matches!(err, JourneyError::Unauthorized(_)));
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            Role::Student,
            Role::Advisor,
            Role::Admin,
            Role::Superadmin,
            Role::System,
        ] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn require_admin() {
        let t = Uuid::new_v4();
        assert!(Principal::new(t, Uuid::new_v4(), Role::Admin)
            .require_admin()
            .is_ok());
        assert!(Principal::new(t, Uuid::new_v4(), Role::Superadmin)
            .require_admin()
            .is_ok());
        let err = Principal::new(t, Uuid::new_v4(), Role::Advisor)
            .require_admin()
            .unwrap_err();
        assert!(matches!(err, JourneyError::Forbidden(_)));
    }

    #[test]
    fn system_principal_has_no_actor() {
        let p = Principal::system(Uuid::new_v4());
        assert_eq!(p.role, Role::System);
        assert!(p.actor_id().is_none());
    }
}
