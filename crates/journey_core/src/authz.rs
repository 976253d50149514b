//! Access to a student's journey and review authority.
//!
//! State changes are decided by the transition registry alone; this module
//! only answers "may this caller look at / review this student's work".

use uuid::Uuid;

use crate::error::{JourneyError, Result};
use crate::principal::{Principal, Role};
use crate::store::JourneyTx;

/// Owner, admin-level roles, the engine itself, and advisors assigned to
/// the student may access the student's nodes.
pub async fn authorize_subject(
    tx: &mut dyn JourneyTx,
    actor: &Principal,
    student_id: Uuid,
) -> Result<()> {
    if actor.is_owner_of(student_id) || actor.role.is_admin_level() || actor.role == Role::System {
        return Ok(());
    }
    if actor.role == Role::Advisor
        && tx
            .is_assigned_advisor(actor.tenant_id, student_id, actor.user_id)
            .await?
    {
        return Ok(());
    }
    Err(JourneyError::Forbidden(format!(
        "{} may not access the journey of {student_id}",
        actor.user_id
    )))
}

/// Writes to form data and uploads: the owner or an admin-level role.
pub fn authorize_author(actor: &Principal, student_id: Uuid) -> Result<()> {
    if actor.is_owner_of(student_id) || actor.role.is_admin_level() {
        Ok(())
    } else {
        Err(JourneyError::Forbidden(format!(
            "{} may not edit submissions of {student_id}",
            actor.user_id
        )))
    }
}

/// Admin-level reviewers always pass; advisors pass only for students they
/// are assigned to.
pub async fn authorize_review(
    tx: &mut dyn JourneyTx,
    actor: &Principal,
    student_id: Uuid,
) -> Result<()> {
    match actor.role {
        r if r.is_admin_level() => Ok(()),
        Role::Advisor => {
            if tx
                .is_assigned_advisor(actor.tenant_id, student_id, actor.user_id)
                .await?
            {
                Ok(())
            } else {
                Err(JourneyError::ReviewDenied(format!(
                    "advisor {} is not assigned to student {student_id}",
                    actor.user_id
                )))
            }
        }
        other => Err(JourneyError::ReviewDenied(format!(
            "role {other} cannot review attachments"
        ))),
    }
}
