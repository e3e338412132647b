//! The policy-check-then-audit-log shape shared by every handler that acts
//! on a secured resource: evaluate access, then record the outcome
//! regardless of which way the decision went. Audit failures are absorbed
//! here — logged, never surfaced to the caller — matching the contract the
//! rest of the pipeline (crypto, repository) does not get to opt out of.

use std::collections::HashMap;

use teamvault_audit::{AuditLogger, AuditRecord};
use teamvault_auth::Principal;
use teamvault_policy::{evaluate, Decision, PolicyRequest};
use teamvault_repository::Repository;
use teamvault_types::{Action, Outcome, SubjectType};
use uuid::Uuid;

use crate::error::ApiError;

/// Service-account-only scope enforcement (spec §4.6): a service account
/// must carry the `"*"` scope or the exact action's scope. User principals
/// always pass — their access is governed entirely by the policy engine.
pub fn enforce_scope(principal: &Principal, action: Action) -> Result<(), ApiError> {
    if principal.has_scope_for(action) {
        Ok(())
    } else {
        Err(ApiError::forbidden("service account token lacks required scope"))
    }
}

/// `(subject_type, subject_id, is_admin)` for a principal, as the policy
/// engine and audit log need it.
pub fn principal_identity(principal: &Principal) -> (SubjectType, String, bool) {
    match principal {
        Principal::User { user_id, role, .. } => {
            (SubjectType::User, user_id.to_string(), role == "admin")
        }
        Principal::ServiceAccount { sa_id, .. } => (SubjectType::ServiceAccount, sa_id.to_string(), false),
    }
}

/// Evaluates `action` on `resource` for `principal`, returning
/// [`ApiError::Forbidden`] on denial.
pub async fn authorize(
    repo: &dyn Repository,
    principal: &Principal,
    action: Action,
    resource: &str,
    org_id: Option<Uuid>,
    attributes: HashMap<String, String>,
) -> Result<(), ApiError> {
    let (subject_type, subject_id, is_admin) = principal_identity(principal);
    let request = PolicyRequest {
        subject_type,
        subject_id,
        action,
        resource: resource.to_string(),
        is_admin,
        org_id,
        attributes,
    };
    match evaluate(repo, &request).await? {
        Decision::Allowed(_) => Ok(()),
        Decision::Denied(reason) => Err(ApiError::forbidden(reason)),
    }
}

/// Logs an audit event, swallowing any sink failure after logging it —
/// the caller's operation has already happened (or been denied) and must
/// not be rolled back because the audit write itself failed.
pub async fn record_audit(
    audit: &AuditLogger,
    principal: &Principal,
    action: &str,
    resource: &str,
    outcome: Outcome,
    ip: Option<String>,
    metadata: serde_json::Value,
) {
    let record = AuditRecord {
        actor_type: principal.actor_type().to_string(),
        actor_id: principal.actor_id(),
        action: action.to_string(),
        resource: resource.to_string(),
        outcome,
        ip,
        metadata,
    };
    if let Err(err) = audit.log(record).await {
        tracing::error!(%err, "failed to append audit event");
    }
}
