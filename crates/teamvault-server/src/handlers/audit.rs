//! Read-only access to the tamper-evident audit log.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use teamvault_audit::{AuditEvent, AuditQueryFilter};
use teamvault_auth::Principal;
use teamvault_types::Action;

use crate::dto::AuditQueryParams;
use crate::error::ApiError;
use crate::pipeline;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

pub async fn query(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Read)?;
    pipeline::authorize(state.repo.as_ref(), &principal, Action::Read, "audit", None, Default::default()).await?;

    let limit = if params.limit <= 0 {
        DEFAULT_LIMIT
    } else {
        params.limit.min(MAX_LIMIT)
    };

    let filter = AuditQueryFilter {
        actor_type: params.actor_type,
        actor_id: params.actor_id,
        action: params.action,
        resource: params.resource,
        limit,
        offset: params.offset.max(0),
    };

    let events = state.audit_query.query(filter).await?;
    Ok(Json(events))
}
