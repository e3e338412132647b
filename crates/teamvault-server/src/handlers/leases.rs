//! Dynamic credential leases: issuance returns the plaintext credential
//! bundle exactly once; every other view of a lease is metadata only.

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::collections::HashMap;
use std::net::SocketAddr;
use teamvault_auth::Principal;
use teamvault_types::{Action, Outcome};
use uuid::Uuid;

use crate::dto::{IssueLeaseRequest, LeaseResponse};
use crate::error::ApiError;
use crate::pipeline;
use crate::state::AppState;

pub async fn issue_database(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<IssueLeaseRequest>,
) -> Result<Json<LeaseResponse>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Write)?;

    let resource = "lease/database";
    let ip = Some(addr.ip().to_string());

    if let Err(err) = pipeline::authorize(state.repo.as_ref(), &principal, Action::Write, resource, body.org_id, HashMap::new()).await {
        pipeline::record_audit(&state.audit, &principal, "lease.issue", resource, Outcome::Denied, ip, serde_json::json!({})).await;
        return Err(err);
    }

    let (lease, credential) = state
        .leases
        .issue("database", &principal.actor_id(), body.ttl_secs.unwrap_or(0), body.org_id)
        .await?;

    pipeline::record_audit(
        &state.audit,
        &principal,
        "lease.issue",
        resource,
        Outcome::Success,
        ip,
        serde_json::json!({ "lease_id": lease.id }),
    )
    .await;

    Ok(Json(LeaseResponse::new(lease, credential)))
}

pub async fn revoke(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    pipeline::enforce_scope(&principal, Action::Delete)?;

    let resource = format!("lease/{id}");
    let ip = Some(addr.ip().to_string());

    if let Err(err) = pipeline::authorize(state.repo.as_ref(), &principal, Action::Delete, &resource, None, HashMap::new()).await {
        pipeline::record_audit(&state.audit, &principal, "lease.revoke", &resource, Outcome::Denied, ip, serde_json::json!({})).await;
        return Err(err);
    }

    state.leases.revoke(id).await?;
    pipeline::record_audit(&state.audit, &principal, "lease.revoke", &resource, Outcome::Success, ip, serde_json::json!({})).await;

    Ok(StatusCode::NO_CONTENT)
}
