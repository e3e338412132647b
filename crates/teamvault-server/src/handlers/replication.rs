//! Peer-to-peer replication surface: push accepts a batch pulled from
//! another node, pull serves this node's own log, status reports where
//! this node's vector clock currently stands.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use teamvault_auth::Principal;
use teamvault_types::Action;

use crate::dto::{ReplicationPullRequest, ReplicationPullResponse, ReplicationPushRequest, ReplicationPushResponse, ReplicationStatusResponse};
use crate::error::ApiError;
use crate::pipeline;
use crate::state::AppState;

pub async fn push(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ReplicationPushRequest>,
) -> Result<Json<ReplicationPushResponse>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Write)?;
    pipeline::authorize(state.repo.as_ref(), &principal, Action::Write, "replication", None, Default::default()).await?;

    let applied = state.replication.apply_batch(body.entries).await;
    Ok(Json(ReplicationPushResponse { applied }))
}

pub async fn pull(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<ReplicationPullRequest>,
) -> Result<Json<ReplicationPullResponse>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Read)?;
    pipeline::authorize(state.repo.as_ref(), &principal, Action::Read, "replication", None, Default::default()).await?;

    let (entries, has_more) = state.replication.pull(params.after_id, params.limit).await?;
    Ok(Json(ReplicationPullResponse { entries, has_more }))
}

pub async fn status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<ReplicationStatusResponse>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Read)?;
    pipeline::authorize(state.repo.as_ref(), &principal, Action::Read, "replication", None, Default::default()).await?;

    Ok(Json(ReplicationStatusResponse {
        node_id: state.replication.node_id().to_string(),
        clock: state.replication.current_clock().await,
    }))
}
