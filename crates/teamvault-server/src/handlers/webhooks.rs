//! Org-scoped webhook subscriptions: the one part of the HTTP surface that
//! carries an explicit `org_id`, so it is also the one route group where
//! the IAM policy pass (as opposed to the legacy, org-less pass) actually
//! engages end to end.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use teamvault_auth::Principal;
use teamvault_types::Action;
use uuid::Uuid;

use crate::dto::{CreateWebhookRequest, DispatchWebhookEventRequest, DispatchWebhookEventResponse, WebhookResponse};
use crate::error::ApiError;
use crate::pipeline;
use crate::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<CreateWebhookRequest>,
) -> Result<Json<WebhookResponse>, ApiError> {
    if body.url.is_empty() {
        return Err(ApiError::Validation("url is required".to_string()));
    }
    pipeline::enforce_scope(&principal, Action::Write)?;
    pipeline::authorize(state.repo.as_ref(), &principal, Action::Write, "webhooks", Some(org_id), Default::default()).await?;

    let (webhook, secret) = state.webhooks.create(org_id, &body.url, body.events).await?;
    Ok(Json(WebhookResponse::new(webhook, secret)))
}

pub async fn dispatch(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(org_id): Path<Uuid>,
    Json(body): Json<DispatchWebhookEventRequest>,
) -> Result<Json<DispatchWebhookEventResponse>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Write)?;
    pipeline::authorize(state.repo.as_ref(), &principal, Action::Write, "webhooks", Some(org_id), Default::default()).await?;

    let delivered = state.webhooks.dispatch_event(org_id, &body.event, &body.payload).await?;
    Ok(Json(DispatchWebhookEventResponse { delivered }))
}
