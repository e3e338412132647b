//! Service-account provisioning. The raw bearer token is returned exactly
//! once, in the creation response body — it is never retrievable again.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use teamvault_auth::{generate_service_account_token, Principal};
use teamvault_types::ServiceAccount;
use uuid::Uuid;

use crate::dto::{CreateServiceAccountRequest, ServiceAccountResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateServiceAccountRequest>,
) -> Result<Json<ServiceAccountResponse>, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }
    let project = state
        .repo
        .get_project_by_name(&body.project)
        .await?
        .ok_or(ApiError::NotFound)?;

    let (raw_token, token_hash) = generate_service_account_token()?;
    let now = Utc::now();
    let sa = ServiceAccount {
        id: Uuid::new_v4(),
        name: body.name,
        token_hash,
        project_id: project.id,
        scopes: body.scopes,
        created_by: principal.actor_id(),
        created_at: now,
        expires_at: body.expires_in_secs.map(|secs| now + Duration::seconds(secs)),
    };

    let persisted = state.repo.create_service_account(sa).await?;
    Ok(Json(ServiceAccountResponse::new(persisted, raw_token)))
}
