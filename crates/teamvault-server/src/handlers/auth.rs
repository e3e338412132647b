use axum::extract::State;
use axum::{Extension, Json};
use teamvault_auth::{hash_password, verify_password, AuthError, Principal};

use crate::dto::{LoginRequest, MeResponse, RegisterRequest, TokenResponse, UserResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    if body.email.is_empty() || body.password.is_empty() {
        return Err(ApiError::Validation("email and password are required".to_string()));
    }
    let password_hash = hash_password(&body.password)?;
    let user = state.repo.create_user(&body.email, &password_hash, &body.role).await?;
    Ok(Json(UserResponse {
        id: user.id,
        email: user.email,
        role: user.role,
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state
        .repo
        .get_user_by_email(&body.email)
        .await?
        .ok_or(AuthError::InvalidToken)?;
    if !verify_password(&body.password, &user.password_hash) {
        return Err(AuthError::InvalidToken.into());
    }
    let token = state.jwt.mint(user.id, &user.email, &user.role)?;
    Ok(Json(TokenResponse { token }))
}

pub async fn me(Extension(principal): Extension<Principal>) -> Json<MeResponse> {
    Json(MeResponse {
        actor_type: principal.actor_type().to_string(),
        actor_id: principal.actor_id(),
    })
}
