//! Secret CRUD: the policy-check-then-audit pipeline wraps every handler,
//! and every mutation also appends a replication entry once the write
//! commits — reads never touch the replication log.

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::collections::HashMap;
use std::net::SocketAddr;
use teamvault_auth::Principal;
use teamvault_crypto::SealedValue;
use teamvault_repository::EnvelopeFields;
use teamvault_types::{Action, Outcome, ReplicationOp, SecretType};

use crate::dto::{PutSecretRequest, SecretMetadataResponse, SecretValueResponse, SecretVersionResponse};
use crate::error::ApiError;
use crate::pipeline;
use crate::state::AppState;

async fn resolve_project(state: &AppState, project: &str) -> Result<teamvault_types::Project, ApiError> {
    state.repo.get_project_by_name(project).await?.ok_or(ApiError::NotFound)
}

pub async fn put_secret(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((project, path)): Path<(String, String)>,
    Json(body): Json<PutSecretRequest>,
) -> Result<(StatusCode, Json<SecretValueResponse>), ApiError> {
    if body.value.is_empty() {
        return Err(ApiError::Validation("value must not be empty".to_string()));
    }
    pipeline::enforce_scope(&principal, Action::Write)?;

    let resource = format!("{project}/{path}");
    let ip = Some(addr.ip().to_string());
    let project_row = resolve_project(&state, &project).await?;

    if let Err(err) = pipeline::authorize(state.repo.as_ref(), &principal, Action::Write, &resource, project_row.org_id, HashMap::new()).await {
        pipeline::record_audit(&state.audit, &principal, "secret.write", &resource, Outcome::Denied, ip, serde_json::json!({})).await;
        return Err(err);
    }

    let sealed = state.crypto.seal(body.value.as_bytes())?;
    let envelope = EnvelopeFields {
        ciphertext: sealed.ciphertext,
        nonce: sealed.nonce,
        wrapped_dek: sealed.wrapped_dek,
        wrapped_dek_nonce: sealed.wrapped_dek_nonce,
        root_key_generation: sealed.root_key_generation,
    };
    let secret_type = body.secret_type.unwrap_or(SecretType::Kv);

    let (secret, version) = state
        .repo
        .put_secret_version(project_row.id, &path, secret_type, envelope, &principal.actor_id())
        .await?;

    pipeline::record_audit(
        &state.audit,
        &principal,
        "secret.write",
        &resource,
        Outcome::Success,
        ip,
        serde_json::json!({ "version": version.version }),
    )
    .await;

    let op = if version.version == 1 { ReplicationOp::Insert } else { ReplicationOp::Update };
    if let Err(err) = state
        .replication
        .append(
            op,
            "secret_versions",
            &version.id.to_string(),
            serde_json::json!({ "secret_id": secret.id, "project": project, "path": path, "version": version.version }),
        )
        .await
    {
        tracing::error!(%err, "failed to append replication entry for secret write");
    }

    Ok((
        StatusCode::OK,
        Json(SecretValueResponse { project, path, version: version.version, value: body.value }),
    ))
}

pub async fn get_secret(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((project, path)): Path<(String, String)>,
) -> Result<Json<SecretValueResponse>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Read)?;

    let resource = format!("{project}/{path}");
    let ip = Some(addr.ip().to_string());
    let project_row = resolve_project(&state, &project).await?;

    if let Err(err) = pipeline::authorize(state.repo.as_ref(), &principal, Action::Read, &resource, project_row.org_id, HashMap::new()).await {
        pipeline::record_audit(&state.audit, &principal, "secret.read", &resource, Outcome::Denied, ip, serde_json::json!({})).await;
        return Err(err);
    }

    let secret = state.repo.get_secret(project_row.id, &path).await?.ok_or(ApiError::NotFound)?;
    let version = state.repo.get_latest_version(secret.id).await?.ok_or(ApiError::NotFound)?;
    let sealed = SealedValue {
        ciphertext: version.ciphertext.clone(),
        nonce: version.nonce.clone(),
        wrapped_dek: version.wrapped_dek.clone(),
        wrapped_dek_nonce: version.wrapped_dek_nonce.clone(),
        root_key_generation: version.root_key_generation,
    };
    let plaintext = state.crypto.open(&sealed)?;
    let value = String::from_utf8(plaintext).map_err(|_| ApiError::Validation("stored value is not valid utf-8".to_string()))?;

    pipeline::record_audit(
        &state.audit,
        &principal,
        "secret.read",
        &resource,
        Outcome::Success,
        ip,
        serde_json::json!({ "version": version.version }),
    )
    .await;

    Ok(Json(SecretValueResponse { project, path, version: version.version, value }))
}

pub async fn list_secrets(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(project): Path<String>,
) -> Result<Json<Vec<SecretMetadataResponse>>, ApiError> {
    pipeline::enforce_scope(&principal, Action::List)?;

    let resource = format!("{project}/*");
    let ip = Some(addr.ip().to_string());
    let project_row = resolve_project(&state, &project).await?;

    if let Err(err) = pipeline::authorize(state.repo.as_ref(), &principal, Action::List, &resource, project_row.org_id, HashMap::new()).await {
        pipeline::record_audit(&state.audit, &principal, "secret.list", &resource, Outcome::Denied, ip, serde_json::json!({})).await;
        return Err(err);
    }

    let secrets = state.repo.list_secrets(project_row.id).await?;
    pipeline::record_audit(&state.audit, &principal, "secret.list", &resource, Outcome::Success, ip, serde_json::json!({})).await;

    Ok(Json(secrets.into_iter().map(SecretMetadataResponse::from).collect()))
}

pub async fn delete_secret(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((project, path)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    pipeline::enforce_scope(&principal, Action::Delete)?;

    let resource = format!("{project}/{path}");
    let ip = Some(addr.ip().to_string());
    let project_row = resolve_project(&state, &project).await?;

    if let Err(err) = pipeline::authorize(state.repo.as_ref(), &principal, Action::Delete, &resource, project_row.org_id, HashMap::new()).await {
        pipeline::record_audit(&state.audit, &principal, "secret.delete", &resource, Outcome::Denied, ip, serde_json::json!({})).await;
        return Err(err);
    }

    let secret = state.repo.get_secret(project_row.id, &path).await?.ok_or(ApiError::NotFound)?;
    state.repo.soft_delete_secret(project_row.id, &path).await?;

    pipeline::record_audit(&state.audit, &principal, "secret.delete", &resource, Outcome::Success, ip, serde_json::json!({})).await;

    if let Err(err) = state
        .replication
        .append(ReplicationOp::Delete, "secrets", &secret.id.to_string(), serde_json::json!({ "project": project, "path": path }))
        .await
    {
        tracing::error!(%err, "failed to append replication entry for secret delete");
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_secret_versions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((project, path)): Path<(String, String)>,
) -> Result<Json<Vec<SecretVersionResponse>>, ApiError> {
    pipeline::enforce_scope(&principal, Action::Read)?;

    let resource = format!("{project}/{path}");
    let ip = Some(addr.ip().to_string());
    let project_row = resolve_project(&state, &project).await?;

    if let Err(err) = pipeline::authorize(state.repo.as_ref(), &principal, Action::Read, &resource, project_row.org_id, HashMap::new()).await {
        pipeline::record_audit(&state.audit, &principal, "secret.versions.list", &resource, Outcome::Denied, ip, serde_json::json!({})).await;
        return Err(err);
    }

    let secret = state.repo.get_secret(project_row.id, &path).await?.ok_or(ApiError::NotFound)?;
    let versions = state.repo.list_versions(secret.id).await?;

    pipeline::record_audit(&state.audit, &principal, "secret.versions.list", &resource, Outcome::Success, ip, serde_json::json!({})).await;

    Ok(Json(
        versions
            .into_iter()
            .map(|v| SecretVersionResponse { version: v.version, created_by: v.created_by, created_at: v.created_at })
            .collect(),
    ))
}
