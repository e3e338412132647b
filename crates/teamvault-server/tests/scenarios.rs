//! End-to-end scenarios driven through the router itself via
//! `tower::ServiceExt::oneshot`, against an in-memory repository. Each
//! test builds its own `AppState` so chained audit hashes and vector
//! clocks never leak between scenarios.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use teamvault_audit::{AuditLogger, MemorySink};
use teamvault_auth::{hash_password, JwtCodec};
use teamvault_crypto::{CryptoEngine, RootKey, RootKeyRing};
use teamvault_lease::LeaseManager;
use teamvault_ratelimit::RateLimiter;
use teamvault_replication::ReplicationLog;
use teamvault_repository::memory::MemoryRepository;
use teamvault_repository::Repository;
use teamvault_rotation::{ConnectorRegistry, RotationScheduler};
use teamvault_server::state::AppState;
use teamvault_types::{
    Effect, IamPolicy, IamPolicyType, Policy, RotationSchedule, ScheduleStatus, SubjectType,
};
use teamvault_webhooks::WebhookManager;
use uuid::Uuid;

fn test_state() -> (AppState, Arc<MemorySink>) {
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let crypto = Arc::new(CryptoEngine::new(RootKeyRing::single(RootKey::from_bytes([7u8; 32]))));
    let jwt = Arc::new(JwtCodec::new(b"scenario-test-secret".to_vec(), Duration::hours(1)));
    let sink = Arc::new(MemorySink::new());
    let audit = Arc::new(AuditLogger::spawn(sink.clone(), String::new()));
    let rate_limiter = Arc::new(RateLimiter::new(1000.0, 1000));
    let leases = Arc::new(LeaseManager::new(repo.clone(), crypto.clone()));
    let webhooks = Arc::new(WebhookManager::new(repo.clone(), crypto.clone()));
    let replication = Arc::new(ReplicationLog::new(repo.clone(), "test-node"));

    let state = AppState {
        repo,
        crypto,
        jwt,
        audit,
        audit_query: sink.clone(),
        rate_limiter,
        leases,
        webhooks,
        replication,
    };
    (state, sink)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

async fn register_and_login(state: &AppState, email: &str, role: &str) -> String {
    let password_hash = hash_password("correct horse battery staple").unwrap();
    let user = state.repo.create_user(email, &password_hash, role).await.unwrap();
    state.jwt.mint(user.id, email, role).unwrap()
}

fn test_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4242)
}

/// `oneshot` never runs the `into_make_service_with_connect_info` wrapper
/// that normally inserts this extension per-connection, so every request
/// built for these in-process tests has to carry it by hand.
fn with_connect_info(mut req: Request<Body>) -> Request<Body> {
    req.extensions_mut().insert(ConnectInfo(test_addr()));
    req
}

fn request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    with_connect_info(
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
}

fn get_request(uri: &str, token: &str) -> Request<Body> {
    with_connect_info(
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
}

#[tokio::test]
async fn create_and_read_secret_round_trips_at_version_one() {
    let (state, _sink) = test_state();
    state.repo.create_project("p1", None, None, "alice").await.unwrap();
    let token = register_and_login(&state, "alice@example.com", "admin").await;
    let app = teamvault_server::build_router(state);

    let put_resp = app
        .clone()
        .oneshot(request("PUT", "/api/v1/secrets/p1/db/url", &token, json!({"value": "postgres://localhost"})))
        .await
        .unwrap();
    assert_eq!(put_resp.status(), StatusCode::OK);
    let put_body = body_json(put_resp).await;
    assert_eq!(put_body["version"], 1);

    let get_resp = app
        .clone()
        .oneshot(get_request("/api/v1/secrets/p1/db/url", &token))
        .await
        .unwrap();
    assert_eq!(get_resp.status(), StatusCode::OK);
    let get_body = body_json(get_resp).await;
    assert_eq!(get_body["value"], "postgres://localhost");
    assert_eq!(get_body["version"], 1);
}

#[tokio::test]
async fn second_write_bumps_version_and_both_versions_are_listed() {
    let (state, _sink) = test_state();
    state.repo.create_project("p1", None, None, "alice").await.unwrap();
    let token = register_and_login(&state, "alice@example.com", "admin").await;
    let app = teamvault_server::build_router(state);

    let first = app
        .clone()
        .oneshot(request("PUT", "/api/v1/secrets/p1/db/url", &token, json!({"value": "v1"})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(request("PUT", "/api/v1/secrets/p1/db/url", &token, json!({"value": "v2"})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;
    assert_eq!(second_body["version"], 2);

    let versions_resp = app
        .clone()
        .oneshot(get_request("/api/v1/secret-versions/p1/db/url", &token))
        .await
        .unwrap();
    assert_eq!(versions_resp.status(), StatusCode::OK);
    let versions = body_json(versions_resp).await;
    assert_eq!(versions.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn legacy_deny_policy_blocks_write_and_audit_records_denial() {
    let (state, sink) = test_state();
    state.repo.create_project("p1", None, None, "alice").await.unwrap();
    let member_token = register_and_login(&state, "bob@example.com", "member").await;

    state
        .repo
        .create_legacy_policy(Policy {
            id: Uuid::new_v4(),
            name: "deny-all-writes".to_string(),
            effect: Effect::Deny,
            actions: vec!["write".to_string()],
            resource_pattern: "p1/**".to_string(),
            subject_type: SubjectType::Any,
            subject_id: None,
            conditions: vec![],
        })
        .await
        .unwrap();

    let app = teamvault_server::build_router(state);
    let resp = app
        .oneshot(request("PUT", "/api/v1/secrets/p1/db/url", &member_token, json!({"value": "should-be-blocked"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let events = sink.events().await;
    let denied = events.iter().find(|e| e.action == "secret.write").expect("a denial was logged");
    assert_eq!(format!("{:?}", denied.outcome), "Denied");
}

#[tokio::test]
async fn iam_pbac_deny_blocks_service_account_read_and_audit_records_denial() {
    let (state, sink) = test_state();
    let org_id = Uuid::new_v4();
    state.repo.create_project("p1", None, Some(org_id), "alice").await.unwrap();
    let admin_token = register_and_login(&state, "alice@example.com", "admin").await;

    let document = json!({
        "subject": {"type": "service_account"},
        "rule": {
            "effect": "deny",
            "path": "p1/**",
            "capabilities": ["read"]
        }
    });
    state
        .repo
        .create_iam_policy(IamPolicy {
            id: Uuid::new_v4(),
            org_id,
            name: "deny-p1-reads".to_string(),
            policy_type: IamPolicyType::Pbac,
            document,
            hcl_source: None,
        })
        .await
        .unwrap();

    let app = teamvault_server::build_router(state);

    let put_resp = app
        .clone()
        .oneshot(request(
            "PUT",
            "/api/v1/secrets/p1/db/url",
            &admin_token,
            json!({"value": "postgres://u:p@h/d"}),
        ))
        .await
        .unwrap();
    assert_eq!(put_resp.status(), StatusCode::OK);

    let sa_resp = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/v1/service-accounts",
            &admin_token,
            json!({"project": "p1", "name": "ci-reader", "scopes": ["read"]}),
        ))
        .await
        .unwrap();
    assert_eq!(sa_resp.status(), StatusCode::OK);
    let sa_token = body_json(sa_resp).await["token"].as_str().unwrap().to_string();

    let get_resp = app
        .clone()
        .oneshot(get_request("/api/v1/secrets/p1/db/url", &sa_token))
        .await
        .unwrap();
    assert_eq!(get_resp.status(), StatusCode::FORBIDDEN);

    let denied = sink
        .events()
        .await
        .into_iter()
        .find(|e| e.action == "secret.read" && e.actor_type == "service_account")
        .expect("a denial was logged for the service account read");
    assert_eq!(format!("{:?}", denied.outcome), "Denied");
}

#[tokio::test]
async fn webhook_org_scoped_iam_policy_allows_dispatch() {
    let (state, _sink) = test_state();
    let org_id = Uuid::new_v4();
    let token = register_and_login(&state, "carol@example.com", "member").await;

    let document = json!({
        "subject": {"type": "user"},
        "rule": {
            "effect": "allow",
            "path": "webhooks",
            "capabilities": ["write"]
        }
    });
    state
        .repo
        .create_iam_policy(IamPolicy {
            id: Uuid::new_v4(),
            org_id,
            name: "webhook-writers".to_string(),
            policy_type: IamPolicyType::Rbac,
            document,
            hcl_source: None,
        })
        .await
        .unwrap();

    let app = teamvault_server::build_router(state);
    let resp = app
        .oneshot(request(
            "POST",
            &format!("/api/v1/orgs/{org_id}/webhooks"),
            &token,
            json!({"url": "https://example.com/hook", "events": ["secret.write"]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert!(body["secret"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn audit_chain_tamper_is_detected() {
    let (state, sink) = test_state();
    state.repo.create_project("p1", None, None, "alice").await.unwrap();
    let token = register_and_login(&state, "alice@example.com", "admin").await;
    let app = teamvault_server::build_router(state);

    app.oneshot(request("PUT", "/api/v1/secrets/p1/db/url", &token, json!({"value": "v1"})))
        .await
        .unwrap();

    let mut events = sink.events().await;
    assert!(teamvault_audit::verify_chain(&events).is_ok());

    events[0].resource = "tampered".to_string();
    assert!(teamvault_audit::verify_chain(&events).is_err());
}

#[tokio::test]
async fn scheduled_rotation_creates_a_new_version_as_system_rotation() {
    let (state, _sink) = test_state();
    state.repo.create_project("p1", None, None, "alice").await.unwrap();
    let token = register_and_login(&state, "alice@example.com", "admin").await;

    let repo = state.repo.clone();
    let crypto = state.crypto.clone();
    let app = teamvault_server::build_router(state);

    app.clone()
        .oneshot(request("PUT", "/api/v1/secrets/p1/db/credential", &token, json!({"value": "initial"})))
        .await
        .unwrap();

    let secret = repo.get_secret(repo.get_project_by_name("p1").await.unwrap().unwrap().id, "db/credential").await.unwrap().unwrap();

    repo.create_rotation_schedule(RotationSchedule {
        id: Uuid::new_v4(),
        secret_id: secret.id,
        schedule_expr: "@every 1s".to_string(),
        connector_type: "random_password".to_string(),
        connector_config: json!({"length": 16}),
        last_rotated_at: None,
        next_rotation_at: Utc::now() - Duration::seconds(1),
        status: ScheduleStatus::Active,
        last_error: None,
    })
    .await
    .unwrap();

    let registry = Arc::new(ConnectorRegistry::new());
    let scheduler = RotationScheduler::new(repo.clone(), crypto, registry);
    let (rotated, failed) = scheduler.run_due_rotations(Utc::now()).await;
    assert_eq!(rotated, 1);
    assert_eq!(failed, 0);

    let latest = repo.get_latest_version(secret.id).await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.created_by, "system:rotation");
}

#[tokio::test]
async fn lease_lifecycle_issue_expire_then_revoke_not_found() {
    let (state, _sink) = test_state();
    let leases = state.leases.clone();

    let (lease, _credential) = leases.issue("database", "alice", 1, None).await.unwrap();

    let active = leases.list_active().await.unwrap();
    assert!(active.iter().any(|l| l.id == lease.id));

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let active = leases.list_active().await.unwrap();
    assert!(!active.iter().any(|l| l.id == lease.id));

    let expired = leases.expire_all_due().await.unwrap();
    assert_eq!(expired, 1);

    let err = leases.revoke(lease.id).await.unwrap_err();
    assert!(matches!(err, teamvault_lease::LeaseError::NotFound));
}

#[tokio::test]
async fn rate_limited_requests_get_429_with_retry_after() {
    let (state, _sink) = test_state();
    state.repo.create_project("p1", None, None, "alice").await.unwrap();
    let token = register_and_login(&state, "alice@example.com", "admin").await;

    // Build a state-local copy with a tiny bucket so this test doesn't
    // depend on the generous default used by every other scenario here.
    let mut tight_state = state.clone();
    tight_state.rate_limiter = Arc::new(RateLimiter::new(0.0, 1));
    let app = teamvault_server::build_router(tight_state);

    let first = app
        .clone()
        .oneshot(request("PUT", "/api/v1/secrets/p1/db/url", &token, json!({"value": "v1"})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(request("PUT", "/api/v1/secrets/p1/db/url", &token, json!({"value": "v2"})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
}
