#![forbid(unsafe_code)]

//! Library surface for **teamvault-server**: the axum router and every
//! module it is built from. `main.rs` is a thin binary wrapper around
//! [`build_router`]; integration tests exercise the router directly
//! in-process, without binding a socket.

pub mod auth_middleware;
pub mod config;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod state;

use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full HTTP router: the public auth endpoints, every
/// bearer-token-protected route behind [`auth_middleware::authenticate`],
/// and the tracing/request-id/timeout/body-limit layers wrapping both.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/auth/me", get(handlers::auth::me))
        .route(
            "/api/v1/secrets/:project/*path",
            put(handlers::secrets::put_secret)
                .get(handlers::secrets::get_secret)
                .delete(handlers::secrets::delete_secret),
        )
        .route("/api/v1/secrets/:project", get(handlers::secrets::list_secrets))
        .route("/api/v1/secret-versions/:project/*path", get(handlers::secrets::list_secret_versions))
        .route("/api/v1/service-accounts", post(handlers::service_accounts::create))
        .route("/api/v1/lease/database", post(handlers::leases::issue_database))
        .route("/api/v1/lease/:id/revoke", post(handlers::leases::revoke))
        .route("/api/v1/audit", get(handlers::audit::query))
        .route("/api/v1/replication/push", post(handlers::replication::push))
        .route("/api/v1/replication/pull", get(handlers::replication::pull))
        .route("/api/v1/replication/status", get(handlers::replication::status))
        .route("/api/v1/orgs/:org_id/webhooks", post(handlers::webhooks::create))
        .route("/api/v1/orgs/:org_id/webhooks/dispatch", post(handlers::webhooks::dispatch))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware::authenticate));

    let public = Router::new()
        .route("/api/v1/auth/register", post(handlers::auth::register))
        .route("/api/v1/auth/login", post(handlers::auth::login));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(config::READ_TIMEOUT))
                .layer(tower_http::limit::RequestBodyLimitLayer::new(config::MAX_BODY_BYTES)),
        )
}
