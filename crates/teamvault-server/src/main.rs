#![forbid(unsafe_code)]

//! **teamvault-server** — HTTP entry point wiring together envelope
//! encryption, hash-chained audit logging, composite RBAC/ABAC/PBAC policy
//! evaluation, dynamic credential leases, scheduled secret rotation,
//! webhook fan-out, and causally-ordered replication behind a single axum
//! router.
//!
//! ## Usage
//!
//! ```bash
//! teamvault-server --node-id node-1
//! ```
//!
//! Configuration is read entirely from the environment (see
//! [`teamvault_server::config::Config`]); `--node-id` and `--log-level` are
//! the only CLI knobs, since everything else is either secret material or
//! deployment topology that belongs in the environment, not argv.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use teamvault_audit::AuditLogger;
use teamvault_auth::JwtCodec;
use teamvault_crypto::{CryptoEngine, RootKey, RootKeyRing};
use teamvault_lease::LeaseManager;
use teamvault_ratelimit::RateLimiter;
use teamvault_replication::ReplicationLog;
use teamvault_repository::pg::{PgAuditSink, PgRepository};
use teamvault_rotation::{ConnectorRegistry, RotationScheduler};
use teamvault_webhooks::WebhookManager;

use teamvault_server::config::{self, Config};
use teamvault_server::state::AppState;

#[derive(Parser)]
#[command(name = "teamvault-server")]
#[command(about = "TeamVault secrets-management server")]
#[command(version)]
struct Cli {
    /// This node's identifier in the replication mesh.
    #[arg(long, env = "NODE_ID", default_value = "node-1")]
    node_id: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("starting teamvault-server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("failed to load configuration")?;

    let repo = Arc::new(
        PgRepository::connect(&config.database_url)
            .await
            .context("failed to connect to database")?,
    );
    repo.migrate().await.context("failed to run migrations")?;

    let ring = RootKeyRing::single(RootKey::from_bytes(config.master_key));
    let crypto = Arc::new(CryptoEngine::new(ring));

    let jwt = Arc::new(JwtCodec::new(config.jwt_secret.into_bytes(), config::JWT_TTL));

    let audit_sink = Arc::new(PgAuditSink::new(repo.pool().clone()));
    let initial_hash = audit_sink.last_hash().await.context("failed to read audit chain tip")?;
    let audit = Arc::new(AuditLogger::spawn(audit_sink.clone(), initial_hash));

    let rate_limiter = Arc::new(RateLimiter::new(config::RATE_LIMIT_REFILL_PER_SEC, config::RATE_LIMIT_BURST));
    let leases = Arc::new(LeaseManager::new(repo.clone(), crypto.clone()));
    let webhooks = Arc::new(WebhookManager::new(repo.clone(), crypto.clone()));
    let replication = Arc::new(ReplicationLog::new(repo.clone(), cli.node_id.clone()));

    let app_state = AppState {
        repo: repo.clone(),
        crypto: crypto.clone(),
        jwt,
        audit,
        audit_query: audit_sink,
        rate_limiter: rate_limiter.clone(),
        leases: leases.clone(),
        webhooks,
        replication,
    };

    let registry = Arc::new(ConnectorRegistry::new());
    let rotation = Arc::new(RotationScheduler::new(repo.clone(), crypto, registry));

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();
    background.push(tokio::spawn(rotation.run_loop(shutdown.clone())));
    background.push(tokio::spawn(leases.run_expirer_loop(shutdown.clone())));
    background.push(tokio::spawn(rate_limiter.run_sweep_loop(shutdown.clone())));

    let app = teamvault_server::build_router(app_state);
    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid LISTEN_ADDR: {}", config.bind_addr()))?;
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                warn!(%err, "http server exited with error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    let drain = tokio::time::timeout(config::SHUTDOWN_TIMEOUT, futures::future::join_all(background));
    if drain.await.is_err() {
        warn!("background tasks did not drain within the shutdown budget");
    }

    info!("teamvault-server stopped");
    Ok(())
}

fn init_logging(log_level: &str) {
    let filter = format!("teamvault_server={log_level},teamvault_audit={log_level},teamvault_policy={log_level}");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
