//! Environment-sourced configuration.
//!
//! Every value is read once at startup; nothing here is reloaded at
//! runtime. A bad `MASTER_KEY` is the one failure mode that must stop the
//! process before it ever binds a listener — an engine built over a
//! truncated or malformed root key would silently corrupt every seal/open
//! call from then on.

use anyhow::{bail, Context, Result};
use std::time::Duration;

/// The optional OIDC federation settings. Present only if all four
/// variables are set; partial configuration is treated as absent.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Process-wide configuration, read from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub listen_addr: String,
    pub master_key: [u8; 32],
    pub oidc: Option<OidcConfig>,
}

impl Config {
    /// Reads every recognized environment variable, failing fast on a
    /// missing required value or a `MASTER_KEY` that is not exactly 32
    /// bytes once hex-decoded.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET is required")?;
        let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| ":8443".to_string());
        let master_key = load_master_key()?;
        let oidc = load_oidc_config();

        Ok(Self {
            database_url,
            jwt_secret,
            listen_addr,
            master_key,
            oidc,
        })
    }

    /// `LISTEN_ADDR` normalized to a bindable socket address: a bare
    /// `:<port>` form (matching the spec's illustrative default) binds
    /// every interface.
    pub fn bind_addr(&self) -> String {
        match self.listen_addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_addr.clone(),
        }
    }
}

fn load_master_key() -> Result<[u8; 32]> {
    let hex_str = if let Ok(path) = std::env::var("MASTER_KEY_FILE") {
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read MASTER_KEY_FILE at {path}"))?
            .trim()
            .to_string()
    } else if let Ok(inline) = std::env::var("MASTER_KEY") {
        inline.trim().to_string()
    } else {
        bail!("one of MASTER_KEY or MASTER_KEY_FILE is required");
    };

    let bytes = hex::decode(&hex_str).context("MASTER_KEY must be hex-encoded")?;
    if bytes.len() != 32 {
        bail!("MASTER_KEY must decode to exactly 32 bytes, got {}", bytes.len());
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn load_oidc_config() -> Option<OidcConfig> {
    Some(OidcConfig {
        issuer: std::env::var("OIDC_ISSUER").ok()?,
        client_id: std::env::var("OIDC_CLIENT_ID").ok()?,
        client_secret: std::env::var("OIDC_CLIENT_SECRET").ok()?,
        redirect_uri: std::env::var("OIDC_REDIRECT_URI").ok()?,
    })
}

/// JWT validity window for minted user tokens.
pub const JWT_TTL: chrono::Duration = chrono::Duration::hours(12);
/// Per-IP refill rate for the request-pipeline rate limiter.
pub const RATE_LIMIT_REFILL_PER_SEC: f64 = 5.0;
/// Per-IP burst capacity for the request-pipeline rate limiter.
pub const RATE_LIMIT_BURST: u64 = 20;
/// Maximum accepted request body size (spec's 1 MiB validation cap).
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
/// HTTP server read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);
/// HTTP server write timeout.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// HTTP server idle-connection timeout.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget allotted to in-flight requests during graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
