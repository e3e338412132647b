#![forbid(unsafe_code)]

//! Dynamic credential leases: issuance of mock, envelope-sealed
//! credentials with a TTL, manual revocation, and a background expirer.
//!
//! Follows the same `toka-key-rotation` background-task shape used by
//! `teamvault-rotation`, and `toka-revocation`'s issue/revoke/list
//! contract shape, generalized here to a time-bounded credential lease.

use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use teamvault_crypto::CryptoEngine;
use teamvault_repository::{EnvelopeFields, Repository};
use teamvault_types::errors::{Categorize, ErrorCategory};
use teamvault_types::Lease;
use uuid::Uuid;

/// Minimum TTL accepted after normalization.
pub const MIN_TTL_SECS: i64 = 1;
/// Maximum TTL, 24 hours.
pub const MAX_TTL_SECS: i64 = 86_400;
/// TTL a zero or negative request normalizes to.
pub const DEFAULT_TTL_SECS: i64 = 3_600;
/// How often the background expirer sweeps for due leases.
pub const EXPIRER_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors raised by lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease does not exist, or is already revoked/expired.
    #[error("lease not found")]
    NotFound,
    /// Sealing the mock credential bundle failed.
    #[error("crypto error: {0}")]
    Crypto(String),
    /// The backing store failed.
    #[error("repository error: {0}")]
    Repository(String),
}

impl Categorize for LeaseError {
    fn category(&self) -> ErrorCategory {
        match self {
            LeaseError::NotFound => ErrorCategory::NotFound,
            LeaseError::Crypto(_) | LeaseError::Repository(_) => ErrorCategory::Backend,
        }
    }
}

/// The plaintext credential bundle returned exactly once at issuance time.
/// After this call returns, only the opaque [`Lease`] metadata is
/// observable.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum IssuedCredential {
    /// Mock database credentials.
    Database {
        /// `tv_<8 lowercase hex chars>`.
        username: String,
        /// 32 lowercase hex chars.
        password: String,
        /// Static placeholder host.
        host: String,
        /// Static placeholder port.
        port: u16,
        /// Static placeholder database name.
        database: String,
    },
    /// A generic lease type with no dedicated shape: an opaque random
    /// secret value.
    Generic {
        /// 32 lowercase hex chars.
        value: String,
    },
}

fn random_hex(rng: &mut impl Rng, bytes: usize) -> String {
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

fn generate_credential(lease_type: &str) -> IssuedCredential {
    let mut rng = rand::rngs::OsRng;
    match lease_type {
        "database" => IssuedCredential::Database {
            username: format!("tv_{}", random_hex(&mut rng, 4)),
            password: random_hex(&mut rng, 16),
            host: "localhost".to_string(),
            port: 5432,
            database: "app".to_string(),
        },
        _ => IssuedCredential::Generic { value: random_hex(&mut rng, 16) },
    }
}

/// Clamps a requested TTL: a zero or negative value normalizes to
/// [`DEFAULT_TTL_SECS`]; otherwise it is clamped to
/// `[MIN_TTL_SECS, MAX_TTL_SECS]`.
pub fn normalize_ttl_secs(requested: i64) -> i64 {
    if requested <= 0 {
        DEFAULT_TTL_SECS
    } else {
        requested.clamp(MIN_TTL_SECS, MAX_TTL_SECS)
    }
}

/// Issues, revokes, lists, and expires dynamic credential leases.
pub struct LeaseManager {
    repo: Arc<dyn Repository>,
    crypto: Arc<CryptoEngine>,
}

impl LeaseManager {
    /// Builds a manager over the given collaborators.
    pub fn new(repo: Arc<dyn Repository>, crypto: Arc<CryptoEngine>) -> Self {
        Self { repo, crypto }
    }

    /// Issues a new lease, returning the plaintext credential bundle
    /// alongside the persisted metadata. The plaintext is never retrievable
    /// again after this call returns.
    pub async fn issue(
        &self,
        lease_type: &str,
        requester: &str,
        ttl_secs: i64,
        org_id: Option<Uuid>,
    ) -> Result<(Lease, IssuedCredential), LeaseError> {
        let ttl = normalize_ttl_secs(ttl_secs);
        let credential = generate_credential(lease_type);
        let plaintext = serde_json::to_vec(&credential).expect("credential bundle always serializes");

        let sealed = self.crypto.seal(&plaintext).map_err(|e| LeaseError::Crypto(e.to_string()))?;
        let now = Utc::now();

        let lease = Lease {
            id: Uuid::new_v4(),
            org_id,
            path: format!("lease/{}", lease_type),
            lease_type: lease_type.to_string(),
            wrapped_credential: sealed.ciphertext,
            nonce: sealed.nonce,
            wrapped_dek: sealed.wrapped_dek,
            wrapped_dek_nonce: sealed.wrapped_dek_nonce,
            root_key_generation: sealed.root_key_generation,
            issuer: requester.to_string(),
            issued_at: now,
            expires_at: now + Duration::seconds(ttl),
            revoked_at: None,
        };

        let persisted = self.repo.insert_lease(lease).await.map_err(|e| LeaseError::Repository(e.to_string()))?;
        Ok((persisted, credential))
    }

    /// Revokes a lease. Returns [`LeaseError::NotFound`] if it does not
    /// exist or is already revoked/expired.
    pub async fn revoke(&self, id: Uuid) -> Result<(), LeaseError> {
        let now = Utc::now();
        let revoked = self.repo.revoke_lease(id, now).await.map_err(|e| LeaseError::Repository(e.to_string()))?;
        if revoked {
            Ok(())
        } else {
            Err(LeaseError::NotFound)
        }
    }

    /// Currently active leases.
    pub async fn list_active(&self) -> Result<Vec<Lease>, LeaseError> {
        self.repo.list_active_leases(Utc::now()).await.map_err(|e| LeaseError::Repository(e.to_string()))
    }

    /// Revokes every due-but-not-yet-revoked lease; returns the count
    /// newly revoked.
    pub async fn expire_all_due(&self) -> Result<u64, LeaseError> {
        self.repo.expire_all_due_leases(Utc::now()).await.map_err(|e| LeaseError::Repository(e.to_string()))
    }

    /// Runs [`Self::expire_all_due`] every [`EXPIRER_INTERVAL`] until
    /// `shutdown` fires, logging the count of newly expired leases each
    /// sweep that finds any.
    pub async fn run_expirer_loop(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(EXPIRER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("lease expirer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match self.expire_all_due().await {
                        Ok(count) if count > 0 => tracing::info!(count, "expired due leases"),
                        Ok(_) => {}
                        Err(err) => tracing::error!(%err, "lease expiry sweep failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamvault_crypto::{CryptoEngine, RootKey, RootKeyRing};
    use teamvault_repository::memory::MemoryRepository;

    fn manager() -> LeaseManager {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let crypto = Arc::new(CryptoEngine::new(RootKeyRing::single(RootKey::from_bytes([5u8; 32]))));
        LeaseManager::new(repo, crypto)
    }

    #[test]
    fn zero_or_negative_ttl_normalizes_to_one_hour() {
        assert_eq!(normalize_ttl_secs(0), DEFAULT_TTL_SECS);
        assert_eq!(normalize_ttl_secs(-5), DEFAULT_TTL_SECS);
    }

    #[test]
    fn ttl_clamps_to_bounds() {
        assert_eq!(normalize_ttl_secs(1), 1);
        assert_eq!(normalize_ttl_secs(86_400), 86_400);
        assert_eq!(normalize_ttl_secs(999_999), MAX_TTL_SECS);
    }

    #[tokio::test]
    async fn issue_then_revoke_then_revoke_again_not_found() {
        let mgr = manager();
        let (lease, credential) = mgr.issue("database", "alice", 60, None).await.unwrap();
        match credential {
            IssuedCredential::Database { username, password, .. } => {
                assert!(username.starts_with("tv_"));
                assert_eq!(password.len(), 32);
            }
            _ => panic!("expected database credential"),
        }

        mgr.revoke(lease.id).await.unwrap();
        let err = mgr.revoke(lease.id).await.unwrap_err();
        assert!(matches!(err, LeaseError::NotFound));
    }

    #[tokio::test]
    async fn expired_lease_excluded_from_active_list_after_expire_all_due() {
        let mgr = manager();
        let (lease, _) = mgr.issue("database", "alice", 1, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let active = mgr.list_active().await.unwrap();
        assert!(active.iter().all(|l| l.id != lease.id));

        let expired_count = mgr.expire_all_due().await.unwrap();
        assert_eq!(expired_count, 1);

        let err = mgr.revoke(lease.id).await.unwrap_err();
        assert!(matches!(err, LeaseError::NotFound));
    }
}
