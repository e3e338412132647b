#![forbid(unsafe_code)]

//! HMAC-signed webhook delivery with bounded retries.
//!
//! Grounded on the HMAC construction in `stripe_integration.rs`'s
//! `verify_webhook_signature` (`Hmac<Sha256>` over a signed payload,
//! hex-encoded, string-compared), inverted here for outbound signing: this
//! node computes the signature and the subscriber's endpoint is expected to
//! do the verification this module also exposes as a pure function.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use teamvault_crypto::CryptoEngine;
use teamvault_repository::Repository;
use teamvault_types::errors::{Categorize, ErrorCategory};
use teamvault_types::Webhook;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Per-attempt client timeout.
pub const ATTEMPT_TIMEOUT: StdDuration = StdDuration::from_secs(10);
/// Maximum delivery attempts per event per webhook.
pub const MAX_ATTEMPTS: usize = 3;
/// Delay before each retry, indexed by retry number (attempt 2's delay is
/// `RETRY_BACKOFF[0]`, attempt 3's is `RETRY_BACKOFF[1]`). The trailing
/// entry is kept for a 4th attempt should `MAX_ATTEMPTS` ever grow.
pub const RETRY_BACKOFF: [StdDuration; 3] =
    [StdDuration::from_secs(1), StdDuration::from_secs(2), StdDuration::from_secs(4)];

/// Errors raised by webhook operations.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Sealing or unsealing the shared secret failed.
    #[error("crypto error: {0}")]
    Crypto(String),
    /// The backing store failed.
    #[error("repository error: {0}")]
    Repository(String),
    /// Every delivery attempt failed.
    #[error("delivery failed after {0} attempts: {1}")]
    DeliveryFailed(usize, String),
}

impl Categorize for WebhookError {
    fn category(&self) -> ErrorCategory {
        match self {
            WebhookError::DeliveryFailed(..) => ErrorCategory::Unavailable,
            WebhookError::Crypto(_) | WebhookError::Repository(_) => ErrorCategory::Backend,
        }
    }
}

/// Computes the hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex-encoded HMAC-SHA256 signature of `body` under `secret`.
/// Any single bit flip in `body` or `signature` yields `false`.
pub fn verify_webhook_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    compute_signature(secret, body) == signature
}

fn random_secret() -> Vec<u8> {
    let mut rng = rand::rngs::OsRng;
    (0..32).map(|_| rng.gen::<u8>()).collect()
}

/// Creates, unseals, and dispatches deliveries for webhook subscriptions.
pub struct WebhookManager {
    repo: Arc<dyn Repository>,
    crypto: Arc<CryptoEngine>,
    http: reqwest::Client,
}

impl WebhookManager {
    /// Builds a manager over the given collaborators, with an HTTP client
    /// whose default per-request timeout is [`ATTEMPT_TIMEOUT`].
    pub fn new(repo: Arc<dyn Repository>, crypto: Arc<CryptoEngine>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .expect("reqwest client builds with static configuration");
        Self { repo, crypto, http }
    }

    /// Registers a webhook subscription, returning the plaintext HMAC
    /// secret exactly once alongside the persisted metadata.
    pub async fn create(
        &self,
        org_id: Uuid,
        url: &str,
        subscribed_events: Vec<String>,
    ) -> Result<(Webhook, String), WebhookError> {
        let secret = random_secret();
        let sealed = self.crypto.seal(&secret).map_err(|e| WebhookError::Crypto(e.to_string()))?;

        let webhook = Webhook {
            id: Uuid::new_v4(),
            org_id,
            url: url.to_string(),
            wrapped_secret: sealed.ciphertext,
            nonce: sealed.nonce,
            wrapped_dek: sealed.wrapped_dek,
            wrapped_dek_nonce: sealed.wrapped_dek_nonce,
            root_key_generation: sealed.root_key_generation,
            subscribed_events,
            active: true,
        };

        let persisted = self.repo.create_webhook(webhook).await.map_err(|e| WebhookError::Repository(e.to_string()))?;
        Ok((persisted, hex::encode(&secret)))
    }

    /// Fans `event` with `payload` out to every active webhook in `org_id`
    /// subscribed to it. Each delivery is attempted independently; a
    /// failure on one webhook does not affect the others. Returns the
    /// number of webhooks that accepted the delivery.
    pub async fn dispatch_event(&self, org_id: Uuid, event: &str, payload: &serde_json::Value) -> Result<usize, WebhookError> {
        let webhooks = self
            .repo
            .list_active_webhooks_for_org(org_id, event)
            .await
            .map_err(|e| WebhookError::Repository(e.to_string()))?;

        let body = serde_json::to_vec(payload).expect("event payload always serializes");
        let mut delivered = 0;
        for webhook in webhooks {
            match self.deliver(&webhook, &body).await {
                Ok(()) => delivered += 1,
                Err(err) => tracing::warn!(webhook_id = %webhook.id, %err, "webhook delivery exhausted retries"),
            }
        }
        Ok(delivered)
    }

    /// Delivers one payload to one webhook, retrying with [`RETRY_BACKOFF`]
    /// up to [`MAX_ATTEMPTS`] times.
    async fn deliver(&self, webhook: &Webhook, body: &[u8]) -> Result<(), WebhookError> {
        let secret_bytes = self
            .crypto
            .open(&teamvault_crypto::SealedValue {
                ciphertext: webhook.wrapped_secret.clone(),
                nonce: webhook.nonce.clone(),
                wrapped_dek: webhook.wrapped_dek.clone(),
                wrapped_dek_nonce: webhook.wrapped_dek_nonce.clone(),
                root_key_generation: webhook.root_key_generation,
            })
            .map_err(|e| WebhookError::Crypto(e.to_string()))?;
        let signature = compute_signature(&secret_bytes, body);

        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF[attempt - 1]).await;
            }

            let result = self
                .http
                .post(&webhook.url)
                .header("X-TeamVault-Signature", &signature)
                .header("Content-Type", "application/json")
                .body(body.to_vec())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_error = format!("status {}", response.status()),
                Err(err) => last_error = err.to_string(),
            }
        }

        Err(WebhookError::DeliveryFailed(MAX_ATTEMPTS, last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = b"shared-secret";
        let body = b"{\"event\":\"secret.rotated\"}";
        let signature = compute_signature(secret, body);
        assert!(verify_webhook_signature(secret, body, &signature));
    }

    #[test]
    fn single_bit_flip_in_body_fails_verification() {
        let secret = b"shared-secret";
        let body = b"{\"event\":\"secret.rotated\"}".to_vec();
        let signature = compute_signature(secret, &body);

        let mut flipped = body.clone();
        flipped[0] ^= 0x01;
        assert!(!verify_webhook_signature(secret, &flipped, &signature));
    }

    #[test]
    fn single_char_flip_in_signature_fails_verification() {
        let secret = b"shared-secret";
        let body = b"{\"event\":\"secret.rotated\"}";
        let mut signature = compute_signature(secret, body);
        let last = signature.pop().unwrap();
        let replacement = if last == '0' { '1' } else { '0' };
        signature.push(replacement);
        assert!(!verify_webhook_signature(secret, body, &signature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = b"payload";
        let signature = compute_signature(b"secret-a", body);
        assert!(!verify_webhook_signature(b"secret-b", body, &signature));
    }
}
