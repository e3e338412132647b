#![forbid(unsafe_code)]

//! Recurring rotation dispatcher, schedule-expression parsing, and the
//! built-in connector registry.
//!
//! Follows `toka-key-rotation`'s manager shape: a `tokio::time::interval`
//! background task with `MissedTickBehavior::Skip`, here extended with a
//! `tokio_util::sync::CancellationToken` arm in the same `select!`. The
//! connector registry favors tagged variants over a generic store: known
//! connectors are inline enum arms, and custom ones go through a boxed
//! trait object held in a side table.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use teamvault_crypto::CryptoEngine;
use teamvault_repository::{EnvelopeFields, Repository};
use teamvault_types::errors::{Categorize, ErrorCategory};
use teamvault_types::RotationSchedule;
use uuid::Uuid;

/// The actor name recorded as `created_by` on versions written by rotation.
pub const ROTATION_ACTOR: &str = "system:rotation";
/// How often the scheduler looks for due rotations.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// Fallback interval for an unparseable schedule expression.
pub const DEFAULT_INTERVAL: Duration = Duration::hours(24);

/// Errors raised while rotating a schedule.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// No connector is registered under the schedule's `connector_type`.
    #[error("unknown connector type {0}")]
    UnknownConnector(String),
    /// The connector itself failed to produce a new value.
    #[error("connector failed: {0}")]
    ConnectorFailed(String),
    /// Sealing the new value failed.
    #[error("crypto error: {0}")]
    Crypto(String),
    /// Persisting the new version or schedule state failed.
    #[error("repository error: {0}")]
    Repository(String),
}

impl Categorize for RotationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Backend
    }
}

/// Produces a fresh plaintext value for a rotation.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Generates the next plaintext value from `config`.
    async fn rotate(&self, config: &serde_json::Value) -> Result<Vec<u8>, RotationError>;
}

/// Alphabet toggles and explicit overrides for [`RandomPasswordConnector`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RandomPasswordConfig {
    /// Desired length, clamped to `[1, 256]`. Defaults to 32.
    pub length: Option<u32>,
    /// Include lowercase letters. Defaults to `true`.
    pub lower: bool,
    /// Include uppercase letters. Defaults to `true`.
    pub upper: bool,
    /// Include digits. Defaults to `true`.
    pub digits: bool,
    /// Include a small set of special characters. Defaults to `false`.
    pub special: bool,
    /// An explicit charset; overrides every toggle above when present.
    pub charset: Option<String>,
}

impl Default for RandomPasswordConfig {
    fn default() -> Self {
        Self {
            length: None,
            lower: true,
            upper: true,
            digits: true,
            special: false,
            charset: None,
        }
    }
}

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const SPECIAL: &str = "!@#$%^&*()-_=+";

/// The built-in `random_password` connector: a CSPRNG-sampled string over a
/// configurable alphabet.
pub struct RandomPasswordConnector;

#[async_trait]
impl Connector for RandomPasswordConnector {
    async fn rotate(&self, config: &serde_json::Value) -> Result<Vec<u8>, RotationError> {
        let cfg: RandomPasswordConfig = serde_json::from_value(config.clone()).unwrap_or_default();
        let length = cfg.length.unwrap_or(32).clamp(1, 256) as usize;

        let alphabet = if let Some(charset) = &cfg.charset {
            charset.clone()
        } else {
            let mut s = String::new();
            if cfg.lower {
                s.push_str(LOWER);
            }
            if cfg.upper {
                s.push_str(UPPER);
            }
            if cfg.digits {
                s.push_str(DIGITS);
            }
            if cfg.special {
                s.push_str(SPECIAL);
            }
            if s.is_empty() {
                s.push_str(LOWER);
                s.push_str(DIGITS);
            }
            s
        };
        let alphabet: Vec<char> = alphabet.chars().collect();

        let mut rng = rand::rngs::OsRng;
        let password: String = (0..length)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect();
        Ok(password.into_bytes())
    }
}

/// A process-wide registry of connectors, dispatched by `connector_type`.
///
/// Known connectors are inline enum arms (hot path, no indirection);
/// user-registered extensions go through a boxed trait object. Write-once
/// at startup, read-only afterward.
pub struct ConnectorRegistry {
    custom: HashMap<String, Arc<dyn Connector>>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    /// A registry with just the built-in `random_password` connector.
    pub fn new() -> Self {
        Self { custom: HashMap::new() }
    }

    /// Registers a user-supplied connector under `connector_type`.
    /// Overwrites a previous registration with the same name, including a
    /// built-in one.
    pub fn register(&mut self, connector_type: impl Into<String>, connector: Arc<dyn Connector>) {
        self.custom.insert(connector_type.into(), connector);
    }

    /// Invokes the connector registered for `connector_type`.
    pub async fn rotate(&self, connector_type: &str, config: &serde_json::Value) -> Result<Vec<u8>, RotationError> {
        if let Some(connector) = self.custom.get(connector_type) {
            return connector.rotate(config).await;
        }
        match connector_type {
            "random_password" => RandomPasswordConnector.rotate(config).await,
            other => Err(RotationError::UnknownConnector(other.to_string())),
        }
    }
}

/// Parses a schedule expression into the next fire time after `now`.
///
/// Supports `"@every <duration>"` (an integer+unit sequence, units
/// `h`/`m`/`s`, e.g. `"1h30m"`) and a 5-field cron subset
/// `"minute hour day-of-month month day-of-week"` where only `minute` and
/// `hour` are interpreted: `hour = "*"` fires every hour at `minute`;
/// a numeric hour fires daily at that `hour:minute`. Anything else
/// defaults to [`DEFAULT_INTERVAL`].
pub fn next_fire_time(expr: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let expr = expr.trim();

    if let Some(duration_str) = expr.strip_prefix("@every ") {
        if let Some(duration) = parse_duration(duration_str.trim()) {
            return now + duration;
        }
        return now + DEFAULT_INTERVAL;
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        if let Ok(minute) = fields[0].parse::<u32>() {
            if minute < 60 {
                if fields[1] == "*" {
                    let candidate = now
                        .date_naive()
                        .and_hms_opt(now.hour(), minute, 0)
                        .and_then(|naive| Utc.from_local_datetime(&naive).single());
                    if let Some(candidate) = candidate {
                        return if candidate > now { candidate } else { candidate + Duration::hours(1) };
                    }
                } else if let Ok(hour) = fields[1].parse::<u32>() {
                    if hour < 24 {
                        let candidate = now
                            .date_naive()
                            .and_hms_opt(hour, minute, 0)
                            .and_then(|naive| Utc.from_local_datetime(&naive).single());
                        if let Some(candidate) = candidate {
                            return if candidate > now { candidate } else { candidate + Duration::days(1) };
                        }
                    }
                }
            }
        }
    }

    now + DEFAULT_INTERVAL
}

/// Parses an integer+unit duration sequence (`h`/`m`/`s` units, e.g.
/// `"1h30m"`, `"90s"`). Returns `None` if the string is empty or contains
/// anything that doesn't parse as `<digits><unit>`.
fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut consumed_any = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: i64 = digits.parse().ok()?;
        digits.clear();
        total = total
            + match ch {
                'h' => Duration::hours(value),
                'm' => Duration::minutes(value),
                's' => Duration::seconds(value),
                _ => return None,
            };
        consumed_any = true;
    }

    if !digits.is_empty() || !consumed_any {
        return None;
    }
    Some(total)
}

/// Dispatches due rotations through a [`ConnectorRegistry`], sealing new
/// values with a shared [`CryptoEngine`] and committing them via a
/// [`Repository`].
pub struct RotationScheduler {
    repo: Arc<dyn Repository>,
    crypto: Arc<CryptoEngine>,
    registry: Arc<ConnectorRegistry>,
}

impl RotationScheduler {
    /// Builds a scheduler over the given collaborators.
    pub fn new(repo: Arc<dyn Repository>, crypto: Arc<CryptoEngine>, registry: Arc<ConnectorRegistry>) -> Self {
        Self { repo, crypto, registry }
    }

    /// Fetches and rotates every schedule due as of `now`. A failure on one
    /// schedule marks it `failed` and does not stop the remaining ones.
    /// Returns `(rotated_count, failed_count)`.
    pub async fn run_due_rotations(&self, now: DateTime<Utc>) -> (usize, usize) {
        let due = match self.repo.list_due_schedules(now).await {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(%err, "failed to list due rotation schedules");
                return (0, 0);
            }
        };

        let mut rotated = 0;
        let mut failed = 0;
        for schedule in due {
            match self.rotate_one(&schedule).await {
                Ok(()) => rotated += 1,
                Err(err) => {
                    failed += 1;
                    tracing::error!(schedule_id = %schedule.id, %err, "rotation failed");
                    if let Err(record_err) = self.repo.record_rotation_failure(schedule.id, &err.to_string()).await {
                        tracing::error!(schedule_id = %schedule.id, %record_err, "failed to record rotation failure");
                    }
                }
            }
        }
        (rotated, failed)
    }

    async fn rotate_one(&self, schedule: &RotationSchedule) -> Result<(), RotationError> {
        let plaintext = self
            .registry
            .rotate(&schedule.connector_type, &schedule.connector_config)
            .await?;

        let sealed = self
            .crypto
            .seal(&plaintext)
            .map_err(|e| RotationError::Crypto(e.to_string()))?;

        let envelope = EnvelopeFields {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            wrapped_dek: sealed.wrapped_dek,
            wrapped_dek_nonce: sealed.wrapped_dek_nonce,
            root_key_generation: sealed.root_key_generation,
        };

        self.repo
            .insert_rotated_version(schedule.secret_id, envelope, ROTATION_ACTOR)
            .await
            .map_err(|e| RotationError::Repository(e.to_string()))?;

        let now = Utc::now();
        let next = next_fire_time(&schedule.schedule_expr, now);
        self.repo
            .record_rotation_success(schedule.id, now, next)
            .await
            .map_err(|e| RotationError::Repository(e.to_string()))?;

        Ok(())
    }

    /// Runs [`Self::run_due_rotations`] every [`TICK_INTERVAL`] until
    /// `shutdown` fires.
    pub async fn run_loop(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("rotation scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let (rotated, failed) = self.run_due_rotations(Utc::now()).await;
                    if rotated > 0 || failed > 0 {
                        tracing::info!(rotated, failed, "rotation sweep complete");
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
    use teamvault_types::{ScheduleStatus, SecretType};

    fn engine() -> Arc<CryptoEngine> {
        Arc::new(CryptoEngine::new(RootKeyRing::single(RootKey::from_bytes([3u8; 32]))))
    }

    #[test]
    fn every_duration_parses_composite_units() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_fire_time("@every 1h30m", now);
        assert_eq!(next, now + Duration::minutes(90));
    }

    #[test]
    fn unparseable_expression_defaults_to_24h() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(next_fire_time("garbage", now), now + DEFAULT_INTERVAL);
        assert_eq!(next_fire_time("@every", now), now + DEFAULT_INTERVAL);
    }

    #[test]
    fn cron_wildcard_hour_fires_next_whole_hour() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 45, 0).unwrap();
        let next = next_fire_time("15 * * * *", now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 11, 15, 0).unwrap());
    }

    #[test]
    fn cron_numeric_hour_fires_daily() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap();
        let next = next_fire_time("30 9 * * *", now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 9, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn random_password_connector_respects_length() {
        let connector = RandomPasswordConnector;
        let config = serde_json::json!({"length": 16});
        let value = connector.rotate(&config).await.unwrap();
        assert_eq!(value.len(), 16);
    }

    #[tokio::test]
    async fn random_password_length_clamps_to_bounds() {
        let connector = RandomPasswordConnector;
        let too_long = connector.rotate(&serde_json::json!({"length": 9999})).await.unwrap();
        assert_eq!(too_long.len(), 256);
        let too_short = connector.rotate(&serde_json::json!({"length": 0})).await.unwrap();
        assert_eq!(too_short.len(), 1);
    }

    #[tokio::test]
    async fn rotate_writes_new_version_and_reschedules() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let crypto = engine();
        let registry = Arc::new(ConnectorRegistry::new());

        let project = repo.create_project("demo", None, None, "alice").await.unwrap();
        let envelope = EnvelopeFields {
            ciphertext: vec![1, 2, 3],
            nonce: vec![0; 12],
            wrapped_dek: vec![4, 5, 6],
            wrapped_dek_nonce: vec![0; 12],
            root_key_generation: 0,
        };
        let (secret, _v1) = repo
            .put_secret_version(project.id, "api/key", SecretType::Kv, envelope, "alice")
            .await
            .unwrap();

        let schedule = RotationSchedule {
            id: Uuid::new_v4(),
            secret_id: secret.id,
            schedule_expr: "@every 1s".to_string(),
            connector_type: "random_password".to_string(),
            connector_config: serde_json::json!({"length": 16}),
            last_rotated_at: None,
            next_rotation_at: Utc::now() - Duration::seconds(1),
            status: ScheduleStatus::Active,
            last_error: None,
        };
        repo.create_rotation_schedule(schedule).await.unwrap();

        let scheduler = RotationScheduler::new(repo.clone(), crypto.clone(), registry);
        let (rotated, failed) = scheduler.run_due_rotations(Utc::now()).await;
        assert_eq!(rotated, 1);
        assert_eq!(failed, 0);

        let versions = repo.list_versions(secret.id).await.unwrap();
        assert_eq!(versions.len(), 2);
        let latest = versions.last().unwrap();
        assert_eq!(latest.created_by, ROTATION_ACTOR);
        let plaintext = crypto
            .open(&teamvault_crypto::SealedValue {
                ciphertext: latest.ciphertext.clone(),
                nonce: latest.nonce.clone(),
                wrapped_dek: latest.wrapped_dek.clone(),
                wrapped_dek_nonce: latest.wrapped_dek_nonce.clone(),
                root_key_generation: latest.root_key_generation,
            })
            .unwrap();
        assert_eq!(plaintext.len(), 16);
    }

    #[tokio::test]
    async fn unknown_connector_marks_schedule_failed() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let crypto = engine();
        let registry = Arc::new(ConnectorRegistry::new());

        let project = repo.create_project("demo", None, None, "alice").await.unwrap();
        let envelope = EnvelopeFields {
            ciphertext: vec![1],
            nonce: vec![0; 12],
            wrapped_dek: vec![2],
            wrapped_dek_nonce: vec![0; 12],
            root_key_generation: 0,
        };
        let (secret, _) = repo
            .put_secret_version(project.id, "api/key", SecretType::Kv, envelope, "alice")
            .await
            .unwrap();

        let schedule = RotationSchedule {
            id: Uuid::new_v4(),
            secret_id: secret.id,
            schedule_expr: "@every 1s".to_string(),
            connector_type: "does_not_exist".to_string(),
            connector_config: serde_json::json!({}),
            last_rotated_at: None,
            next_rotation_at: Utc::now() - Duration::seconds(1),
            status: ScheduleStatus::Active,
            last_error: None,
        };
        repo.create_rotation_schedule(schedule.clone()).await.unwrap();

        let scheduler = RotationScheduler::new(repo.clone(), crypto, registry);
        let (rotated, failed) = scheduler.run_due_rotations(Utc::now()).await;
        assert_eq!(rotated, 0);
        assert_eq!(failed, 1);

        let due = repo.list_due_schedules(Utc::now()).await.unwrap();
        assert!(due.is_empty(), "failed schedule must not remain active/due");
    }
}
