#![forbid(unsafe_code)]

//! A tamper-evident, hash-chained audit log.
//!
//! Every security-relevant action produces an [`AuditEvent`] whose `hash`
//! field covers its own content *and* the previous event's hash, forming a
//! chain: altering or removing any past event invalidates every hash after
//! it. Events are appended by a single owning task (the "singleton actor")
//! reached through [`AuditLogger`] handles, so chain order is never raced
//! even when many request-handling tasks log concurrently.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use teamvault_types::errors::{Categorize, ErrorCategory};
use teamvault_types::{AuditEvent, Outcome};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Errors raised while appending to or verifying the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The logger's owning task has shut down; no further events can be
    /// appended through this handle.
    #[error("audit logger actor is unavailable")]
    ActorUnavailable,
    /// The configured [`AuditSink`] failed to persist an event.
    #[error("audit sink failed: {0}")]
    SinkFailed(String),
    /// Chain verification found a break.
    #[error("audit chain broken at event {0}")]
    ChainBroken(Uuid),
}

impl Categorize for AuditError {
    fn category(&self) -> ErrorCategory {
        match self {
            AuditError::ActorUnavailable => ErrorCategory::Unavailable,
            AuditError::SinkFailed(_) => ErrorCategory::Backend,
            AuditError::ChainBroken(_) => ErrorCategory::Backend,
        }
    }
}

/// Where appended events are durably persisted.
///
/// Implemented by `teamvault-repository` in the real server; an in-memory
/// implementation is provided here for tests.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persists `event`. Must not reorder relative to prior calls from the
    /// same [`AuditLogger`] actor — the actor already serializes calls, so
    /// implementations only need to append.
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Returns the hash of the most recently persisted event, or an empty
    /// string if the log is empty. Used to resume the chain after a
    /// restart.
    async fn last_hash(&self) -> Result<String, AuditError>;
}

/// An in-process, non-durable [`AuditSink`] used for tests.
#[derive(Default)]
pub struct MemorySink {
    events: tokio::sync::Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event appended so far, in order.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn last_hash(&self) -> Result<String, AuditError> {
        Ok(self
            .events
            .lock()
            .await
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_default())
    }
}

/// The fields a caller supplies to log an event; the chain fields
/// (`id`, `timestamp`, `prev_hash`, `hash`) are filled in by the actor.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Kind of actor that performed the action (`user`, `service_account`, `system`).
    pub actor_type: String,
    /// Identifier of the actor.
    pub actor_id: String,
    /// Action performed (e.g. `secret.read`).
    pub action: String,
    /// Resource acted upon (e.g. a secret path).
    pub resource: String,
    /// Result of the operation.
    pub outcome: Outcome,
    /// Client IP, if known.
    pub ip: Option<String>,
    /// Structured metadata; serialized to canonical JSON before hashing.
    pub metadata: serde_json::Value,
}

/// Computes the chained hash for an event given its predecessor's hash.
///
/// The hashed preimage is `prev_hash | timestamp | actor_type:actor_id |
/// action | resource | outcome | metadata`, each field joined with a
/// literal `|`. The timestamp is RFC3339 with nanosecond precision so two
/// events within the same second still produce distinct hashes.
pub fn compute_hash(
    prev_hash: &str,
    timestamp: DateTime<Utc>,
    actor_type: &str,
    actor_id: &str,
    action: &str,
    resource: &str,
    outcome: Outcome,
    metadata_canonical: &str,
) -> String {
    let outcome_str = match outcome {
        Outcome::Success => "success",
        Outcome::Denied => "denied",
        Outcome::Error => "error",
    };
    let preimage = format!(
        "{prev_hash}|{}|{actor_type}:{actor_id}|{action}|{resource}|{outcome_str}|{metadata_canonical}",
        timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}

enum Command {
    Append {
        record: AuditRecord,
        reply: oneshot::Sender<Result<AuditEvent, AuditError>>,
    },
}

/// A cheaply cloneable handle to the single task that owns audit chain
/// state and serializes appends.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<Command>,
}

impl AuditLogger {
    /// Spawns the owning task and returns a handle to it.
    ///
    /// `initial_hash` should be the sink's `last_hash()` at startup so the
    /// chain continues correctly across restarts; pass an empty string for
    /// a brand new log.
    pub fn spawn(sink: std::sync::Arc<dyn AuditSink>, initial_hash: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(1024);

        tokio::spawn(async move {
            let mut prev_hash = initial_hash;

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Append { record, reply } => {
                        let result = append_one(&sink, &mut prev_hash, record).await;
                        let _ = reply.send(result);
                    }
                }
            }
        });

        Self { tx }
    }

    /// Appends `record` to the chain, returning the persisted event.
    pub async fn log(&self, record: AuditRecord) -> Result<AuditEvent, AuditError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Append {
                record,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AuditError::ActorUnavailable)?;
        reply_rx.await.map_err(|_| AuditError::ActorUnavailable)?
    }
}

async fn append_one(
    sink: &std::sync::Arc<dyn AuditSink>,
    prev_hash: &mut String,
    record: AuditRecord,
) -> Result<AuditEvent, AuditError> {
    let timestamp = Utc::now();
    let metadata_canonical = serde_json::to_string(&record.metadata).unwrap_or_default();

    let hash = compute_hash(
        prev_hash,
        timestamp,
        &record.actor_type,
        &record.actor_id,
        &record.action,
        &record.resource,
        record.outcome,
        &metadata_canonical,
    );

    let event = AuditEvent {
        id: Uuid::new_v4(),
        timestamp,
        actor_type: record.actor_type,
        actor_id: record.actor_id,
        action: record.action,
        resource: record.resource,
        outcome: record.outcome,
        ip: record.ip,
        metadata: metadata_canonical,
        prev_hash: prev_hash.clone(),
        hash: hash.clone(),
    };

    sink.append(event.clone())
        .await
        .map_err(|e| AuditError::SinkFailed(e.to_string()))?;
    *prev_hash = hash;

    Ok(event)
}

/// Filters for [`AuditQuery::query`]. `limit` is clamped by the caller
/// (`teamvault-server`'s `/api/v1/audit` handler, `0` → 50, `>500` → 500);
/// this crate applies whatever value it is given without re-clamping.
#[derive(Debug, Clone, Default)]
pub struct AuditQueryFilter {
    /// Restrict to a single actor type (`user`, `service_account`, `system`).
    pub actor_type: Option<String>,
    /// Restrict to a single actor id.
    pub actor_id: Option<String>,
    /// Restrict to a single action string.
    pub action: Option<String>,
    /// Restrict to a single resource string.
    pub resource: Option<String>,
    /// Maximum rows to return, most recent first.
    pub limit: i64,
    /// Rows to skip before `limit` is applied.
    pub offset: i64,
}

/// Implemented by audit sinks that can also be queried (every sink this
/// crate ships with), kept separate from [`AuditSink`] so append-only
/// replicas could, in principle, implement one without the other.
#[async_trait]
pub trait AuditQuery: Send + Sync {
    /// Returns events matching every populated filter field, most recent
    /// first.
    async fn query(&self, filter: AuditQueryFilter) -> Result<Vec<AuditEvent>, AuditError>;
}

#[async_trait]
impl AuditQuery for MemorySink {
    async fn query(&self, filter: AuditQueryFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let events = self.events.lock().await;
        let mut matching: Vec<AuditEvent> = events
            .iter()
            .rev()
            .filter(|e| filter.actor_type.as_deref().map_or(true, |v| e.actor_type == v))
            .filter(|e| filter.actor_id.as_deref().map_or(true, |v| e.actor_id == v))
            .filter(|e| filter.action.as_deref().map_or(true, |v| e.action == v))
            .filter(|e| filter.resource.as_deref().map_or(true, |v| e.resource == v))
            .cloned()
            .collect();
        if filter.offset > 0 {
            matching = matching.into_iter().skip(filter.offset as usize).collect();
        }
        if filter.limit > 0 {
            matching.truncate(filter.limit as usize);
        }
        Ok(matching)
    }
}

/// Recomputes every event's hash from its stored fields and checks that the
/// chain links correctly. `events` must be in insertion order.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), AuditError> {
    let mut expected_prev = String::new();
    for event in events {
        if event.prev_hash != expected_prev {
            return Err(AuditError::ChainBroken(event.id));
        }
        let recomputed = compute_hash(
            &event.prev_hash,
            event.timestamp,
            &event.actor_type,
            &event.actor_id,
            &event.action,
            &event.resource,
            event.outcome,
            &event.metadata,
        );
        if recomputed != event.hash {
            return Err(AuditError::ChainBroken(event.id));
        }
        expected_prev = event.hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(action: &str) -> AuditRecord {
        AuditRecord {
            actor_type: "user".into(),
            actor_id: "alice".into(),
            action: action.into(),
            resource: "project/db/secret".into(),
            outcome: Outcome::Success,
            ip: Some("10.0.0.1".into()),
            metadata: serde_json::json!({"version": 1}),
        }
    }

    #[tokio::test]
    async fn events_chain_and_verify() {
        let sink = Arc::new(MemorySink::new());
        let logger = AuditLogger::spawn(sink.clone(), String::new());

        let first = logger.log(record("secret.read")).await.unwrap();
        assert_eq!(first.prev_hash, "");

        let second = logger.log(record("secret.write")).await.unwrap();
        assert_eq!(second.prev_hash, first.hash);

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        verify_chain(&events).unwrap();
    }

    #[tokio::test]
    async fn tampering_with_an_event_breaks_verification() {
        let sink = Arc::new(MemorySink::new());
        let logger = AuditLogger::spawn(sink.clone(), String::new());

        logger.log(record("secret.read")).await.unwrap();
        logger.log(record("secret.write")).await.unwrap();

        let mut events = sink.events().await;
        events[0].action = "secret.delete".into();

        assert!(verify_chain(&events).is_err());
    }

    #[tokio::test]
    async fn concurrent_appends_stay_serialized() {
        let sink = Arc::new(MemorySink::new());
        let logger = AuditLogger::spawn(sink.clone(), String::new());

        let mut handles = Vec::new();
        for i in 0..20 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                logger.log(record(&format!("action-{i}"))).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let events = sink.events().await;
        assert_eq!(events.len(), 20);
        verify_chain(&events).unwrap();
    }

    #[tokio::test]
    async fn resumes_chain_from_supplied_initial_hash() {
        let sink = Arc::new(MemorySink::new());
        let logger = AuditLogger::spawn(sink.clone(), "deadbeef".into());

        let event = logger.log(record("secret.read")).await.unwrap();
        assert_eq!(event.prev_hash, "deadbeef");
    }
}
