#![forbid(unsafe_code)]

//! The per-node write-ahead replication log: append on every local
//! mutation, pull pages for followers, and apply incoming entries with
//! vector-clock causal ordering and a last-writer-wins fallback for
//! genuinely concurrent writes.
//!
//! Follows `vault-hash`'s causal-addressing idiom (content identified by
//! what caused it, not by wall-clock position), generalized here from
//! content hashing to vector-clock causality: every prior entry for a row
//! is compared via its vector clock, unconditionally — wall-clock recency
//! is never used to decide whether that comparison happens, only (for
//! genuinely concurrent writes) to break the tie.

use chrono::{Duration, Utc};
use std::sync::Arc;
use teamvault_repository::Repository;
use teamvault_types::errors::{Categorize, ErrorCategory};
use teamvault_types::{ReplicationEntry, ReplicationOp, VectorClock};

/// Default page size for [`ReplicationLog::pull`] when the caller does not
/// specify one.
pub const DEFAULT_PULL_LIMIT: i64 = 100;
/// Hard cap on a single pull page.
pub const MAX_PULL_LIMIT: i64 = 1000;
/// Retained as a config value only, never as a gate: [`ReplicationLog::
/// apply_one`] compares every prior entry for a row against the incoming
/// vector clock unconditionally, regardless of how long ago it landed.
/// A fixed wall-clock window used as the sole decider of whether that
/// comparison happens at all would misclassify concurrency under clock
/// skew between nodes (spec.md §9) — this constant is kept only in case a
/// future optimization wants a cheap pre-filter *in addition to*, never
/// instead of, the vector-clock check.
pub const CONFLICT_WINDOW: Duration = Duration::seconds(5);

/// Errors raised by replication operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The backing store failed.
    #[error("repository error: {0}")]
    Repository(String),
}

impl Categorize for ReplicationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Backend
    }
}

impl From<teamvault_repository::error::RepositoryError> for ReplicationError {
    fn from(err: teamvault_repository::error::RepositoryError) -> Self {
        ReplicationError::Repository(err.to_string())
    }
}

/// Outcome of applying one incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Accepted and inserted.
    Accepted,
    /// Skipped: already present locally (same id).
    AlreadyPresent,
    /// Skipped: authored by this node.
    OwnEntry,
    /// Skipped: the incoming entry happens-before the current local state.
    StaleConflict,
}

/// A node's view of the replication log: appends locally-authored
/// mutations and applies entries pulled from peers.
pub struct ReplicationLog {
    repo: Arc<dyn Repository>,
    node_id: String,
    clock: tokio::sync::Mutex<VectorClock>,
}

impl ReplicationLog {
    /// Builds a log for `node_id` with a fresh (zero) vector clock.
    pub fn new(repo: Arc<dyn Repository>, node_id: impl Into<String>) -> Self {
        Self { repo, node_id: node_id.into(), clock: tokio::sync::Mutex::new(VectorClock::new()) }
    }

    /// This node's identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The current local vector clock.
    pub async fn current_clock(&self) -> VectorClock {
        self.clock.lock().await.clone()
    }

    /// Records a local mutation: increments this node's clock component,
    /// snapshots it, and appends the entry. The log is strictly append-only.
    pub async fn append(
        &self,
        op: ReplicationOp,
        table: &str,
        row_id: &str,
        payload: serde_json::Value,
    ) -> Result<ReplicationEntry, ReplicationError> {
        let mut clock = self.clock.lock().await;
        *clock = clock.increment(&self.node_id);
        let snapshot = clock.clone();
        drop(clock);

        let entry = ReplicationEntry {
            id: 0,
            op,
            table: table.to_string(),
            row_id: row_id.to_string(),
            payload,
            timestamp: Utc::now(),
            node_id: self.node_id.clone(),
            vector_clock: snapshot,
        };
        Ok(self.repo.append_replication_entry(entry).await?)
    }

    /// Entries strictly after `after_id`, up to `limit` (clamped to
    /// `[1, MAX_PULL_LIMIT]`, defaulting to [`DEFAULT_PULL_LIMIT`] when
    /// `limit` is `None`), plus whether more entries remain beyond the page.
    pub async fn pull(&self, after_id: i64, limit: Option<i64>) -> Result<(Vec<ReplicationEntry>, bool), ReplicationError> {
        let limit = limit.unwrap_or(DEFAULT_PULL_LIMIT).clamp(1, MAX_PULL_LIMIT);
        Ok(self.repo.pull_replication_entries(after_id, limit).await?)
    }

    /// Applies a batch of entries pulled from a peer. Individual failures
    /// are logged and skipped; the batch never rolls back partially.
    /// Returns the count actually accepted.
    pub async fn apply_batch(&self, entries: Vec<ReplicationEntry>) -> usize {
        let mut accepted = 0;
        for entry in entries {
            match self.apply_one(entry).await {
                Ok(ApplyOutcome::Accepted) => accepted += 1,
                Ok(_) => {}
                Err(err) => tracing::error!(%err, "failed to apply replication entry"),
            }
        }
        accepted
    }

    /// Applies a single incoming entry, returning which outcome occurred.
    pub async fn apply_one(&self, entry: ReplicationEntry) -> Result<ApplyOutcome, ReplicationError> {
        if entry.node_id == self.node_id {
            return Ok(ApplyOutcome::OwnEntry);
        }

        // Unbounded: every prior entry for this row is a candidate, never
        // just ones inside some wall-clock window. See the module doc.
        let recent = self
            .repo
            .recent_entries_for_row(&entry.table, &entry.row_id, chrono::DateTime::<Utc>::MIN_UTC)
            .await?;
        let conflicting = recent.iter().filter(|e| e.node_id != entry.node_id).max_by(|a, b| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a.node_id.cmp(&b.node_id))
        });

        if let Some(local_latest) = conflicting {
            if local_latest.vector_clock.happens_before(&entry.vector_clock) {
                // incoming strictly dominates local: accept
            } else if entry.vector_clock.happens_before(&local_latest.vector_clock) {
                return Ok(ApplyOutcome::StaleConflict);
            } else {
                // concurrent: larger timestamp wins; ties broken by
                // ascending node-id string order (the lexicographically
                // greater id wins).
                let incoming_wins = match entry.timestamp.cmp(&local_latest.timestamp) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => entry.node_id > local_latest.node_id,
                };
                if !incoming_wins {
                    return Ok(ApplyOutcome::StaleConflict);
                }
            }
        }

        let inserted = self.repo.apply_replication_entry(entry.clone()).await?;
        if !inserted {
            return Ok(ApplyOutcome::AlreadyPresent);
        }

        let mut clock = self.clock.lock().await;
        *clock = clock.merge(&entry.vector_clock);
        Ok(ApplyOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamvault_repository::memory::MemoryRepository;

    fn log(node_id: &str) -> ReplicationLog {
        ReplicationLog::new(Arc::new(MemoryRepository::new()), node_id)
    }

    #[tokio::test]
    async fn append_increments_local_clock_and_assigns_id() {
        let leader = log("node-a");
        let entry = leader.append(ReplicationOp::Insert, "secrets", "row-1", serde_json::json!({"v": 1})).await.unwrap();
        assert_eq!(entry.vector_clock.get("node-a"), 1);
        assert!(entry.id > 0);

        let entry2 = leader.append(ReplicationOp::Update, "secrets", "row-1", serde_json::json!({"v": 2})).await.unwrap();
        assert_eq!(entry2.vector_clock.get("node-a"), 2);
    }

    #[tokio::test]
    async fn pull_pages_with_has_more() {
        let leader = log("node-a");
        for i in 0..5 {
            leader.append(ReplicationOp::Insert, "secrets", &format!("row-{i}"), serde_json::json!({})).await.unwrap();
        }
        let (page, has_more) = leader.pull(0, Some(3)).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(has_more);
        let (rest, has_more) = leader.pull(page.last().unwrap().id, Some(3)).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(!has_more);
    }

    #[tokio::test]
    async fn pull_limit_clamps_to_max() {
        let leader = log("node-a");
        let (_, has_more) = leader.pull(0, Some(100_000)).await.unwrap();
        assert!(!has_more);
    }

    #[tokio::test]
    async fn apply_skips_own_entries() {
        let follower = log("node-b");
        let entry = ReplicationEntry {
            id: 1,
            op: ReplicationOp::Insert,
            table: "secrets".into(),
            row_id: "row-1".into(),
            payload: serde_json::json!({}),
            timestamp: Utc::now(),
            node_id: "node-b".into(),
            vector_clock: VectorClock::new().increment("node-b"),
        };
        let outcome = follower.apply_one(entry).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::OwnEntry);
    }

    #[tokio::test]
    async fn apply_accepts_causally_later_entry_and_merges_clock() {
        let follower = log("node-b");
        let clock_a = VectorClock::new().increment("node-a");
        let entry1 = ReplicationEntry {
            id: 1,
            op: ReplicationOp::Insert,
            table: "secrets".into(),
            row_id: "row-1".into(),
            payload: serde_json::json!({"v": 1}),
            timestamp: Utc::now(),
            node_id: "node-a".into(),
            vector_clock: clock_a.clone(),
        };
        assert_eq!(follower.apply_one(entry1).await.unwrap(), ApplyOutcome::Accepted);
        assert_eq!(follower.current_clock().await.get("node-a"), 1);

        let clock_a2 = clock_a.increment("node-a");
        let entry2 = ReplicationEntry {
            id: 2,
            op: ReplicationOp::Update,
            table: "secrets".into(),
            row_id: "row-1".into(),
            payload: serde_json::json!({"v": 2}),
            timestamp: Utc::now(),
            node_id: "node-a".into(),
            vector_clock: clock_a2,
        };
        assert_eq!(follower.apply_one(entry2).await.unwrap(), ApplyOutcome::Accepted);
        assert_eq!(follower.current_clock().await.get("node-a"), 2);
    }

    #[tokio::test]
    async fn apply_rejects_stale_entry_that_happens_before_local() {
        let follower = log("node-b");
        let clock_a = VectorClock::new().increment("node-a");
        let clock_a2 = clock_a.increment("node-a");

        let newer = ReplicationEntry {
            id: 1,
            op: ReplicationOp::Update,
            table: "secrets".into(),
            row_id: "row-1".into(),
            payload: serde_json::json!({"v": 2}),
            timestamp: Utc::now(),
            node_id: "node-a".into(),
            vector_clock: clock_a2,
        };
        assert_eq!(follower.apply_one(newer).await.unwrap(), ApplyOutcome::Accepted);

        let stale = ReplicationEntry {
            id: 2,
            op: ReplicationOp::Update,
            table: "secrets".into(),
            row_id: "row-1".into(),
            payload: serde_json::json!({"v": 1}),
            timestamp: Utc::now(),
            node_id: "node-a".into(),
            vector_clock: clock_a,
        };
        assert_eq!(follower.apply_one(stale).await.unwrap(), ApplyOutcome::StaleConflict);
    }

    #[tokio::test]
    async fn apply_concurrent_writes_breaks_tie_on_node_id() {
        let follower = log("node-c");
        let now = Utc::now();

        let from_a = ReplicationEntry {
            id: 1,
            op: ReplicationOp::Update,
            table: "secrets".into(),
            row_id: "row-1".into(),
            payload: serde_json::json!({"from": "a"}),
            timestamp: now,
            node_id: "node-a".into(),
            vector_clock: VectorClock::new().increment("node-a"),
        };
        assert_eq!(follower.apply_one(from_a).await.unwrap(), ApplyOutcome::Accepted);

        // node-b writes concurrently (independent clock component) at the
        // exact same timestamp: "node-b" > "node-a" lexicographically, so
        // it must win the tie.
        let from_b = ReplicationEntry {
            id: 2,
            op: ReplicationOp::Update,
            table: "secrets".into(),
            row_id: "row-1".into(),
            payload: serde_json::json!({"from": "b"}),
            timestamp: now,
            node_id: "node-b".into(),
            vector_clock: VectorClock::new().increment("node-b"),
        };
        assert_eq!(follower.apply_one(from_b).await.unwrap(), ApplyOutcome::Accepted);
    }
}
