//! State backend trait for run, entity and log persistence.
//!
//! The [`StateBackend`] trait defines the interface the orchestrator uses to
//! persist progress. The engine ships an in-memory implementation
//! ([`MemoryBackend`](super::MemoryBackend)); database-backed
//! implementations live with the application that wires up persistence.
//!
//! All entity operations are scoped by `run_id`; state set under one run is
//! never observable under another. The backend is the only writer of entity
//! `target_id` and `status`, and writes are atomic per
//! (run_id, entity_type, source_id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::{
    EntityRecord, EntityType, IdentityEntry, LogFilter, LogRecord, Page, Run, RunStatus,
    StageCounters,
};
use crate::error::Result;

/// Persistence interface for migration state.
///
/// Implementations must be `Send + Sync` to allow sharing across async
/// tasks.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // ---- runs -------------------------------------------------------------

    /// Persist a newly created run.
    async fn create_run(&self, run: Run) -> Result<()>;

    /// Load a run by id.
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Persist a run lifecycle transition (status and timestamps).
    async fn update_run(&self, run: &Run) -> Result<()>;

    // ---- entity records ---------------------------------------------------

    /// Record the start of a processing attempt.
    ///
    /// Creates the entity record lazily on first touch (status `running`)
    /// and snapshots the source payload. Subsequent attempts overwrite the
    /// snapshot and reset the status to `running`.
    async fn mark_running(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        payload: &Value,
        source_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Upsert a successful mapping: status becomes `success` and
    /// `target_id`/`last_synced_at` are set.
    async fn set(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        target_id: &str,
    ) -> Result<()>;

    /// Resolve a source id to its target id, if the entity succeeded.
    async fn get(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<String>>;

    /// Whether the entity already migrated successfully under this run.
    async fn already_migrated(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<bool>;

    /// Full source→target map over successful rows only.
    ///
    /// Used to resolve foreign-key references (a product's category id)
    /// before a write.
    async fn get_map(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
    ) -> Result<HashMap<String, String>>;

    /// Mark an entity failed. The message is sanitized and length-capped
    /// before storage; the row remains as an audit trail.
    async fn mark_failed(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        message: &str,
    ) -> Result<()>;

    /// Mark an entity skipped (idempotency short-circuit or incremental
    /// no-op), optionally carrying the known target id.
    async fn mark_skipped(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        target_id: Option<&str>,
    ) -> Result<()>;

    /// Load the full record for inspection (resume decisions, audits).
    async fn get_record(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<EntityRecord>>;

    /// Per-entity-type status counters for the run.
    async fn counts(&self, run_id: Uuid) -> Result<BTreeMap<EntityType, StageCounters>>;

    // ---- logs -------------------------------------------------------------

    /// Append a log record. Never mutates existing rows.
    async fn record_log(&self, record: LogRecord) -> Result<()>;

    /// Query logs for a run with filters and pagination, newest first.
    async fn query_logs(
        &self,
        run_id: Uuid,
        filter: &LogFilter,
        page: Page,
    ) -> Result<Vec<LogRecord>>;

    // ---- cross-run identity map -------------------------------------------

    /// Look up a cross-run mapping for shared reference data.
    async fn identity_get(
        &self,
        entity_type: EntityType,
        source_uuid: &str,
    ) -> Result<Option<IdentityEntry>>;

    /// Store or refresh a cross-run mapping.
    async fn identity_put(
        &self,
        entity_type: EntityType,
        source_uuid: &str,
        entry: IdentityEntry,
    ) -> Result<()>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Helper to convert a RunStatus to its stored string representation.
pub fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::DryRun => "dry_run",
        RunStatus::Paused => "paused",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

/// Helper to parse a RunStatus from its stored string representation.
pub fn str_to_run_status(s: &str) -> Option<RunStatus> {
    match s {
        "pending" => Some(RunStatus::Pending),
        "running" => Some(RunStatus::Running),
        "dry_run" => Some(RunStatus::DryRun),
        "paused" => Some(RunStatus::Paused),
        "completed" => Some(RunStatus::Completed),
        "failed" => Some(RunStatus::Failed),
        _ => None,
    }
}
