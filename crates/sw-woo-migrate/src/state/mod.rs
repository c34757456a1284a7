//! Run, entity and log state for idempotent, resumable migrations.
//!
//! Everything the pipeline knows about progress lives here: the [`Run`]
//! lifecycle row, one [`EntityRecord`] per (run, entity type, source id)
//! triple, append-only [`LogRecord`]s, and the cross-run identity map used
//! to short-circuit re-migration of shared reference data.
//!
//! The [`StateBackend`](backend::StateBackend) trait is the only writer of
//! entity `target_id` and `status`; a resumed run re-derives its position
//! purely from persisted entity status, never from an in-memory cursor.

pub mod backend;
pub mod memory;

pub use backend::StateBackend;
pub use memory::MemoryBackend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ConflictStrategy, SyncMode};

/// Maximum stored length of a per-entity error message, in characters.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Maximum stored length of a log message, in characters.
pub const MAX_LOG_MESSAGE_LEN: usize = 2000;

/// Entity types migrated by the pipeline, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Manufacturer,
    Tax,
    Category,
    Product,
    Customer,
    Order,
    Coupon,
    Review,
    /// Not a pipeline stage; used by the cross-run identity map to track
    /// re-hosted media assets.
    Media,
}

/// Fixed stage order. Later stages depend on mappings produced by earlier
/// ones (products reference categories and manufacturers, orders reference
/// products and customers).
pub const STAGE_ORDER: &[EntityType] = &[
    EntityType::Manufacturer,
    EntityType::Tax,
    EntityType::Category,
    EntityType::Product,
    EntityType::Customer,
    EntityType::Order,
    EntityType::Coupon,
    EntityType::Review,
];

impl EntityType {
    /// Return the entity type name as stored in state and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manufacturer => "manufacturer",
            Self::Tax => "tax",
            Self::Category => "category",
            Self::Product => "product",
            Self::Customer => "customer",
            Self::Order => "order",
            Self::Coupon => "coupon",
            Self::Review => "review",
            Self::Media => "media",
        }
    }

    /// Parse an entity type name. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manufacturer" => Some(Self::Manufacturer),
            "tax" => Some(Self::Tax),
            "category" => Some(Self::Category),
            "product" => Some(Self::Product),
            "customer" => Some(Self::Customer),
            "order" => Some(Self::Order),
            "coupon" => Some(Self::Coupon),
            "review" => Some(Self::Review),
            "media" => Some(Self::Media),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    DryRun,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    /// Whether the run can no longer transition to another status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One end-to-end migration execution.
///
/// Created once via the orchestrator control surface, mutated only by the
/// orchestrator's lifecycle transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub id: Uuid,

    /// Display name.
    pub name: String,

    /// Lifecycle status.
    pub status: RunStatus,

    /// Whether target writes are simulated.
    pub is_dry_run: bool,

    /// Full or incremental synchronization.
    pub sync_mode: SyncMode,

    /// Conflict resolution strategy (source-wins only).
    pub conflict_strategy: ConflictStrategy,

    /// When the run was created.
    pub created_at: DateTime<Utc>,

    /// When processing started.
    pub started_at: Option<DateTime<Utc>>,

    /// When processing reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,

    /// When the run last synchronized any entity.
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new pending run.
    pub fn new(name: impl Into<String>, sync_mode: SyncMode, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: RunStatus::Pending,
            is_dry_run: dry_run,
            sync_mode,
            conflict_strategy: ConflictStrategy::SourceWins,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_sync_at: None,
        }
    }
}

/// Per-entity processing status within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Idempotency and result row for one source entity within one run.
///
/// Keyed by (run_id, entity_type, source_id); unique, never deleted during
/// a run. Failed rows remain as an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub run_id: Uuid,
    pub entity_type: EntityType,

    /// Source primary key, lowercase hex of the 16-byte value.
    pub source_id: String,

    /// Target identifier, set on first successful write.
    pub target_id: Option<String>,

    pub status: EntityStatus,

    /// Sanitized, length-capped failure message.
    pub error_message: Option<String>,

    /// Snapshot of the source payload at processing time.
    pub payload: Option<Value>,

    pub source_updated_at: Option<DateTime<Utc>>,
    pub target_updated_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Append-only log row, never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub run_id: Uuid,
    pub entity_type: Option<EntityType>,
    pub source_id: Option<String>,
    pub level: LogLevel,

    /// UTF-8-safe, capped at [`MAX_LOG_MESSAGE_LEN`] characters.
    pub message: String,

    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Create a run-level log record with no entity reference.
    pub fn run_level(run_id: Uuid, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            run_id,
            entity_type: None,
            source_id: None,
            level,
            message: sanitize_message(&message.into(), MAX_LOG_MESSAGE_LEN),
            context: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Create an entity-scoped log record.
    pub fn entity_level(
        run_id: Uuid,
        entity_type: EntityType,
        source_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            entity_type: Some(entity_type),
            source_id: Some(source_id.into()),
            level,
            message: sanitize_message(&message.into(), MAX_LOG_MESSAGE_LEN),
            context: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Filters for log queries.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub entity_type: Option<EntityType>,
    pub min_level: Option<LogLevel>,
}

/// Offset/limit pagination for log queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Per-entity-type status counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StageCounters {
    /// Total entities touched in this stage.
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.success + self.failed + self.skipped
    }

    /// Entities that reached a final status.
    pub fn processed(&self) -> u64 {
        self.success + self.failed + self.skipped
    }

    pub(crate) fn bump(&mut self, status: EntityStatus) {
        match status {
            EntityStatus::Pending => self.pending += 1,
            EntityStatus::Running => self.running += 1,
            EntityStatus::Success => self.success += 1,
            EntityStatus::Failed => self.failed += 1,
            EntityStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Cross-run identity map entry: target id plus sync watermark for
/// incremental mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub target_id: String,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Strip control characters and cap length on a character boundary.
///
/// Error and log messages come from arbitrary upstream failures (database
/// drivers, HTTP bodies, malformed content) and are persisted, so they must
/// be valid bounded UTF-8 with no terminal escapes.
pub fn sanitize_message(message: &str, max_chars: usize) -> String {
    let cleaned: String = message
        .chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' {
                ' '
            } else {
                c
            }
        })
        .collect();

    if cleaned.chars().count() <= max_chars {
        cleaned
    } else {
        cleaned.chars().take(max_chars).collect()
    }
}
