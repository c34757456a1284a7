//! In-memory state backend.
//!
//! Reference implementation of [`StateBackend`] used by tests and by
//! embedders that do not need durable state (one-shot migrations driven to
//! completion in a single process). Database-backed persistence is wired by
//! the host application against the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use super::backend::StateBackend;
use super::{
    sanitize_message, EntityRecord, EntityStatus, EntityType, IdentityEntry, LogFilter, LogLevel,
    LogRecord, Page, Run, StageCounters, MAX_ERROR_MESSAGE_LEN,
};
use crate::error::{MigrateError, Result};

type EntityKey = (Uuid, EntityType, String);

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, Run>,
    entities: HashMap<EntityKey, EntityRecord>,
    logs: Vec<LogRecord>,
    identity: HashMap<(EntityType, String), IdentityEntry>,
}

/// In-memory [`StateBackend`] implementation.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| MigrateError::State("state lock poisoned".into()))
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn create_run(&self, run: Run) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.runs.contains_key(&run.id) {
            return Err(MigrateError::State(format!("run {} already exists", run.id)));
        }
        inner.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(MigrateError::State(format!("unknown run {}", run.id))),
        }
    }

    async fn mark_running(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        payload: &Value,
        source_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let key = (run_id, entity_type, source_id.to_string());
        let record = inner.entities.entry(key).or_insert_with(|| EntityRecord {
            run_id,
            entity_type,
            source_id: source_id.to_string(),
            target_id: None,
            status: EntityStatus::Pending,
            error_message: None,
            payload: None,
            source_updated_at: None,
            target_updated_at: None,
            last_synced_at: None,
        });
        record.status = EntityStatus::Running;
        record.payload = Some(payload.clone());
        record.source_updated_at = source_updated_at;
        Ok(())
    }

    async fn set(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        target_id: &str,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let key = (run_id, entity_type, source_id.to_string());
        let record = inner.entities.entry(key).or_insert_with(|| EntityRecord {
            run_id,
            entity_type,
            source_id: source_id.to_string(),
            target_id: None,
            status: EntityStatus::Pending,
            error_message: None,
            payload: None,
            source_updated_at: None,
            target_updated_at: None,
            last_synced_at: None,
        });
        record.target_id = Some(target_id.to_string());
        record.status = EntityStatus::Success;
        record.error_message = None;
        record.target_updated_at = Some(now);
        record.last_synced_at = Some(now);
        Ok(())
    }

    async fn get(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<String>> {
        let inner = self.lock()?;
        Ok(inner
            .entities
            .get(&(run_id, entity_type, source_id.to_string()))
            .filter(|r| r.status == EntityStatus::Success)
            .and_then(|r| r.target_id.clone()))
    }

    async fn already_migrated(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<bool> {
        Ok(self.get(run_id, entity_type, source_id).await?.is_some())
    }

    async fn get_map(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
    ) -> Result<HashMap<String, String>> {
        let inner = self.lock()?;
        Ok(inner
            .entities
            .values()
            .filter(|r| {
                r.run_id == run_id
                    && r.entity_type == entity_type
                    && r.status == EntityStatus::Success
            })
            .filter_map(|r| {
                r.target_id
                    .as_ref()
                    .map(|t| (r.source_id.clone(), t.clone()))
            })
            .collect())
    }

    async fn mark_failed(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let key = (run_id, entity_type, source_id.to_string());
        let record = inner.entities.entry(key).or_insert_with(|| EntityRecord {
            run_id,
            entity_type,
            source_id: source_id.to_string(),
            target_id: None,
            status: EntityStatus::Pending,
            error_message: None,
            payload: None,
            source_updated_at: None,
            target_updated_at: None,
            last_synced_at: None,
        });
        record.status = EntityStatus::Failed;
        record.error_message = Some(sanitize_message(message, MAX_ERROR_MESSAGE_LEN));
        Ok(())
    }

    async fn mark_skipped(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
        target_id: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let key = (run_id, entity_type, source_id.to_string());
        let record = inner.entities.entry(key).or_insert_with(|| EntityRecord {
            run_id,
            entity_type,
            source_id: source_id.to_string(),
            target_id: None,
            status: EntityStatus::Pending,
            error_message: None,
            payload: None,
            source_updated_at: None,
            target_updated_at: None,
            last_synced_at: None,
        });
        // A skip never downgrades an already successful row.
        if record.status != EntityStatus::Success {
            record.status = EntityStatus::Skipped;
            if let Some(target_id) = target_id {
                record.target_id = Some(target_id.to_string());
            }
        }
        Ok(())
    }

    async fn get_record(
        &self,
        run_id: Uuid,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<EntityRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .entities
            .get(&(run_id, entity_type, source_id.to_string()))
            .cloned())
    }

    async fn counts(&self, run_id: Uuid) -> Result<BTreeMap<EntityType, StageCounters>> {
        let inner = self.lock()?;
        let mut counts: BTreeMap<EntityType, StageCounters> = BTreeMap::new();
        for record in inner.entities.values().filter(|r| r.run_id == run_id) {
            counts
                .entry(record.entity_type)
                .or_default()
                .bump(record.status);
        }
        Ok(counts)
    }

    async fn record_log(&self, record: LogRecord) -> Result<()> {
        self.lock()?.logs.push(record);
        Ok(())
    }

    async fn query_logs(
        &self,
        run_id: Uuid,
        filter: &LogFilter,
        page: Page,
    ) -> Result<Vec<LogRecord>> {
        let inner = self.lock()?;
        let min_level = filter.min_level.unwrap_or(LogLevel::Debug);
        Ok(inner
            .logs
            .iter()
            .rev()
            .filter(|l| l.run_id == run_id)
            .filter(|l| l.level >= min_level)
            .filter(|l| {
                filter
                    .entity_type
                    .map(|t| l.entity_type == Some(t))
                    .unwrap_or(true)
            })
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn identity_get(
        &self,
        entity_type: EntityType,
        source_uuid: &str,
    ) -> Result<Option<IdentityEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .identity
            .get(&(entity_type, source_uuid.to_string()))
            .cloned())
    }

    async fn identity_put(
        &self,
        entity_type: EntityType,
        source_uuid: &str,
        entry: IdentityEntry,
    ) -> Result<()> {
        self.lock()?
            .identity
            .insert((entity_type, source_uuid.to_string()), entry);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
