//! Migration orchestrator - run lifecycle and stage coordination.
//!
//! Drives the fixed stage sequence against the source reader, transform
//! layer and target clients, persisting every outcome through the state
//! backend. Control commands (pause, resume, cancel) arrive over a watch
//! channel and take effect at entity boundaries, so an interrupted run
//! can always resume from persisted entity status alone.

mod stages;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, MigrationOptions, SyncMode};
use crate::error::{MigrateError, Result};
use crate::schema::queries::BatchCursor;
use crate::schema::SchemaVersionDetector;
use crate::source::{connect_pool, MysqlSchemaProbe, ShopwareSource, SourceEntity, SourceReader};
use crate::state::{
    EntityType, IdentityEntry, LogFilter, LogLevel, LogRecord, Page, Run, RunStatus, StageCounters,
    StateBackend, STAGE_ORDER,
};
use crate::target::{CommerceTarget, WooCommerceClient, WordPressMediaClient};
use crate::transform::{ContentMigrator, ImageMigrator, ImageResolver, PasswordMigrator};

use stages::StageContext;

/// Source connection pool size.
const SOURCE_POOL_SIZE: u32 = 5;

/// Control flags delivered to an executing run.
#[derive(Debug, Clone, Copy, Default)]
struct ControlState {
    pause: bool,
    cancel: bool,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Run identifier.
    pub run_id: Uuid,

    /// Final status.
    pub status: RunStatus,

    /// Whether target writes were simulated.
    pub is_dry_run: bool,

    /// When processing started.
    pub started_at: DateTime<Utc>,

    /// When processing finished.
    pub finished_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Final per-stage counters.
    pub stages: BTreeMap<EntityType, StageCounters>,

    /// Entities written to the target.
    pub migrated: u64,

    /// Entities that failed.
    pub failed: u64,

    /// Entities skipped (idempotency, incremental no-op, dry run).
    pub skipped: u64,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Point-in-time view of a run for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run: Run,
    pub stages: BTreeMap<EntityType, StageCounters>,
    pub elapsed_seconds: f64,

    /// Estimated seconds until the touched entities drain, `None` until
    /// enough progress exists to extrapolate.
    pub eta_seconds: Option<f64>,

    /// Most recent error-level log records, newest first.
    pub recent_errors: Vec<LogRecord>,
}

/// Migration orchestrator.
pub struct Orchestrator {
    state: Arc<dyn StateBackend>,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn CommerceTarget>,
    content: Arc<ContentMigrator>,
    images: Arc<dyn ImageResolver>,
    passwords: PasswordMigrator,
    options: MigrationOptions,
    target_major: u32,
    source_base_url: String,
    incremental_since: Option<DateTime<Utc>>,
    controls: Mutex<HashMap<Uuid, watch::Sender<ControlState>>>,
}

impl Orchestrator {
    /// Assemble an orchestrator from already-built components. Tests and
    /// embedders use this with fakes; production wiring goes through
    /// [`Orchestrator::connect`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<dyn StateBackend>,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn CommerceTarget>,
        content: Arc<ContentMigrator>,
        images: Arc<dyn ImageResolver>,
        options: MigrationOptions,
        target_major: u32,
        source_base_url: impl Into<String>,
    ) -> Self {
        Self {
            state,
            source,
            target,
            content,
            images,
            passwords: PasswordMigrator::new(),
            options,
            target_major,
            source_base_url: source_base_url.into(),
            incremental_since: None,
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to the configured source and targets, detect the source
    /// schema generation, and wire the full component stack.
    pub async fn connect(config: &Config, state: Arc<dyn StateBackend>) -> Result<Self> {
        let pool = connect_pool(&config.source, SOURCE_POOL_SIZE).await?;

        let probe = Arc::new(MysqlSchemaProbe::new(
            pool.clone(),
            config.source.database.clone(),
        ));
        let schema = SchemaVersionDetector::new(probe).detect().await;
        info!(version = schema.version.as_str(), "detected source schema generation");
        for warning in &schema.warnings {
            warn!("{}", warning);
        }

        let source = ShopwareSource::new(pool, schema.features);
        let target = Arc::new(WooCommerceClient::new(&config.target, &config.migration)?);
        let media = Arc::new(WordPressMediaClient::new(&config.media, &config.migration)?);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.migration.request_timeout_secs))
            .build()?;
        let images: Arc<dyn ImageResolver> =
            Arc::new(ImageMigrator::new(http, media, state.clone()));
        let content = Arc::new(ContentMigrator::new(images.clone()));

        Ok(Self::new(
            state,
            source,
            target,
            content,
            images,
            config.migration.clone(),
            config.target.major_version,
            config.source.base_url.clone(),
        ))
    }

    /// Restrict incremental runs to source rows touched after the given
    /// watermark. Full runs ignore it.
    pub fn with_incremental_since(mut self, since: DateTime<Utc>) -> Self {
        self.incremental_since = Some(since);
        self
    }

    // ---- control surface --------------------------------------------------

    /// Create and persist a new pending run using the configured sync mode
    /// and dry-run flag.
    pub async fn create_run(&self, name: &str) -> Result<Run> {
        let mut run = Run::new(name, self.options.sync_mode, self.options.dry_run);
        run.conflict_strategy = self.options.conflict_strategy;
        self.state.create_run(run.clone()).await?;
        info!(run_id = %run.id, name, "run created");
        Ok(run)
    }

    /// Pause an executing run at the next entity boundary.
    pub fn pause(&self, run_id: Uuid) -> Result<()> {
        self.signal(run_id, |s| s.pause = true)
    }

    /// Resume a paused run.
    pub fn resume(&self, run_id: Uuid) -> Result<()> {
        self.signal(run_id, |s| s.pause = false)
    }

    /// Cancel an executing run. Cancellation is terminal: the run finishes
    /// as failed and a new run must be created to continue.
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        self.signal(run_id, |s| s.cancel = true)
    }

    /// Current run status with counters, timing and recent errors.
    pub async fn get_status(&self, run_id: Uuid) -> Result<RunStatusReport> {
        let run = self
            .state
            .get_run(run_id)
            .await?
            .ok_or_else(|| MigrateError::Lifecycle(format!("unknown run {}", run_id)))?;

        let stages = self.state.counts(run_id).await?;
        let processed: u64 = stages.values().map(StageCounters::processed).sum();
        let remaining: u64 = stages.values().map(|c| c.pending + c.running).sum();

        let reference = run.finished_at.unwrap_or_else(Utc::now);
        let elapsed_seconds = run
            .started_at
            .map(|t| (reference - t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        let eta_seconds = if processed > 0 && remaining > 0 && elapsed_seconds > 0.0 {
            Some(elapsed_seconds / processed as f64 * remaining as f64)
        } else {
            None
        };

        let recent_errors = self
            .state
            .query_logs(
                run_id,
                &LogFilter {
                    entity_type: None,
                    min_level: Some(LogLevel::Error),
                },
                Page {
                    offset: 0,
                    limit: 10,
                },
            )
            .await?;

        Ok(RunStatusReport {
            run,
            stages,
            elapsed_seconds,
            eta_seconds,
            recent_errors,
        })
    }

    /// Query the run's log records with filters and pagination.
    pub async fn query_logs(
        &self,
        run_id: Uuid,
        filter: &LogFilter,
        page: Page,
    ) -> Result<Vec<LogRecord>> {
        self.state.query_logs(run_id, filter, page).await
    }

    // ---- execution --------------------------------------------------------

    /// Execute a run to completion.
    ///
    /// Re-executing a non-terminal run resumes it: entities already
    /// successful under this run are left untouched and everything else is
    /// reprocessed.
    pub async fn execute(&self, run_id: Uuid) -> Result<MigrationResult> {
        let mut run = self
            .state
            .get_run(run_id)
            .await?
            .ok_or_else(|| MigrateError::Lifecycle(format!("unknown run {}", run_id)))?;
        if run.status.is_terminal() {
            return Err(MigrateError::Lifecycle(format!(
                "run {} already finished as {}",
                run_id,
                crate::state::backend::run_status_to_str(run.status)
            )));
        }

        let mut rx = self.register(run_id)?;
        let outcome = self.drive(&mut run, &mut rx).await;
        self.unregister(run_id);

        let finished_at = Utc::now();
        run.finished_at = Some(finished_at);

        let cancelled = match outcome {
            Ok(cancelled) => cancelled,
            Err(e) => {
                run.status = RunStatus::Failed;
                // The abort error is what matters here, not the state
                // writes performed on the way out.
                let _ = self.state.update_run(&run).await;
                let _ = self
                    .state
                    .record_log(LogRecord::run_level(
                        run.id,
                        LogLevel::Error,
                        format!("run aborted: {}", e),
                    ))
                    .await;
                error!(run_id = %run.id, "run aborted: {}", e);
                return Err(e);
            }
        };

        if cancelled {
            self.state
                .record_log(LogRecord::run_level(
                    run.id,
                    LogLevel::Warning,
                    "run cancelled",
                ))
                .await?;
            warn!(run_id = %run.id, "run cancelled");
        }

        // Per-entity failures leave the run completed; their records and
        // counters carry the detail. Failed is reserved for aborts and
        // cancellation.
        run.status = if cancelled {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let stages = self.state.counts(run.id).await?;
        let migrated: u64 = stages.values().map(|c| c.success).sum();
        let failed: u64 = stages.values().map(|c| c.failed).sum();
        let skipped: u64 = stages.values().map(|c| c.skipped).sum();
        if migrated > 0 && !run.is_dry_run {
            run.last_sync_at = Some(finished_at);
        }
        self.state.update_run(&run).await?;

        let started_at = run.started_at.unwrap_or(run.created_at);
        let duration_seconds = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;

        self.state
            .record_log(LogRecord::run_level(
                run.id,
                LogLevel::Info,
                format!(
                    "run finished: {} migrated, {} failed, {} skipped in {:.1}s",
                    migrated, failed, skipped, duration_seconds
                ),
            ))
            .await?;
        info!(
            run_id = %run.id,
            status = crate::state::backend::run_status_to_str(run.status),
            migrated,
            failed,
            skipped,
            "run finished in {:.1}s",
            duration_seconds
        );

        Ok(MigrationResult {
            run_id: run.id,
            status: run.status,
            is_dry_run: run.is_dry_run,
            started_at,
            finished_at,
            duration_seconds,
            stages,
            migrated,
            failed,
            skipped,
        })
    }

    /// Stage loop. Returns early only for connectivity-level failures;
    /// per-entity errors are recorded and the loop continues. `Ok(true)`
    /// means the run was cancelled.
    async fn drive(
        &self,
        run: &mut Run,
        rx: &mut watch::Receiver<ControlState>,
    ) -> Result<bool> {
        run.status = if run.is_dry_run {
            RunStatus::DryRun
        } else {
            RunStatus::Running
        };
        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        self.state.update_run(run).await?;
        self.state
            .record_log(LogRecord::run_level(
                run.id,
                LogLevel::Info,
                format!(
                    "run started ({:?} sync{})",
                    run.sync_mode,
                    if run.is_dry_run { ", dry run" } else { "" }
                ),
            ))
            .await?;
        info!(run_id = %run.id, dry_run = run.is_dry_run, "run started");

        let watermark = match run.sync_mode {
            SyncMode::Incremental => self.incremental_since,
            SyncMode::Full => None,
        };

        for &entity in STAGE_ORDER {
            if self.wait_if_paused(run, rx).await? {
                return Ok(true);
            }

            let mut cursor: Option<BatchCursor> = None;
            loop {
                let batch = self
                    .source
                    .fetch_batch(entity, cursor.as_ref(), watermark, self.options.batch_size)
                    .await?;
                if batch.is_empty() {
                    break;
                }
                let drained = batch.len() < self.options.batch_size;
                cursor = batch.last().map(|e| BatchCursor {
                    id: e.source_id.clone(),
                    rank: e.sort_rank,
                });

                for item in &batch {
                    if self.wait_if_paused(run, rx).await? {
                        return Ok(true);
                    }
                    self.process_entity(run, entity, item).await?;
                }

                if drained {
                    break;
                }
            }

            let counters = self
                .state
                .counts(run.id)
                .await?
                .get(&entity)
                .copied()
                .unwrap_or_default();
            info!(
                entity = %entity,
                success = counters.success,
                failed = counters.failed,
                skipped = counters.skipped,
                "stage complete"
            );
        }

        Ok(false)
    }

    /// Process one source entity. Entity-level failures are recorded and
    /// return `Ok`; only connectivity-level errors propagate.
    async fn process_entity(
        &self,
        run: &Run,
        entity: EntityType,
        item: &SourceEntity,
    ) -> Result<()> {
        // Resume path: successful entities from an earlier attempt of this
        // run are never reprocessed.
        if self
            .state
            .already_migrated(run.id, entity, &item.source_id)
            .await?
        {
            return Ok(());
        }

        let identity = self.state.identity_get(entity, &item.source_id).await?;

        // Incremental no-op: the source row has not moved past the last
        // successful sync of this entity.
        if run.sync_mode == SyncMode::Incremental {
            if let (Some(entry), Some(source_ts)) = (&identity, item.updated_at) {
                if entry.last_synced_at.is_some_and(|last| source_ts <= last) {
                    self.state
                        .mark_skipped(run.id, entity, &item.source_id, Some(&entry.target_id))
                        .await?;
                    debug!(entity = %entity, source_id = %item.source_id, "unchanged, skipped");
                    return Ok(());
                }
            }
        }

        self.state
            .mark_running(run.id, entity, &item.source_id, &item.payload, item.updated_at)
            .await?;

        let ctx = StageContext {
            run,
            state: self.state.as_ref(),
            content: self.content.as_ref(),
            images: self.images.as_ref(),
            passwords: &self.passwords,
            source_base_url: &self.source_base_url,
            target_major: self.target_major,
        };

        let payload = match stages::build_payload(entity, &item.source_id, &item.payload, &ctx)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                self.record_entity_failure(run, entity, &item.source_id, &e)
                    .await?;
                return Ok(());
            }
        };

        if run.is_dry_run {
            self.state
                .mark_skipped(
                    run.id,
                    entity,
                    &item.source_id,
                    identity.as_ref().map(|e| e.target_id.as_str()),
                )
                .await?;
            self.state
                .record_log(LogRecord::entity_level(
                    run.id,
                    entity,
                    &item.source_id,
                    LogLevel::Info,
                    "dry run: write simulated",
                ))
                .await?;
            return Ok(());
        }

        // Source-wins: a known target id turns the write into an overwrite.
        let existing = identity.as_ref().map(|e| e.target_id.as_str());
        match self.target.write(entity, existing, &payload).await {
            Ok(target_id) => {
                self.state
                    .set(run.id, entity, &item.source_id, &target_id)
                    .await?;
                self.state
                    .identity_put(
                        entity,
                        &item.source_id,
                        IdentityEntry {
                            target_id,
                            last_synced_at: Some(Utc::now()),
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(e) if e.is_connectivity() => {
                self.record_entity_failure(run, entity, &item.source_id, &e)
                    .await?;
                Err(e)
            }
            Err(e) => {
                self.record_entity_failure(run, entity, &item.source_id, &e)
                    .await?;
                Ok(())
            }
        }
    }

    async fn record_entity_failure(
        &self,
        run: &Run,
        entity: EntityType,
        source_id: &str,
        error: &MigrateError,
    ) -> Result<()> {
        let message = error.to_string();
        self.state
            .mark_failed(run.id, entity, source_id, &message)
            .await?;
        self.state
            .record_log(LogRecord::entity_level(
                run.id,
                entity,
                source_id,
                LogLevel::Error,
                &message,
            ))
            .await?;
        warn!(entity = %entity, source_id, "entity failed: {}", message);
        Ok(())
    }

    /// Honor pause/cancel flags at an entity boundary. Returns `true` when
    /// the run was cancelled.
    async fn wait_if_paused(
        &self,
        run: &mut Run,
        rx: &mut watch::Receiver<ControlState>,
    ) -> Result<bool> {
        let current = *rx.borrow();
        if current.cancel {
            return Ok(true);
        }
        if !current.pause {
            return Ok(false);
        }

        run.status = RunStatus::Paused;
        self.state.update_run(run).await?;
        self.state
            .record_log(LogRecord::run_level(run.id, LogLevel::Info, "run paused"))
            .await?;
        info!(run_id = %run.id, "run paused");

        loop {
            // Sender dropped means no more commands can arrive; proceed.
            if rx.changed().await.is_err() {
                break;
            }
            let state = *rx.borrow();
            if state.cancel {
                return Ok(true);
            }
            if !state.pause {
                break;
            }
        }

        run.status = if run.is_dry_run {
            RunStatus::DryRun
        } else {
            RunStatus::Running
        };
        self.state.update_run(run).await?;
        self.state
            .record_log(LogRecord::run_level(run.id, LogLevel::Info, "run resumed"))
            .await?;
        info!(run_id = %run.id, "run resumed");
        Ok(false)
    }

    // ---- control channel plumbing -----------------------------------------

    fn register(&self, run_id: Uuid) -> Result<watch::Receiver<ControlState>> {
        let mut controls = self
            .controls
            .lock()
            .map_err(|_| MigrateError::State("control registry lock poisoned".into()))?;
        if controls.contains_key(&run_id) {
            return Err(MigrateError::Lifecycle(format!(
                "run {} is already executing",
                run_id
            )));
        }
        let (tx, rx) = watch::channel(ControlState::default());
        controls.insert(run_id, tx);
        Ok(rx)
    }

    fn unregister(&self, run_id: Uuid) {
        if let Ok(mut controls) = self.controls.lock() {
            controls.remove(&run_id);
        }
    }

    fn signal(&self, run_id: Uuid, apply: impl FnOnce(&mut ControlState)) -> Result<()> {
        let controls = self
            .controls
            .lock()
            .map_err(|_| MigrateError::State("control registry lock poisoned".into()))?;
        let tx = controls.get(&run_id).ok_or_else(|| {
            MigrateError::Lifecycle(format!("run {} is not executing", run_id))
        })?;
        tx.send_modify(apply);
        Ok(())
    }
}
