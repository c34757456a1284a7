//! End-to-end orchestrator tests against in-memory fakes.
//!
//! These exercise the run lifecycle (failure isolation, dry run, resume,
//! pause, cancel, incremental skips) without a database or HTTP target.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use sw_woo_migrate::error::MigrateError;
use sw_woo_migrate::state::{EntityStatus, IdentityEntry, LogFilter, Page};
use sw_woo_migrate::transform::ContentMigrator;
use sw_woo_migrate::{
    BatchCursor, CommerceTarget, EntityType, ImageResolver, MemoryBackend, MigrationOptions,
    Orchestrator, Result, RunStatus, SourceEntity, SourceReader, StateBackend, SyncMode,
};

/// Fixed per-type rows, served with keyset pagination like the real
/// reader.
struct FakeSource {
    rows: HashMap<EntityType, Vec<SourceEntity>>,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    fn with(mut self, entity: EntityType, rows: Vec<SourceEntity>) -> Self {
        self.rows.insert(entity, rows);
        self
    }
}

#[async_trait]
impl SourceReader for FakeSource {
    async fn fetch_batch(
        &self,
        entity: EntityType,
        after: Option<&BatchCursor>,
        updated_since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<SourceEntity>> {
        let mut rows: Vec<SourceEntity> = self
            .rows
            .get(&entity)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|row| {
                after.map_or(true, |cursor| {
                    (row.sort_rank, row.source_id.as_str()) > (cursor.rank, cursor.id.as_str())
                })
            })
            .filter(|row| match (updated_since, row.updated_at) {
                (Some(since), Some(ts)) => ts > since,
                _ => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            (a.sort_rank, a.source_id.as_str()).cmp(&(b.sort_rank, b.source_id.as_str()))
        });
        rows.truncate(limit);
        Ok(rows)
    }
}

#[derive(Default)]
struct FakeTargetInner {
    writes: Vec<(EntityType, Option<String>, Value)>,
    fail_names: HashSet<String>,
    auth_broken: bool,
}

/// Records writes and assigns sequential numeric ids.
struct FakeTarget {
    inner: Mutex<FakeTargetInner>,
    next_id: AtomicU64,
    gate: Option<WriteGate>,
}

/// Handshake for holding the run inside a write: each write announces
/// itself on `entered`, then waits for one `exit` permit.
#[derive(Clone)]
struct WriteGate {
    entered: Arc<tokio::sync::Semaphore>,
    exit: Arc<tokio::sync::Semaphore>,
}

impl WriteGate {
    fn new() -> Self {
        Self {
            entered: Arc::new(tokio::sync::Semaphore::new(0)),
            exit: Arc::new(tokio::sync::Semaphore::new(0)),
        }
    }

    /// Block until a write is in progress.
    async fn wait_entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    /// Allow `n` writes to finish.
    fn release(&self, n: usize) {
        self.exit.add_permits(n);
    }
}

impl FakeTarget {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeTargetInner::default()),
            next_id: AtomicU64::new(1),
            gate: None,
        })
    }

    fn gated(gate: WriteGate) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeTargetInner::default()),
            next_id: AtomicU64::new(1),
            gate: Some(gate),
        })
    }

    fn fail_on_name(&self, name: &str) {
        self.inner.lock().unwrap().fail_names.insert(name.into());
    }

    fn break_auth(&self) {
        self.inner.lock().unwrap().auth_broken = true;
    }

    fn writes(&self) -> Vec<(EntityType, Option<String>, Value)> {
        self.inner.lock().unwrap().writes.clone()
    }
}

#[async_trait]
impl CommerceTarget for FakeTarget {
    async fn write(
        &self,
        entity: EntityType,
        existing_target_id: Option<&str>,
        payload: &Value,
    ) -> Result<String> {
        if let Some(gate) = &self.gate {
            gate.entered.add_permits(1);
            let permit = gate.exit.acquire().await.map_err(|_| {
                MigrateError::api(503, "gate closed", "fake target")
            })?;
            permit.forget();
        }

        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.auth_broken {
                return Err(MigrateError::api(401, "bad credentials", "fake target"));
            }
            if inner.fail_names.contains(&name) {
                return Err(MigrateError::api(422, "rejected by fake", "fake target"));
            }
            inner
                .writes
                .push((entity, existing_target_id.map(String::from), payload.clone()));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn list(&self, _entity: EntityType, _page: u32, _per_page: u32) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// Resolver that never re-hosts anything.
struct NullResolver;

#[async_trait]
impl ImageResolver for NullResolver {
    async fn resolve(&self, _source_url: &str, _alt_text: &str) -> Option<String> {
        None
    }
}

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn hex_id(n: u8) -> String {
    format!("{:032x}", n)
}

fn manufacturer(n: u8, name: &str) -> SourceEntity {
    SourceEntity {
        source_id: hex_id(n),
        updated_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, n as u32).unwrap()),
        sort_rank: None,
        payload: json!({ "id": hex_id(n), "name": name, "description": "" }),
    }
}

fn category(n: u8, level: i64, name: &str, parent: Option<u8>) -> SourceEntity {
    let mut payload = json!({
        "id": hex_id(n), "name": name, "description": "", "sort_rank": level,
    });
    if let Some(parent) = parent {
        payload["parent_id"] = json!(hex_id(parent));
    }
    SourceEntity {
        source_id: hex_id(n),
        updated_at: None,
        sort_rank: Some(level),
        payload,
    }
}

fn orchestrator(
    source: Arc<dyn SourceReader>,
    target: Arc<dyn CommerceTarget>,
    state: Arc<dyn StateBackend>,
    options: MigrationOptions,
) -> Orchestrator {
    let images: Arc<dyn ImageResolver> = Arc::new(NullResolver);
    let content = Arc::new(ContentMigrator::new(images.clone()));
    Orchestrator::new(
        state,
        source,
        target,
        content,
        images,
        options,
        9,
        "https://legacy.example.com",
    )
}

#[tokio::test]
async fn test_single_failure_does_not_stop_stage_or_run() {
    trace_init();
    let source = Arc::new(
        FakeSource::new()
            .with(
                EntityType::Manufacturer,
                vec![
                    manufacturer(1, "Alpha"),
                    manufacturer(2, "Broken"),
                    manufacturer(3, "Gamma"),
                ],
            )
            .with(
                EntityType::Tax,
                vec![SourceEntity {
                    source_id: hex_id(9),
                    updated_at: None,
                    sort_rank: None,
                    payload: json!({ "id": hex_id(9), "name": "Standard", "tax_rate": 19.0 }),
                }],
            ),
    );
    let target = FakeTarget::new();
    target.fail_on_name("Broken");
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = orchestrator(
        source,
        target.clone(),
        state.clone(),
        MigrationOptions::default(),
    );
    let run = engine.create_run("failure isolation").await.unwrap();
    let result = engine.execute(run.id).await.unwrap();

    // One bad entity does not fail the run; it stays visible in the
    // counters and its record.
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.migrated, 3); // two manufacturers and the tax rate
    assert_eq!(result.failed, 1);

    let persisted = state.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Completed);

    // items 1 and 3 succeeded around the failure, the later stage still ran
    let writes = target.writes();
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().any(|(e, _, _)| *e == EntityType::Tax));

    let record = state
        .get_record(run.id, EntityType::Manufacturer, &hex_id(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, EntityStatus::Failed);
    assert!(record.error_message.unwrap().contains("422"));
}

#[tokio::test]
async fn test_dry_run_records_outcomes_without_writes() {
    let source = Arc::new(FakeSource::new().with(
        EntityType::Manufacturer,
        vec![manufacturer(1, "Alpha"), manufacturer(2, "Beta")],
    ));
    let target = FakeTarget::new();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let options = MigrationOptions {
        dry_run: true,
        ..MigrationOptions::default()
    };
    let engine = orchestrator(source, target.clone(), state.clone(), options);
    let run = engine.create_run("dry run").await.unwrap();
    let result = engine.execute(run.id).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.is_dry_run);
    assert_eq!(result.skipped, 2);
    assert_eq!(result.migrated, 0);
    assert!(target.writes().is_empty());

    let record = state
        .get_record(run.id, EntityType::Manufacturer, &hex_id(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, EntityStatus::Skipped);
}

#[tokio::test]
async fn test_resume_reprocesses_only_non_success() {
    let source = Arc::new(FakeSource::new().with(
        EntityType::Manufacturer,
        vec![
            manufacturer(1, "Alpha"),
            manufacturer(2, "Beta"),
            manufacturer(3, "Gamma"),
        ],
    ));
    let target = FakeTarget::new();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = orchestrator(
        source,
        target.clone(),
        state.clone(),
        MigrationOptions::default(),
    );
    let run = engine.create_run("resume").await.unwrap();

    // First entity already succeeded in an earlier, interrupted attempt.
    state
        .mark_running(
            run.id,
            EntityType::Manufacturer,
            &hex_id(1),
            &json!({"id": hex_id(1)}),
            None,
        )
        .await
        .unwrap();
    state
        .set(run.id, EntityType::Manufacturer, &hex_id(1), "101")
        .await
        .unwrap();

    let result = engine.execute(run.id).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    // Only entities 2 and 3 hit the target.
    let written_names: Vec<String> = target
        .writes()
        .iter()
        .map(|(_, _, p)| p["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(written_names, vec!["Beta", "Gamma"]);

    // Entity 1 keeps the mapping from the earlier attempt.
    let target_id = state
        .get(run.id, EntityType::Manufacturer, &hex_id(1))
        .await
        .unwrap();
    assert_eq!(target_id.as_deref(), Some("101"));
}

#[tokio::test]
async fn test_incremental_skips_unchanged_entities() {
    let stale_ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let synced_ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

    let mut row = manufacturer(1, "Alpha");
    row.updated_at = Some(stale_ts);
    let source = Arc::new(FakeSource::new().with(EntityType::Manufacturer, vec![row]));
    let target = FakeTarget::new();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    state
        .identity_put(
            EntityType::Manufacturer,
            &hex_id(1),
            IdentityEntry {
                target_id: "7".into(),
                last_synced_at: Some(synced_ts),
            },
        )
        .await
        .unwrap();

    let options = MigrationOptions {
        sync_mode: SyncMode::Incremental,
        ..MigrationOptions::default()
    };
    let engine = orchestrator(source, target.clone(), state.clone(), options);
    let run = engine.create_run("incremental").await.unwrap();
    let result = engine.execute(run.id).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.skipped, 1);
    assert!(target.writes().is_empty());

    let record = state
        .get_record(run.id, EntityType::Manufacturer, &hex_id(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, EntityStatus::Skipped);
    assert_eq!(record.target_id.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_connectivity_failure_aborts_run() {
    let source = Arc::new(FakeSource::new().with(
        EntityType::Manufacturer,
        vec![manufacturer(1, "Alpha"), manufacturer(2, "Beta")],
    ));
    let target = FakeTarget::new();
    target.break_auth();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = orchestrator(
        source,
        target.clone(),
        state.clone(),
        MigrationOptions::default(),
    );
    let run = engine.create_run("abort").await.unwrap();
    let err = engine.execute(run.id).await.unwrap_err();
    assert!(matches!(err, MigrateError::Api { status: 401, .. }));

    let run = state.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    // The abort happened on the first entity; the second was never touched.
    assert!(state
        .get_record(run.id, EntityType::Manufacturer, &hex_id(2))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancel_stops_at_entity_boundary() {
    let source = Arc::new(FakeSource::new().with(
        EntityType::Manufacturer,
        vec![
            manufacturer(1, "Alpha"),
            manufacturer(2, "Beta"),
            manufacturer(3, "Gamma"),
        ],
    ));
    let gate = WriteGate::new();
    let target = FakeTarget::gated(gate.clone());
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = Arc::new(orchestrator(
        source,
        target.clone(),
        state.clone(),
        MigrationOptions::default(),
    ));
    let run = engine.create_run("cancel").await.unwrap();

    let exec = {
        let engine = engine.clone();
        let run_id = run.id;
        tokio::spawn(async move { engine.execute(run_id).await })
    };

    // Cancel while the first write is in flight, then let it finish. The
    // boundary before entity 2 observes the cancel flag.
    gate.wait_entered().await;
    engine.cancel(run.id).unwrap();
    gate.release(3);

    let result = exec.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(target.writes().len(), 1);

    let logs = engine
        .query_logs(run.id, &LogFilter::default(), Page::default())
        .await
        .unwrap();
    assert!(logs.iter().any(|l| l.message == "run cancelled"));

    // Cancellation is terminal.
    assert!(engine.execute(run.id).await.is_err());
}

#[tokio::test]
async fn test_pause_and_resume_mid_stage() {
    trace_init();
    let source = Arc::new(FakeSource::new().with(
        EntityType::Manufacturer,
        vec![
            manufacturer(1, "Alpha"),
            manufacturer(2, "Beta"),
            manufacturer(3, "Gamma"),
        ],
    ));
    let gate = WriteGate::new();
    let target = FakeTarget::gated(gate.clone());
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = Arc::new(orchestrator(
        source,
        target.clone(),
        state.clone(),
        MigrationOptions::default(),
    ));
    let run = engine.create_run("pause").await.unwrap();

    let exec = {
        let engine = engine.clone();
        let run_id = run.id;
        tokio::spawn(async move { engine.execute(run_id).await })
    };

    // Pause while the first write is in flight, then let it finish. The
    // boundary before entity 2 observes the pause flag.
    gate.wait_entered().await;
    engine.pause(run.id).unwrap();
    gate.release(1);

    // The run must report paused without touching entity 2.
    loop {
        let current = state.get_run(run.id).await.unwrap().unwrap();
        if current.status == RunStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(target.writes().len(), 1);

    gate.release(2);
    engine.resume(run.id).unwrap();

    let result = exec.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(target.writes().len(), 3);

    let logs = engine
        .query_logs(run.id, &LogFilter::default(), Page::default())
        .await
        .unwrap();
    assert!(logs.iter().any(|l| l.message == "run paused"));
    assert!(logs.iter().any(|l| l.message == "run resumed"));
}

#[tokio::test]
async fn test_references_resolve_across_stages() {
    let parent = category(1, 1, "Parent", None);
    let child = category(2, 2, "Child", Some(1));
    let source = Arc::new(FakeSource::new().with(EntityType::Category, vec![parent, child]));
    let target = FakeTarget::new();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = orchestrator(
        source,
        target.clone(),
        state,
        MigrationOptions::default(),
    );
    let run = engine.create_run("references").await.unwrap();
    let result = engine.execute(run.id).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let writes = target.writes();
    assert_eq!(writes.len(), 2);
    // The parent got target id 1; the child must reference it numerically.
    assert_eq!(writes[1].2["parent"], json!(1));
}

#[tokio::test]
async fn test_category_pagination_keeps_deeper_rows() {
    // A deeper category whose id sorts below the previous page's last id
    // must still appear on a later page: the cursor carries the level.
    let root = category(0xbb, 1, "Root", None);
    let leaf = category(0xaa, 2, "Leaf", Some(0xbb));
    let source = Arc::new(FakeSource::new().with(EntityType::Category, vec![root, leaf]));
    let target = FakeTarget::new();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let options = MigrationOptions {
        batch_size: 1,
        ..MigrationOptions::default()
    };
    let engine = orchestrator(source, target.clone(), state, options);
    let run = engine.create_run("category pages").await.unwrap();
    let result = engine.execute(run.id).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.migrated, 2);

    let writes = target.writes();
    let names: Vec<&str> = writes
        .iter()
        .map(|(_, _, p)| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Root", "Leaf"]);
    assert_eq!(writes[1].2["parent"], json!(1));
}

#[tokio::test]
async fn test_product_variant_and_categories_resolve() {
    let clothing = category(1, 1, "Clothing", None);
    let shirt = SourceEntity {
        source_id: hex_id(0x10),
        updated_at: None,
        sort_rank: Some(0),
        payload: json!({
            "id": hex_id(0x10), "sort_rank": 0, "name": "Shirt",
            "product_number": "SHIRT", "description": "", "active": 1,
            "stock": 5,
            "category_ids": [hex_id(1)],
        }),
    };
    let variant = SourceEntity {
        source_id: hex_id(0x02),
        updated_at: None,
        sort_rank: Some(1),
        payload: json!({
            "id": hex_id(0x02), "sort_rank": 1, "name": "Shirt M",
            "product_number": "SHIRT-M", "description": "", "active": 1,
            "parent_id": hex_id(0x10),
        }),
    };
    let source = Arc::new(
        FakeSource::new()
            .with(EntityType::Category, vec![clothing])
            .with(EntityType::Product, vec![shirt, variant]),
    );
    let target = FakeTarget::new();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = orchestrator(source, target.clone(), state, MigrationOptions::default());
    let run = engine.create_run("variants").await.unwrap();
    let result = engine.execute(run.id).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.migrated, 3);

    let writes = target.writes();
    // Category got id 1, the parent product id 2; the variant comes after
    // its parent even though its own id sorts first.
    let parent_write = &writes[1].2;
    assert_eq!(parent_write["name"], "Shirt");
    assert_eq!(parent_write["categories"], json!([{ "id": 1 }]));
    let variant_write = &writes[2].2;
    assert_eq!(variant_write["name"], "Shirt M");
    assert_eq!(variant_write["parent_id"], json!(2));
}

#[tokio::test]
async fn test_unresolved_reference_fails_single_entity() {
    let review = SourceEntity {
        source_id: hex_id(5),
        updated_at: None,
        sort_rank: None,
        payload: json!({
            "id": hex_id(5),
            "product_id": hex_id(99),
            "reviewer_name": "pat",
            "rating": 4.0,
            "content": "fine",
            "approved": 1,
        }),
    };
    let source = Arc::new(FakeSource::new().with(EntityType::Review, vec![review]));
    let target = FakeTarget::new();
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = orchestrator(
        source,
        target.clone(),
        state.clone(),
        MigrationOptions::default(),
    );
    let run = engine.create_run("bad reference").await.unwrap();
    let result = engine.execute(run.id).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.failed, 1);
    assert!(target.writes().is_empty());

    let record = state
        .get_record(run.id, EntityType::Review, &hex_id(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, EntityStatus::Failed);
    assert!(record.error_message.unwrap().contains("unresolved"));
}

#[tokio::test]
async fn test_status_report_counts_and_errors() {
    let source = Arc::new(FakeSource::new().with(
        EntityType::Manufacturer,
        vec![manufacturer(1, "Alpha"), manufacturer(2, "Broken")],
    ));
    let target = FakeTarget::new();
    target.fail_on_name("Broken");
    let state: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());

    let engine = orchestrator(
        source,
        target,
        state,
        MigrationOptions::default(),
    );
    let run = engine.create_run("status").await.unwrap();
    engine.execute(run.id).await.unwrap();

    let report = engine.get_status(run.id).await.unwrap();
    assert_eq!(report.run.status, RunStatus::Completed);
    let counters = report.stages.get(&EntityType::Manufacturer).unwrap();
    assert_eq!(counters.success, 1);
    assert_eq!(counters.failed, 1);
    assert!(!report.recent_errors.is_empty());
    assert!(report.elapsed_seconds >= 0.0);
}
