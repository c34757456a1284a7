//! Shopware 6 source reader.
//!
//! Implements the [`SourceReader`] trait over a sqlx MySQL pool. Query
//! text comes from [`crate::schema::queries`]; this module only executes
//! it and maps rows into JSON payloads the transform layer consumes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, Row};
use tracing::{debug, info};

use crate::config::SourceDbConfig;
use crate::error::Result;
use crate::schema::queries::{select_batch, BatchCursor};
use crate::schema::{SchemaFeatures, SchemaProbe};
use crate::state::EntityType;

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// One source row, keyed by its lowercase-hex identifier.
#[derive(Debug, Clone)]
pub struct SourceEntity {
    pub source_id: String,
    pub updated_at: Option<DateTime<Utc>>,
    /// Rank the row's stage orders by before the id, when it has one
    /// (category tree level, product parent-before-variant flag). Carried
    /// into the next page's cursor.
    pub sort_rank: Option<i64>,
    pub payload: Value,
}

/// Batched, keyset-paginated access to source entities.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Fetch the next batch of one entity type.
    ///
    /// `after` is an exclusive keyset cursor built from the last row of
    /// the previous page; `updated_since` restricts to rows touched after
    /// the watermark (incremental mode). Rows come back in cursor order,
    /// so an empty result means the stage is drained.
    async fn fetch_batch(
        &self,
        entity: EntityType,
        after: Option<&BatchCursor>,
        updated_since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<SourceEntity>>;
}

/// Open a connection pool against the source database and verify it
/// answers before handing it out.
pub async fn connect_pool(config: &SourceDbConfig, max_conns: u32) -> Result<MySqlPool> {
    let options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user)
        .password(&config.password)
        .ssl_mode(MySqlSslMode::Preferred);

    let pool = MySqlPoolOptions::new()
        .max_connections(max_conns)
        .acquire_timeout(POOL_CONNECTION_TIMEOUT)
        .connect_with(options)
        .await?;

    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    info!(
        "Connected to source database: {}:{}/{}",
        config.host, config.port, config.database
    );
    Ok(pool)
}

/// Schema introspection over `INFORMATION_SCHEMA`, scoped to the
/// connected database.
pub struct MysqlSchemaProbe {
    pool: MySqlPool,
    database: String,
}

impl MysqlSchemaProbe {
    pub fn new(pool: MySqlPool, database: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
        }
    }
}

#[async_trait]
impl SchemaProbe for MysqlSchemaProbe {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let query = r#"
            SELECT COUNT(*) AS cnt
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        "#;
        let row: MySqlRow = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("cnt") > 0)
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let query = r#"
            SELECT COUNT(*) AS cnt
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND COLUMN_NAME = ?
        "#;
        let row: MySqlRow = sqlx::query(query)
            .bind(&self.database)
            .bind(table)
            .bind(column)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("cnt") > 0)
    }
}

/// Shopware 6 reader bound to one detected feature set.
pub struct ShopwareSource {
    pool: MySqlPool,
    features: SchemaFeatures,
}

impl ShopwareSource {
    /// Build a reader from an existing pool and the detected schema
    /// features. The features pin which query variants this reader issues
    /// for the lifetime of a run.
    pub fn new(pool: MySqlPool, features: SchemaFeatures) -> Arc<Self> {
        Arc::new(Self { pool, features })
    }
}

#[async_trait]
impl SourceReader for ShopwareSource {
    async fn fetch_batch(
        &self,
        entity: EntityType,
        after: Option<&BatchCursor>,
        updated_since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<SourceEntity>> {
        let sql = select_batch(entity, &self.features, after, updated_since.as_ref(), limit);
        debug!(entity = %entity, limit, "fetching source batch");

        let rows: Vec<MySqlRow> = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(record) = row_to_entity(row) {
                entities.push(record);
            }
        }
        Ok(entities)
    }
}

/// Convert one row to a [`SourceEntity`]. Rows without an `id` column are
/// dropped; everything else becomes a JSON payload keyed by column alias.
fn row_to_entity(row: &MySqlRow) -> Option<SourceEntity> {
    let mut map = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), decode_column(row, i, column.name()));
    }

    let source_id = map.get("id").and_then(Value::as_str)?.to_string();
    let updated_at = map
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let sort_rank = map.get("sort_rank").and_then(Value::as_i64);

    Some(SourceEntity {
        source_id,
        updated_at,
        sort_rank,
        payload: Value::Object(map),
    })
}

/// Best-effort column decode into JSON.
///
/// Tries the concrete types the batch queries produce, most specific
/// first. Columns no decoder accepts become null rather than failing the
/// batch.
fn decode_column(row: &MySqlRow, index: usize, name: &str) -> Value {
    // Aggregated line items and category ids arrive as MySQL JSON
    // documents.
    if name == "line_items" || name == "category_ids" {
        if let Ok(Some(v)) = row.try_get::<Option<Value>, _>(index) {
            return v;
        }
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(index) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(index) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(index) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(index) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(index) {
        return Value::from(v.and_utc().to_rfc3339());
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(index) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Value::from(hex::encode(v));
    }
    Value::Null
}
