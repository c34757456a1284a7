//! Configuration type definitions.

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (Shopware 6 MySQL).
    pub source: SourceDbConfig,

    /// Target commerce API configuration (WooCommerce REST).
    pub target: WooApiConfig,

    /// Target media/content API configuration (WordPress REST).
    pub media: WpApiConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationOptions,
}

/// Source database (Shopware 6 MySQL) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDbConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Base URL of the Shopware installation, used to resolve media paths.
    pub base_url: String,
}

/// Target commerce API (WooCommerce REST) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WooApiConfig {
    /// Store base URL (e.g. `https://shop.example.com`).
    pub base_url: String,

    /// REST consumer key.
    pub consumer_key: String,

    /// REST consumer secret.
    pub consumer_secret: String,

    /// WooCommerce major version on the target, drives credential
    /// hash portability (see `transform::password`).
    pub major_version: u32,
}

/// Target media/content API (WordPress REST) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WpApiConfig {
    /// WordPress base URL (usually the same host as the store).
    pub base_url: String,

    /// Username for basic authentication.
    pub user: String,

    /// Application password.
    pub application_password: String,
}

/// Synchronization mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Process every source entity.
    #[default]
    Full,
    /// Reprocess only entities whose source timestamp advanced past the
    /// last successful sync.
    Incremental,
}

/// Conflict resolution strategy when the target already holds data.
///
/// Only `source-wins` has defined semantics: source data always overwrites
/// the target regardless of target-side edits. Other strategies are an
/// extension point; configuration validation rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    SourceWins,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Synchronization mode (default: full).
    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Conflict resolution strategy (default: source-wins).
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Simulate target writes instead of performing them.
    #[serde(default)]
    pub dry_run: bool,

    /// Rows fetched per source read (default: 200).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-request timeout for target API calls in seconds (default: 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retry budget for transient target failures (default: 2).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            conflict_strategy: ConflictStrategy::default(),
            dry_run: false,
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_batch_size() -> usize {
    200
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}
