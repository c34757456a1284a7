//! # sw-woo-migrate
//!
//! Shopware 6 to WooCommerce migration engine.
//!
//! This library reads a Shopware 6 MySQL database and rebuilds its
//! catalog, customers and order history through the WooCommerce and
//! WordPress REST APIs, with support for:
//!
//! - **Schema generation detection** (6.5 / 6.6 / 6.7) driving versioned
//!   read queries
//! - **Idempotent, resumable runs** persisted through a state backend
//! - **Incremental synchronization** via source timestamps and a
//!   cross-run identity map
//! - **Content migration**: markup sanitation and image re-hosting
//! - **Pause, resume and cancel** at entity boundaries
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sw_woo_migrate::{Config, MemoryBackend, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> sw_woo_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let state = Arc::new(MemoryBackend::new());
//!     let orchestrator = Orchestrator::connect(&config, state).await?;
//!     let run = orchestrator.create_run("initial import").await?;
//!     let result = orchestrator.execute(run.id).await?;
//!     println!("Migrated {} entities", result.migrated);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod schema;
pub mod source;
pub mod state;
pub mod target;
pub mod transform;

// Re-exports for convenient access
pub use config::{Config, ConflictStrategy, MigrationOptions, SyncMode};
pub use error::{MigrateError, Result};
pub use orchestrator::{MigrationResult, Orchestrator, RunStatusReport};
pub use schema::queries::BatchCursor;
pub use schema::{SchemaInfo, SchemaProbe, SchemaVersion, SchemaVersionDetector};
pub use source::{ShopwareSource, SourceEntity, SourceReader};
pub use state::{EntityType, MemoryBackend, Run, RunStatus, StateBackend};
pub use target::{CommerceTarget, MediaTarget, WooCommerceClient, WordPressMediaClient};
pub use transform::{ContentMigrator, ImageMigrator, ImageResolver, PasswordMigrator};
