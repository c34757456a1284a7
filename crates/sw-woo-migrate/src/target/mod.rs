//! Target API call contracts.
//!
//! The orchestrator only depends on the [`CommerceTarget`] and
//! [`MediaTarget`] traits; the reqwest-backed reference clients live in
//! [`woocommerce`] and [`wordpress`]. Tests substitute in-memory fakes.

pub mod woocommerce;
pub mod wordpress;

pub use woocommerce::WooCommerceClient;
pub use wordpress::WordPressMediaClient;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{MigrateError, Result};
use crate::state::EntityType;

/// Commerce platform write/read contract (WooCommerce REST).
#[async_trait]
pub trait CommerceTarget: Send + Sync {
    /// Create an entity, or overwrite it when a target id is already known
    /// (source-wins conflict handling). Returns the target identifier.
    async fn write(
        &self,
        entity: EntityType,
        existing_target_id: Option<&str>,
        payload: &Value,
    ) -> Result<String>;

    /// Paginated read of existing target entities.
    async fn list(&self, entity: EntityType, page: u32, per_page: u32) -> Result<Vec<Value>>;
}

/// Media/content platform contract (WordPress REST).
#[async_trait]
pub trait MediaTarget: Send + Sync {
    /// Upload a binary asset; returns the numeric media identifier.
    async fn upload(&self, filename: &str, mime: &str, bytes: Bytes, alt_text: &str)
        -> Result<u64>;

    /// Resolve a media id to its public URL, `None` when unknown.
    async fn media_url(&self, media_id: u64) -> Result<Option<String>>;
}

/// Whether an error is worth another attempt: network-level failures and
/// 5xx/429 responses. Auth failures and validation errors are not.
fn is_transient(error: &MigrateError) -> bool {
    match error {
        MigrateError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        MigrateError::Api { status, .. } => *status == 429 || (500..=599).contains(status),
        _ => false,
    }
}

/// Run an API call with a small bounded retry budget for transient
/// failures. Retry exhaustion returns the last error; the caller records
/// it per entity, never as a run abort.
pub(crate) async fn with_retries<T, F, Fut>(
    max_retries: u32,
    context: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries && is_transient(&e) => {
                attempt += 1;
                let backoff = Duration::from_millis(200 * u64::from(attempt));
                warn!(
                    context,
                    attempt,
                    max_retries,
                    "transient target failure, retrying in {:?}: {}",
                    backoff,
                    e
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
