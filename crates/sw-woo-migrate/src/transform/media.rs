//! Binary asset re-hosting from source media storage to the target media
//! API.
//!
//! A failed image migration never propagates: the caller receives `None`
//! and drops the reference, so a single dead asset cannot fail a run. The
//! cross-run identity map short-circuits re-uploads of assets that were
//! already re-hosted by an earlier run.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::{EntityType, IdentityEntry, StateBackend};
use crate::target::MediaTarget;

/// Derive a MIME type from a file extension.
///
/// Fixed lookup only, no content sniffing; unknown extensions degrade to
/// `application/octet-stream`.
pub fn mime_from_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Build a public URL for a Shopware media file.
///
/// Joins base URL, `media/`, the relative path and `stem.extension` with
/// exactly one separating slash at each junction, regardless of trailing
/// slashes in the inputs.
pub fn build_shopware_media_url(
    base_url: &str,
    relative_path: &str,
    filename_stem: &str,
    extension: &str,
) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = relative_path.trim_matches('/');
    let stem = filename_stem.trim_start_matches('/');

    if relative.is_empty() {
        format!("{}/media/{}.{}", base, stem, extension)
    } else {
        format!("{}/media/{}/{}.{}", base, relative, stem, extension)
    }
}

/// Resolves an image reference to a target-hosted URL.
///
/// [`ContentMigrator`](super::ContentMigrator) depends on this seam so
/// markup rewriting is testable without network access.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// Re-host the image and return its target URL, or `None` when the
    /// reference should be dropped.
    async fn resolve(&self, source_url: &str, alt_text: &str) -> Option<String>;
}

/// Re-hosts binary assets from source to target media storage.
pub struct ImageMigrator {
    http: reqwest::Client,
    media: Arc<dyn MediaTarget>,
    state: Arc<dyn StateBackend>,
}

impl ImageMigrator {
    pub fn new(
        http: reqwest::Client,
        media: Arc<dyn MediaTarget>,
        state: Arc<dyn StateBackend>,
    ) -> Self {
        Self { http, media, state }
    }

    /// Fetch bytes from the source location and upload them to the target
    /// media API.
    ///
    /// Returns `None` (never an error) on permanent failure so the caller
    /// can drop the reference and continue.
    pub async fn migrate_from_url(&self, source_url: &str, alt_text: &str) -> Option<u64> {
        // Identity-map short-circuit: this asset may already be hosted on
        // the target from an earlier run.
        if let Ok(Some(entry)) = self
            .state
            .identity_get(EntityType::Media, source_url)
            .await
        {
            if let Ok(id) = entry.target_id.parse::<u64>() {
                debug!(source_url, media_id = id, "media already re-hosted, reusing");
                return Some(id);
            }
        }

        let response = match self.http.get(source_url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(source_url, "failed to fetch source media: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                source_url,
                status = response.status().as_u16(),
                "source media fetch returned non-success status"
            );
            return None;
        }
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(source_url, "failed to read source media body: {}", e);
                return None;
            }
        };

        let (filename, extension) = filename_from_url(source_url);
        let mime = mime_from_extension(&extension);

        let media_id = match self.media.upload(&filename, mime, bytes, alt_text).await {
            Ok(id) => id,
            Err(e) => {
                warn!(source_url, "media upload failed: {}", e);
                return None;
            }
        };

        if let Err(e) = self
            .state
            .identity_put(
                EntityType::Media,
                source_url,
                IdentityEntry {
                    target_id: media_id.to_string(),
                    last_synced_at: Some(chrono::Utc::now()),
                },
            )
            .await
        {
            warn!(source_url, "failed to record media identity mapping: {}", e);
        }

        Some(media_id)
    }

    /// Resolve a target media id to its public URL, or `None` when the
    /// target does not know the id.
    pub async fn target_media_url(&self, media_id: u64) -> Option<String> {
        match self.media.media_url(media_id).await {
            Ok(url) => url,
            Err(e) => {
                warn!(media_id, "media URL lookup failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ImageResolver for ImageMigrator {
    async fn resolve(&self, source_url: &str, alt_text: &str) -> Option<String> {
        let media_id = self.migrate_from_url(source_url, alt_text).await?;
        self.target_media_url(media_id).await
    }
}

/// Split a URL into an upload filename and its extension.
fn filename_from_url(url: &str) -> (String, String) {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or("");

    let name = if path.is_empty() { "image" } else { path };
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => (name.to_string(), ext.to_string()),
        _ => (name.to_string(), String::new()),
    }
}
