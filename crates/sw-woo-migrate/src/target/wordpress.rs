//! WordPress media REST reference client.
//!
//! Basic authentication with an application password. Uploads return the
//! numeric media identifier WordPress assigns to the attachment.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{with_retries, MediaTarget};
use crate::config::{MigrationOptions, WpApiConfig};
use crate::error::{MigrateError, Result};

/// WordPress media API client.
pub struct WordPressMediaClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    application_password: String,
    max_retries: u32,
}

impl WordPressMediaClient {
    /// Build a client from configuration.
    pub fn new(config: &WpApiConfig, options: &MigrationOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            application_password: config.application_password.clone(),
            max_retries: options.max_retries,
        })
    }

    fn media_endpoint(&self, media_id: Option<u64>) -> String {
        match media_id {
            Some(id) => format!("{}/wp-json/wp/v2/media/{}", self.base_url, id),
            None => format!("{}/wp-json/wp/v2/media", self.base_url),
        }
    }

    async fn check(response: reqwest::Response, context: &str) -> Result<Value> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(MigrateError::api(
                status.as_u16(),
                body.chars().take(300).collect::<String>(),
                context.to_string(),
            ))
        }
    }
}

#[async_trait]
impl MediaTarget for WordPressMediaClient {
    async fn upload(
        &self,
        filename: &str,
        mime: &str,
        bytes: Bytes,
        alt_text: &str,
    ) -> Result<u64> {
        let url = self.media_endpoint(None);
        let context = format!("POST {}", url);
        let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
        let url_ref = url.as_str();
        let context_ref = context.as_str();
        let disposition_ref = disposition.as_str();
        let user = self.user.as_str();
        let password = self.application_password.as_str();
        let http = &self.http;
        let bytes_ref = &bytes;

        let body = with_retries(self.max_retries, context_ref, move || async move {
            let response = http
                .post(url_ref)
                .basic_auth(user, Some(password))
                .header("Content-Type", mime)
                .header("Content-Disposition", disposition_ref)
                .body(bytes_ref.clone())
                .send()
                .await?;
            Self::check(response, context_ref).await
        })
        .await?;

        let media_id = body
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| MigrateError::api(200, "upload response missing id", context))?;

        // Alt text is a separate field on the attachment post.
        if !alt_text.is_empty() {
            let update_url = self.media_endpoint(Some(media_id));
            let update_context = format!("POST {}", update_url);
            let alt_body = json!({ "alt_text": alt_text });
            let url_ref = update_url.as_str();
            let context_ref = update_context.as_str();
            let body_ref = &alt_body;
            let user = self.user.as_str();
            let password = self.application_password.as_str();
            let http = &self.http;
            with_retries(self.max_retries, context_ref, move || async move {
                let response = http
                    .post(url_ref)
                    .basic_auth(user, Some(password))
                    .json(body_ref)
                    .send()
                    .await?;
                Self::check(response, context_ref).await
            })
            .await?;
        }

        debug!(filename, media_id, "media upload complete");
        Ok(media_id)
    }

    async fn media_url(&self, media_id: u64) -> Result<Option<String>> {
        let url = self.media_endpoint(Some(media_id));
        let context = format!("GET {}", url);
        let url_ref = url.as_str();
        let context_ref = context.as_str();
        let user = self.user.as_str();
        let password = self.application_password.as_str();
        let http = &self.http;

        let result = with_retries(self.max_retries, context_ref, move || async move {
            let response = http
                .get(url_ref)
                .basic_auth(user, Some(password))
                .send()
                .await?;
            Self::check(response, context_ref).await
        })
        .await;

        match result {
            Ok(body) => Ok(body
                .get("source_url")
                .and_then(Value::as_str)
                .map(String::from)),
            Err(MigrateError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
