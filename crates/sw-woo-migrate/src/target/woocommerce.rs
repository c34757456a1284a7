//! WooCommerce REST reference client.
//!
//! Key/secret authentication, JSON bodies, one endpoint per entity type.
//! Every call goes through the shared bounded-retry helper; retry
//! exhaustion surfaces as an error the orchestrator records per entity.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{with_retries, CommerceTarget};
use crate::config::{MigrationOptions, WooApiConfig};
use crate::error::{MigrateError, Result};
use crate::state::EntityType;

/// REST route fragment per entity type (under `wp-json/wc/v3/`).
fn route(entity: EntityType) -> &'static str {
    match entity {
        EntityType::Manufacturer => "products/brands",
        EntityType::Tax => "taxes",
        EntityType::Category => "products/categories",
        EntityType::Product => "products",
        EntityType::Customer => "customers",
        EntityType::Order => "orders",
        EntityType::Coupon => "coupons",
        EntityType::Review => "products/reviews",
        EntityType::Media => "products", // media never routes here
    }
}

/// WooCommerce REST client.
pub struct WooCommerceClient {
    http: reqwest::Client,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
    max_retries: u32,
}

impl WooCommerceClient {
    /// Build a client from configuration.
    pub fn new(config: &WooApiConfig, options: &MigrationOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
            max_retries: options.max_retries,
        })
    }

    fn url(&self, entity: EntityType, target_id: Option<&str>) -> String {
        match target_id {
            Some(id) => format!("{}/wp-json/wc/v3/{}/{}", self.base_url, route(entity), id),
            None => format!("{}/wp-json/wc/v3/{}", self.base_url, route(entity)),
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
impl CommerceTarget for WooCommerceClient {
    async fn write(
        &self,
        entity: EntityType,
        existing_target_id: Option<&str>,
        payload: &Value,
    ) -> Result<String> {
        let url = self.url(entity, existing_target_id);
        let context = format!("POST {}", url);
        let url = url.as_str();
        let context_ref = context.as_str();
        let key = self.consumer_key.as_str();
        let secret = self.consumer_secret.as_str();
        let http = &self.http;

        let body = with_retries(self.max_retries, context_ref, move || async move {
            let response = http
                .post(url)
                .query(&[("consumer_key", key), ("consumer_secret", secret)])
                .json(payload)
                .send()
                .await?;
            Self::check(response, context_ref).await
        })
        .await?;

        let id = body
            .get("id")
            .and_then(|v| {
                v.as_u64()
                    .map(|n| n.to_string())
                    .or_else(|| v.as_str().map(String::from))
            })
            .ok_or_else(|| {
                MigrateError::api(200, "response missing id field", context.clone())
            })?;

        debug!(entity = %entity, target_id = %id, "target write complete");
        Ok(id)
    }

    async fn list(&self, entity: EntityType, page: u32, per_page: u32) -> Result<Vec<Value>> {
        let url = self.url(entity, None);
        let context = format!("GET {}", url);
        let page_s = page.to_string();
        let per_page_s = per_page.to_string();
        let url = url.as_str();
        let context_ref = context.as_str();
        let key = self.consumer_key.as_str();
        let secret = self.consumer_secret.as_str();
        let page_ref = page_s.as_str();
        let per_page_ref = per_page_s.as_str();
        let http = &self.http;

        let body = with_retries(self.max_retries, context_ref, move || async move {
            let response = http
                .get(url)
                .query(&[
                    ("consumer_key", key),
                    ("consumer_secret", secret),
                    ("page", page_ref),
                    ("per_page", per_page_ref),
                ])
                .send()
                .await?;
            Self::check(response, context_ref).await
        })
        .await?;

        match body {
            Value::Array(items) => Ok(items),
            other => Err(MigrateError::api(
                200,
                format!("expected array response, got {}", other),
                context,
            )),
        }
    }
}
