//! Per-stage payload construction.
//!
//! Each builder maps one source row (as read by the source module) into
//! the JSON body the commerce target accepts, resolving references
//! through mappings produced by earlier stages. Missing required
//! references fail the single entity, never the stage.

use serde_json::{json, Map, Value};

use crate::error::{MigrateError, Result};
use crate::state::{EntityType, LogLevel, LogRecord, Run, StateBackend};
use crate::transform::media::build_shopware_media_url;
use crate::transform::{ContentMigrator, ImageResolver, PasswordMigrator};

/// Maximum characters of plain text kept for a product short description.
const SHORT_DESCRIPTION_MAX: usize = 300;

/// Shared dependencies a stage builder needs.
pub(crate) struct StageContext<'a> {
    pub run: &'a Run,
    pub state: &'a dyn StateBackend,
    pub content: &'a ContentMigrator,
    pub images: &'a dyn ImageResolver,
    pub passwords: &'a PasswordMigrator,
    pub source_base_url: &'a str,
    pub target_major: u32,
}

impl<'a> StageContext<'a> {
    /// Resolve a source reference to its target id: this run's mappings
    /// first, then the cross-run identity map.
    async fn resolve(&self, entity: EntityType, source_id: &str) -> Result<Option<Value>> {
        if let Some(id) = self.state.get(self.run.id, entity, source_id).await? {
            return Ok(Some(numeric_id(&id)));
        }
        Ok(self
            .state
            .identity_get(entity, source_id)
            .await?
            .map(|entry| numeric_id(&entry.target_id)))
    }

    /// Resolve a reference that the payload cannot do without.
    async fn require(&self, entity: EntityType, source_id: &str, owner: &str) -> Result<Value> {
        self.resolve(entity, source_id).await?.ok_or_else(|| {
            MigrateError::transform(
                owner,
                format!("unresolved {} reference {}", entity, source_id),
            )
        })
    }
}

/// Build the target payload for one source entity.
pub(crate) async fn build_payload(
    entity: EntityType,
    source_id: &str,
    payload: &Value,
    ctx: &StageContext<'_>,
) -> Result<Value> {
    match entity {
        EntityType::Manufacturer => manufacturer_payload(payload),
        EntityType::Tax => tax_payload(payload),
        EntityType::Category => category_payload(source_id, payload, ctx).await,
        EntityType::Product => product_payload(source_id, payload, ctx).await,
        EntityType::Customer => customer_payload(source_id, payload, ctx).await,
        EntityType::Order => order_payload(source_id, payload, ctx).await,
        EntityType::Coupon => coupon_payload(payload),
        EntityType::Review => review_payload(source_id, payload, ctx).await,
        EntityType::Media => Err(MigrateError::transform(
            "media",
            "media assets are re-hosted inline, not migrated as a stage",
        )),
    }
}

fn manufacturer_payload(payload: &Value) -> Result<Value> {
    Ok(json!({
        "name": str_field(payload, "name"),
        "description": str_field(payload, "description"),
    }))
}

fn tax_payload(payload: &Value) -> Result<Value> {
    let rate = payload
        .get("tax_rate")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    Ok(json!({
        "name": str_field(payload, "name"),
        "rate": format!("{:.4}", rate),
    }))
}

async fn category_payload(
    source_id: &str,
    payload: &Value,
    ctx: &StageContext<'_>,
) -> Result<Value> {
    let mut body = Map::new();
    body.insert("name".into(), Value::from(str_field(payload, "name")));
    body.insert(
        "description".into(),
        Value::from(str_field(payload, "description")),
    );

    // Stages emit parents before children, so a present parent reference
    // must already be mapped.
    if let Some(parent) = opt_str_field(payload, "parent_id") {
        let owner = format!("category:{}", source_id);
        body.insert(
            "parent".into(),
            ctx.require(EntityType::Category, &parent, &owner).await?,
        );
    }
    Ok(Value::Object(body))
}

async fn product_payload(
    source_id: &str,
    payload: &Value,
    ctx: &StageContext<'_>,
) -> Result<Value> {
    let name = str_field(payload, "name");
    let raw_description = str_field(payload, "description");
    let description = ctx.content.process_html_content(&raw_description).await;
    let short_description = ctx
        .content
        .extract_plain_text(&raw_description, SHORT_DESCRIPTION_MAX);
    let digital = flag_field(payload, "is_digital");

    let mut body = Map::new();
    body.insert("name".into(), Value::from(name.clone()));
    body.insert("sku".into(), Value::from(str_field(payload, "product_number")));
    body.insert("description".into(), Value::from(description));
    body.insert("short_description".into(), Value::from(short_description));
    body.insert(
        "status".into(),
        Value::from(if flag_field(payload, "active") {
            "publish"
        } else {
            "draft"
        }),
    );
    body.insert("virtual".into(), Value::from(digital));
    body.insert("downloadable".into(), Value::from(digital));

    // Variants reference their parent product. The stage emits parents
    // before variants, so a present parent reference must already be
    // mapped.
    if let Some(parent) = opt_str_field(payload, "parent_id") {
        let owner = format!("product:{}", source_id);
        body.insert(
            "parent_id".into(),
            ctx.require(EntityType::Product, &parent, &owner).await?,
        );
    }

    if let Some(gross) = extract_gross_price(payload.get("price")) {
        body.insert("regular_price".into(), Value::from(format!("{:.2}", gross)));
    }
    if let Some(stock) = payload.get("stock").and_then(Value::as_i64) {
        body.insert("manage_stock".into(), Value::from(true));
        body.insert("stock_quantity".into(), Value::from(stock));
    }

    // Optional references: a product without a mapped manufacturer or
    // category still migrates, it just loses that link.
    if let Some(manufacturer) = opt_str_field(payload, "manufacturer_id") {
        if let Some(id) = ctx.resolve(EntityType::Manufacturer, &manufacturer).await? {
            body.insert("brands".into(), Value::Array(vec![id]));
        }
    }

    if let Some(ids) = payload.get("category_ids").and_then(Value::as_array) {
        let mut categories = Vec::new();
        for category in ids.iter().filter_map(Value::as_str) {
            if let Some(id) = ctx.resolve(EntityType::Category, category).await? {
                categories.push(json!({ "id": id }));
            }
        }
        if !categories.is_empty() {
            body.insert("categories".into(), Value::Array(categories));
        }
    }

    if let Some(url) = cover_image_url(payload, ctx.source_base_url) {
        if let Some(hosted) = ctx.images.resolve(&url, &name).await {
            body.insert(
                "images".into(),
                json!([{ "src": hosted, "alt": name }]),
            );
        }
    }

    Ok(Value::Object(body))
}

async fn customer_payload(
    source_id: &str,
    payload: &Value,
    ctx: &StageContext<'_>,
) -> Result<Value> {
    let email = str_field(payload, "email");
    if email.is_empty() {
        return Err(MigrateError::transform(
            format!("customer:{}", source_id),
            "source row has no email address",
        ));
    }

    let hash = str_field(payload, "password_hash");
    let migrated = ctx.passwords.migrate(&hash, ctx.target_major);
    if migrated.requires_reset {
        ctx.state
            .record_log(LogRecord::entity_level(
                ctx.run.id,
                EntityType::Customer,
                source_id,
                LogLevel::Warning,
                "credential hash not portable to target version, reset placeholder stored",
            ))
            .await?;
    }

    Ok(json!({
        "email": email,
        "first_name": str_field(payload, "first_name"),
        "last_name": str_field(payload, "last_name"),
        "username": str_field(payload, "customer_number"),
        "password": migrated.password,
    }))
}

async fn order_payload(
    source_id: &str,
    payload: &Value,
    ctx: &StageContext<'_>,
) -> Result<Value> {
    let owner = format!("order:{}", source_id);

    let mut body = Map::new();
    body.insert(
        "status".into(),
        Value::from(map_order_state(&str_field(payload, "order_state"))),
    );
    body.insert("currency".into(), Value::from(str_field(payload, "currency")));
    body.insert(
        "payment_method".into(),
        Value::from(str_field(payload, "payment_method")),
    );
    body.insert(
        "billing".into(),
        json!({ "email": str_field(payload, "customer_email") }),
    );
    if let Some(total) = payload.get("amount_total").and_then(Value::as_f64) {
        body.insert("total".into(), Value::from(format!("{:.2}", total)));
    }

    if let Some(customer) = opt_str_field(payload, "customer_id") {
        body.insert(
            "customer_id".into(),
            ctx.require(EntityType::Customer, &customer, &owner).await?,
        );
    }

    let mut line_items = Vec::new();
    if let Some(items) = payload.get("line_items").and_then(Value::as_array) {
        for item in items {
            let mut mapped = Map::new();
            if let Some(product) = item.get("product_id").and_then(Value::as_str) {
                mapped.insert(
                    "product_id".into(),
                    ctx.require(EntityType::Product, product, &owner).await?,
                );
            }
            mapped.insert("name".into(), Value::from(str_field(item, "label")));
            if let Some(qty) = item.get("quantity").and_then(Value::as_i64) {
                mapped.insert("quantity".into(), Value::from(qty));
            }
            if let Some(total) = item.get("total_price").and_then(Value::as_f64) {
                mapped.insert("total".into(), Value::from(format!("{:.2}", total)));
            }
            line_items.push(Value::Object(mapped));
        }
    }
    body.insert("line_items".into(), Value::Array(line_items));

    Ok(Value::Object(body))
}

fn coupon_payload(payload: &Value) -> Result<Value> {
    let value = payload
        .get("discount_value")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let discount_type = match str_field(payload, "discount_type").as_str() {
        "percentage" => "percent",
        _ => "fixed_cart",
    };
    Ok(json!({
        "code": str_field(payload, "code"),
        "amount": format!("{:.2}", value),
        "discount_type": discount_type,
        "description": str_field(payload, "name"),
    }))
}

async fn review_payload(
    source_id: &str,
    payload: &Value,
    ctx: &StageContext<'_>,
) -> Result<Value> {
    let owner = format!("review:{}", source_id);
    let product = opt_str_field(payload, "product_id").ok_or_else(|| {
        MigrateError::transform(owner.as_str(), "source row has no product reference")
    })?;

    let rating = payload
        .get("rating")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .round()
        .clamp(0.0, 5.0) as i64;

    Ok(json!({
        "product_id": ctx.require(EntityType::Product, &product, &owner).await?,
        "reviewer": str_field(payload, "reviewer_name"),
        "reviewer_email": str_field(payload, "reviewer_email"),
        "review": ctx.content.extract_plain_text(&str_field(payload, "content"), usize::MAX),
        "rating": rating,
        "status": if flag_field(payload, "approved") { "approved" } else { "hold" },
    }))
}

/// Map a source order state machine name onto a target order status.
fn map_order_state(state: &str) -> &'static str {
    match state {
        "open" | "in_progress" => "processing",
        "completed" => "completed",
        "cancelled" => "cancelled",
        _ => "pending",
    }
}

/// Extract the gross amount from a source price document.
///
/// The column stores one JSON object per currency keyed by currency id;
/// any entry's `gross` value works because the source row carries a
/// single storefront currency.
fn extract_gross_price(price: Option<&Value>) -> Option<f64> {
    let value = match price? {
        Value::String(text) => serde_json::from_str::<Value>(text).ok()?,
        other => other.clone(),
    };
    match &value {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) => map
            .values()
            .next()
            .and_then(|entry| entry.get("gross"))
            .and_then(Value::as_f64),
        _ => None,
    }
}

/// Public URL of the product cover image, when the row has one.
fn cover_image_url(payload: &Value, base_url: &str) -> Option<String> {
    if let Some(path) = opt_str_field(payload, "cover_path") {
        return Some(format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ));
    }
    let stem = opt_str_field(payload, "cover_file_name")?;
    let extension = opt_str_field(payload, "cover_extension")?;
    Some(build_shopware_media_url(base_url, "", &stem, &extension))
}

/// Target identifiers are numeric; keep unparseable ones as strings so
/// the error surfaces at the target instead of silently dropping data.
fn numeric_id(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(id),
    }
}

fn str_field(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Truthiness for flags that may arrive as booleans or tinyint counts.
fn flag_field(payload: &Value, field: &str) -> bool {
    match payload.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}
