//! Versioned read queries for the Shopware 6 source schema.
//!
//! Pure mapping from [`SchemaFeatures`] to SQL text: no I/O, same flags
//! always produce the same fragment, so every branch is unit-testable
//! without a live database. The sqlx source issues whatever this module
//! builds.
//!
//! Source primary keys are `binary(16)` and are rendered as lowercase hex
//! (`LOWER(HEX(id))`) in every projection; keyset pagination compares the
//! same expression.

use chrono::{DateTime, Utc};

use super::SchemaFeatures;
use crate::state::EntityType;

/// Fixed literal in the dedicated product type column marking a
/// downloadable product (6.7+).
const DIGITAL_TYPE_LITERAL: &str = "digital";

/// Fixed tag inside the legacy JSON state array marking a downloadable
/// product (<6.7).
const DOWNLOAD_STATE_TAG: &str = "is-download";

/// Predicate answering "is this product digital/downloadable".
///
/// On 6.7+ compare the dedicated type column to a fixed literal; on older
/// schemas test membership of a fixed tag inside the JSON-encoded state
/// array.
pub fn digital_product_predicate(features: &SchemaFeatures) -> String {
    if features.product_type_column {
        format!("p.`type` = '{}'", DIGITAL_TYPE_LITERAL)
    } else {
        format!("JSON_CONTAINS(p.states, '\"{}\"')", DOWNLOAD_STATE_TAG)
    }
}

/// Column expression for a payment method's stable name.
pub fn payment_method_name_expr(features: &SchemaFeatures) -> &'static str {
    if features.technical_name_columns {
        "pm.technical_name"
    } else {
        "pm.handler_identifier"
    }
}

/// Column expression for a shipping method's stable name.
pub fn shipping_method_name_expr(features: &SchemaFeatures) -> &'static str {
    if features.technical_name_columns {
        "sm.technical_name"
    } else {
        "sm.name"
    }
}

/// Validate a keyset cursor: lowercase hex of a 16-byte id.
///
/// Cursors are interpolated into generated SQL, so anything that is not
/// exactly 32 lowercase hex digits is rejected.
pub fn validate_hex_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Keyset position of the last row of the previous page.
///
/// Stages whose batches order by a rank column before the id (categories
/// by tree level, products by parent-before-variant) must carry that rank
/// in the cursor too: comparing the id alone would skip every row that
/// ranks later but sorts earlier by id.
#[derive(Debug, Clone)]
pub struct BatchCursor {
    pub id: String,
    pub rank: Option<i64>,
}

impl BatchCursor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rank: None,
        }
    }

    pub fn with_rank(mut self, rank: i64) -> Self {
        self.rank = Some(rank);
        self
    }
}

/// SQL expression of the rank column a stage orders by before the id,
/// if it has one. Must match the `sort_rank` alias in the stage's body.
fn rank_expr(entity: EntityType) -> Option<&'static str> {
    match entity {
        EntityType::Category => Some("c.level"),
        EntityType::Product => Some("(p.parent_id IS NOT NULL)"),
        _ => None,
    }
}

/// Render a timestamp in a SQL-safe format with no metacharacters.
fn timestamp_sql_safe(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Build the paginated batch SELECT for one entity type.
///
/// `after` is an exclusive keyset cursor; `updated_since` adds the
/// incremental-mode watermark filter. Invalid cursor ids are ignored
/// rather than interpolated.
pub fn select_batch(
    entity: EntityType,
    features: &SchemaFeatures,
    after: Option<&BatchCursor>,
    updated_since: Option<&DateTime<Utc>>,
    limit: usize,
) -> String {
    let (body, alias) = match entity {
        EntityType::Manufacturer => (manufacturer_body(), "m"),
        EntityType::Tax => (tax_body(), "t"),
        EntityType::Category => (category_body(), "c"),
        EntityType::Product => (product_body(features), "p"),
        EntityType::Customer => (customer_body(), "c"),
        EntityType::Order => (order_body(features), "o"),
        EntityType::Coupon => (coupon_body(), "pr"),
        EntityType::Review => (review_body(), "r"),
        EntityType::Media => (media_body(), "med"),
    };

    let mut conditions = Vec::new();
    if let Some(after) = after {
        if validate_hex_id(&after.id) {
            // The keyset predicate must compare the same columns the
            // batch orders by, rank included, or rows ranking later but
            // sorting earlier by id fall between pages.
            match (rank_expr(entity), after.rank) {
                (Some(expr), Some(rank)) => conditions.push(format!(
                    "({expr}, LOWER(HEX({a}.id))) > ({rank}, '{id}')",
                    a = alias,
                    id = after.id
                )),
                _ => conditions.push(format!("LOWER(HEX({}.id)) > '{}'", alias, after.id)),
            }
        }
    }
    if let Some(ts) = updated_since {
        conditions.push(format!(
            "COALESCE({a}.updated_at, {a}.created_at) > '{}'",
            timestamp_sql_safe(ts),
            a = alias
        ));
    }

    let mut sql = body;
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    // Reference targets must be written before the rows pointing at them:
    // categories order by tree level, products by parent-before-variant.
    // Everything else orders by the keyset column alone.
    if let Some(expr) = rank_expr(entity) {
        sql.push_str(&format!(" ORDER BY {expr}, LOWER(HEX({a}.id))", a = alias));
    } else {
        sql.push_str(&format!(" ORDER BY LOWER(HEX({}.id))", alias));
    }
    sql.push_str(&format!(" LIMIT {}", limit));
    sql
}

fn manufacturer_body() -> String {
    "SELECT LOWER(HEX(m.id)) AS id, mt.name AS name, mt.description AS description, \
     m.link AS link, m.updated_at AS updated_at, m.created_at AS created_at \
     FROM product_manufacturer m \
     LEFT JOIN product_manufacturer_translation mt ON mt.product_manufacturer_id = m.id"
        .to_string()
}

fn tax_body() -> String {
    "SELECT LOWER(HEX(t.id)) AS id, t.name AS name, t.tax_rate AS tax_rate, \
     t.updated_at AS updated_at, t.created_at AS created_at \
     FROM tax t"
        .to_string()
}

fn category_body() -> String {
    "SELECT LOWER(HEX(c.id)) AS id, LOWER(HEX(c.parent_id)) AS parent_id, \
     ct.name AS name, ct.description AS description, c.level AS sort_rank, \
     c.updated_at AS updated_at, c.created_at AS created_at \
     FROM category c \
     LEFT JOIN category_translation ct ON ct.category_id = c.id"
        .to_string()
}

fn product_body(features: &SchemaFeatures) -> String {
    format!(
        "SELECT LOWER(HEX(p.id)) AS id, LOWER(HEX(p.parent_id)) AS parent_id, \
         (p.parent_id IS NOT NULL) AS sort_rank, \
         p.product_number AS product_number, pt.name AS name, \
         pt.description AS description, p.price AS price, p.stock AS stock, \
         p.active AS active, \
         LOWER(HEX(p.product_manufacturer_id)) AS manufacturer_id, \
         LOWER(HEX(p.tax_id)) AS tax_id, \
         ({digital}) AS is_digital, \
         (SELECT JSON_ARRAYAGG(LOWER(HEX(pc.category_id))) \
          FROM product_category pc WHERE pc.product_id = p.id) AS category_ids, \
         med.path AS cover_path, med.file_name AS cover_file_name, \
         med.file_extension AS cover_extension, \
         p.updated_at AS updated_at, p.created_at AS created_at \
         FROM product p \
         LEFT JOIN product_translation pt ON pt.product_id = p.id \
         LEFT JOIN product_media pmed ON pmed.id = p.product_media_id \
         LEFT JOIN media med ON med.id = pmed.media_id",
        digital = digital_product_predicate(features)
    )
}

fn customer_body() -> String {
    "SELECT LOWER(HEX(c.id)) AS id, c.customer_number AS customer_number, \
     c.email AS email, c.first_name AS first_name, c.last_name AS last_name, \
     c.password AS password_hash, c.active AS active, \
     c.updated_at AS updated_at, c.created_at AS created_at \
     FROM customer c"
        .to_string()
}

fn order_body(features: &SchemaFeatures) -> String {
    format!(
        "SELECT LOWER(HEX(o.id)) AS id, o.order_number AS order_number, \
         o.amount_total AS amount_total, cur.iso_code AS currency, \
         LOWER(HEX(oc.customer_id)) AS customer_id, oc.email AS customer_email, \
         sms.technical_name AS order_state, \
         (SELECT {pm_name} FROM order_transaction ot \
          JOIN payment_method pm ON pm.id = ot.payment_method_id \
          WHERE ot.order_id = o.id ORDER BY ot.created_at DESC LIMIT 1) AS payment_method, \
         (SELECT JSON_ARRAYAGG(JSON_OBJECT( \
            'product_id', LOWER(HEX(li.product_id)), \
            'label', li.label, \
            'quantity', li.quantity, \
            'unit_price', li.unit_price, \
            'total_price', li.total_price)) \
          FROM order_line_item li WHERE li.order_id = o.id) AS line_items, \
         o.updated_at AS updated_at, o.created_at AS created_at \
         FROM `order` o \
         LEFT JOIN currency cur ON cur.id = o.currency_id \
         LEFT JOIN order_customer oc ON oc.order_id = o.id \
         LEFT JOIN state_machine_state sms ON sms.id = o.state_id",
        pm_name = payment_method_name_expr(features)
    )
}

fn coupon_body() -> String {
    "SELECT LOWER(HEX(pr.id)) AS id, prt.name AS name, pr.code AS code, \
     pr.active AS active, pd.type AS discount_type, pd.value AS discount_value, \
     pr.updated_at AS updated_at, pr.created_at AS created_at \
     FROM promotion pr \
     LEFT JOIN promotion_translation prt ON prt.promotion_id = pr.id \
     LEFT JOIN promotion_discount pd ON pd.promotion_id = pr.id"
        .to_string()
}

fn media_body() -> String {
    "SELECT LOWER(HEX(med.id)) AS id, med.path AS path, med.file_name AS file_name, \
     med.file_extension AS file_extension, med.updated_at AS updated_at, \
     med.created_at AS created_at \
     FROM media med"
        .to_string()
}

fn review_body() -> String {
    "SELECT LOWER(HEX(r.id)) AS id, LOWER(HEX(r.product_id)) AS product_id, \
     LOWER(HEX(r.customer_id)) AS customer_id, r.external_user AS reviewer_name, \
     r.external_email AS reviewer_email, r.points AS rating, r.title AS title, \
     r.content AS content, r.status AS approved, \
     r.updated_at AS updated_at, r.created_at AS created_at \
     FROM product_review r"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn v67() -> SchemaFeatures {
        SchemaFeatures {
            product_type_column: true,
            technical_name_columns: true,
            product_states_column: true,
            canonical_version_column: true,
        }
    }

    fn v65() -> SchemaFeatures {
        SchemaFeatures {
            product_states_column: true,
            ..SchemaFeatures::default()
        }
    }

    #[test]
    fn test_digital_predicate_uses_type_column_on_6_7() {
        let predicate = digital_product_predicate(&v67());
        assert_eq!(predicate, "p.`type` = 'digital'");
    }

    #[test]
    fn test_digital_predicate_uses_state_array_below_6_7() {
        let predicate = digital_product_predicate(&v65());
        assert_eq!(predicate, "JSON_CONTAINS(p.states, '\"is-download\"')");
    }

    #[test]
    fn test_fragment_selection_is_referentially_transparent() {
        let flags = v67();
        assert_eq!(
            digital_product_predicate(&flags),
            digital_product_predicate(&flags)
        );
        assert_eq!(
            select_batch(EntityType::Product, &flags, None, None, 50),
            select_batch(EntityType::Product, &flags, None, None, 50)
        );
    }

    #[test]
    fn test_payment_method_name_branches() {
        assert_eq!(payment_method_name_expr(&v67()), "pm.technical_name");
        assert_eq!(payment_method_name_expr(&v65()), "pm.handler_identifier");
    }

    #[test]
    fn test_keyset_cursor_applied() {
        let cursor = BatchCursor::new("0123456789abcdef0123456789abcdef");
        let sql = select_batch(EntityType::Tax, &v67(), Some(&cursor), None, 10);
        assert!(sql.contains(&format!("LOWER(HEX(t.id)) > '{}'", cursor.id)));
        assert!(sql.ends_with("LIMIT 10"));
    }

    #[test]
    fn test_invalid_cursor_not_interpolated() {
        let cursor = BatchCursor::new("'; DROP TABLE tax; --");
        let sql = select_batch(EntityType::Tax, &v67(), Some(&cursor), None, 10);
        assert!(!sql.contains("DROP TABLE"));
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn test_category_cursor_compares_level_and_id() {
        let cursor = BatchCursor::new("0123456789abcdef0123456789abcdef").with_rank(2);
        let sql = select_batch(EntityType::Category, &v67(), Some(&cursor), None, 10);
        assert!(sql.contains(
            "(c.level, LOWER(HEX(c.id))) > (2, '0123456789abcdef0123456789abcdef')"
        ));
        assert!(sql.contains("ORDER BY c.level, LOWER(HEX(c.id))"));
        // An id-only predicate over a level ordering would drop every
        // deeper category whose id sorts below the cursor.
        assert!(!sql.contains("LOWER(HEX(c.id)) > '0123"));
    }

    #[test]
    fn test_product_cursor_compares_parent_rank_and_id() {
        let cursor = BatchCursor::new("0123456789abcdef0123456789abcdef").with_rank(0);
        let sql = select_batch(EntityType::Product, &v67(), Some(&cursor), None, 10);
        assert!(sql.contains(
            "((p.parent_id IS NOT NULL), LOWER(HEX(p.id))) > (0, '0123456789abcdef0123456789abcdef')"
        ));
        assert!(sql.contains("ORDER BY (p.parent_id IS NOT NULL), LOWER(HEX(p.id))"));
    }

    #[test]
    fn test_hex_id_validation() {
        assert!(validate_hex_id("0123456789abcdef0123456789abcdef"));
        assert!(!validate_hex_id("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!validate_hex_id("abc"));
        assert!(!validate_hex_id("zz23456789abcdef0123456789abcdef"));
    }

    #[test]
    fn test_incremental_watermark_filter() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sql = select_batch(EntityType::Customer, &v67(), None, Some(&ts), 25);
        assert!(sql.contains("COALESCE(c.updated_at, c.created_at) > '2024-03-01 12:00:00.000'"));
    }

    #[test]
    fn test_categories_order_parent_before_child() {
        let sql = select_batch(EntityType::Category, &v67(), None, None, 100);
        assert!(sql.contains("ORDER BY c.level, LOWER(HEX(c.id))"));
    }

    #[test]
    fn test_product_select_embeds_versioned_predicate() {
        let new = select_batch(EntityType::Product, &v67(), None, None, 10);
        let old = select_batch(EntityType::Product, &v65(), None, None, 10);
        assert!(new.contains("p.`type` = 'digital'"));
        assert!(old.contains("JSON_CONTAINS(p.states"));
    }

    #[test]
    fn test_product_select_aggregates_category_ids() {
        let sql = select_batch(EntityType::Product, &v67(), None, None, 10);
        assert!(sql.contains("JSON_ARRAYAGG(LOWER(HEX(pc.category_id)))"));
        assert!(sql.contains("FROM product_category pc WHERE pc.product_id = p.id"));
    }

    #[test]
    fn test_order_select_embeds_payment_name_expr() {
        let new = select_batch(EntityType::Order, &v67(), None, None, 10);
        let old = select_batch(EntityType::Order, &v65(), None, None, 10);
        assert!(new.contains("pm.technical_name"));
        assert!(old.contains("pm.handler_identifier"));
    }
}
