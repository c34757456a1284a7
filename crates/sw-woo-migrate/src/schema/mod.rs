//! Source schema generation detection.
//!
//! Shopware installations in the supported range (6.5 through 6.7) differ
//! in table layout. The detector classifies the generation by probing
//! table/column existence through the [`SchemaProbe`] seam, then hands a
//! set of feature flags to the query builders in [`queries`].
//!
//! Detection must never abort a run: any database error during probing is
//! swallowed and the version degrades to `Unknown`.

pub mod queries;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;

/// Existence probes against the source schema.
///
/// Implemented by the sqlx source over `INFORMATION_SCHEMA`; tests supply a
/// fixture-backed fake.
#[async_trait]
pub trait SchemaProbe: Send + Sync {
    /// Whether the named table exists in the source schema.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Whether the named column exists on the named table.
    async fn column_exists(&self, table: &str, column: &str) -> Result<bool>;
}

/// Detected source schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaVersion {
    Unknown,
    V6_5,
    V6_6,
    V6_7,
}

impl SchemaVersion {
    /// Version label as reported in status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V6_7 => "6.7",
            Self::V6_6 => "6.6",
            Self::V6_5 => "6.5",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this version is at least `other`. `Unknown` is never at
    /// least anything.
    pub fn is_at_least(&self, other: SchemaVersion) -> bool {
        if *self == SchemaVersion::Unknown {
            return false;
        }
        *self >= other
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean feature flags consumed by the query builders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaFeatures {
    /// `product.type` column exists (6.7+): digital products carry a
    /// dedicated type column.
    pub product_type_column: bool,

    /// `payment_method.technical_name` / `shipping_method.technical_name`
    /// columns exist (6.6+).
    pub technical_name_columns: bool,

    /// `product.states` JSON array column exists.
    pub product_states_column: bool,

    /// `product.canonical_product_version_id` column exists.
    pub canonical_version_column: bool,
}

/// Full detection result.
#[derive(Debug, Clone)]
pub struct SchemaInfo {
    pub version: SchemaVersion,
    pub features: SchemaFeatures,
    pub warnings: Vec<String>,
}

/// Classifies the source schema generation by probing table and column
/// existence.
pub struct SchemaVersionDetector {
    probe: Arc<dyn SchemaProbe>,
}

impl SchemaVersionDetector {
    pub fn new(probe: Arc<dyn SchemaProbe>) -> Self {
        Self { probe }
    }

    /// Detect the major schema version. Checked in order, first match wins:
    ///
    /// 1. `product.type` column present ⇒ 6.7
    /// 2. `payment_method.technical_name` or `shipping_method.technical_name`
    ///    present ⇒ 6.6
    /// 3. `product` table present at all ⇒ 6.5 fallback
    /// 4. no `product` table ⇒ unknown
    ///
    /// Probe errors are swallowed and degrade to `Unknown`.
    pub async fn detect_major_version(&self) -> SchemaVersion {
        match self.try_detect_major_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!("schema probing failed, treating version as unknown: {}", e);
                SchemaVersion::Unknown
            }
        }
    }

    async fn try_detect_major_version(&self) -> Result<SchemaVersion> {
        if self.probe.column_exists("product", "type").await? {
            return Ok(SchemaVersion::V6_7);
        }

        if self
            .probe
            .column_exists("payment_method", "technical_name")
            .await?
            || self
                .probe
                .column_exists("shipping_method", "technical_name")
                .await?
        {
            return Ok(SchemaVersion::V6_6);
        }

        if self.probe.table_exists("product").await? {
            return Ok(SchemaVersion::V6_5);
        }

        Ok(SchemaVersion::Unknown)
    }

    /// Detect version plus the feature flags the readers branch on.
    pub async fn detect(&self) -> SchemaInfo {
        let version = self.detect_major_version().await;
        let mut warnings = Vec::new();

        let features = match self.try_detect_features().await {
            Ok(features) => features,
            Err(e) => {
                warnings.push(format!(
                    "feature probing failed, using oldest supported dialect: {}",
                    e
                ));
                SchemaFeatures::default()
            }
        };

        match version {
            SchemaVersion::V6_5 => warnings.push(
                "schema looks like 6.5: product type detection will use the legacy \
                 JSON state-array encoding"
                    .to_string(),
            ),
            SchemaVersion::Unknown => warnings.push(
                "source schema version could not be determined; queries degrade to the \
                 oldest supported dialect"
                    .to_string(),
            ),
            _ => {}
        }

        debug!(version = version.as_str(), ?features, "schema detection complete");

        SchemaInfo {
            version,
            features,
            warnings,
        }
    }

    async fn try_detect_features(&self) -> Result<SchemaFeatures> {
        Ok(SchemaFeatures {
            product_type_column: self.probe.column_exists("product", "type").await?,
            technical_name_columns: self
                .probe
                .column_exists("payment_method", "technical_name")
                .await?
                || self
                    .probe
                    .column_exists("shipping_method", "technical_name")
                    .await?,
            product_states_column: self.probe.column_exists("product", "states").await?,
            canonical_version_column: self
                .probe
                .column_exists("product", "canonical_product_version_id")
                .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrateError;
    use std::collections::HashSet;

    /// Fixture probe: a set of "table" and "table.column" names, with an
    /// optional failure switch.
    struct FakeProbe {
        present: HashSet<&'static str>,
        fail: bool,
    }

    impl FakeProbe {
        fn with(present: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                present: present.iter().copied().collect(),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                present: HashSet::new(),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl SchemaProbe for FakeProbe {
        async fn table_exists(&self, table: &str) -> Result<bool> {
            if self.fail {
                return Err(MigrateError::State("probe connection lost".into()));
            }
            Ok(self.present.contains(table))
        }

        async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
            if self.fail {
                return Err(MigrateError::State("probe connection lost".into()));
            }
            Ok(self.present.contains(format!("{}.{}", table, column).as_str()))
        }
    }

    #[tokio::test]
    async fn test_product_type_column_means_6_7() {
        let detector = SchemaVersionDetector::new(FakeProbe::with(&[
            "product",
            "product.type",
            "product.states",
            "payment_method.technical_name",
        ]));
        assert_eq!(detector.detect_major_version().await, SchemaVersion::V6_7);
    }

    #[tokio::test]
    async fn test_technical_name_means_6_6() {
        let detector = SchemaVersionDetector::new(FakeProbe::with(&[
            "product",
            "product.states",
            "shipping_method.technical_name",
        ]));
        assert_eq!(detector.detect_major_version().await, SchemaVersion::V6_6);
    }

    #[tokio::test]
    async fn test_bare_product_table_falls_back_to_6_5() {
        let detector = SchemaVersionDetector::new(FakeProbe::with(&["product"]));
        assert_eq!(detector.detect_major_version().await, SchemaVersion::V6_5);

        let info = detector.detect().await;
        assert_eq!(info.version, SchemaVersion::V6_5);
        assert!(info.warnings.iter().any(|w| w.contains("JSON state-array")));
    }

    #[tokio::test]
    async fn test_no_product_table_means_unknown() {
        let detector = SchemaVersionDetector::new(FakeProbe::with(&["customer"]));
        assert_eq!(detector.detect_major_version().await, SchemaVersion::Unknown);
    }

    #[tokio::test]
    async fn test_probe_error_swallowed_as_unknown() {
        let detector = SchemaVersionDetector::new(FakeProbe::failing());
        assert_eq!(detector.detect_major_version().await, SchemaVersion::Unknown);

        let info = detector.detect().await;
        assert_eq!(info.version, SchemaVersion::Unknown);
        assert_eq!(info.features, SchemaFeatures::default());
        assert!(!info.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_detect_reports_feature_flags() {
        let detector = SchemaVersionDetector::new(FakeProbe::with(&[
            "product",
            "product.type",
            "product.states",
            "product.canonical_product_version_id",
            "payment_method.technical_name",
        ]));
        let info = detector.detect().await;
        assert!(info.features.product_type_column);
        assert!(info.features.technical_name_columns);
        assert!(info.features.product_states_column);
        assert!(info.features.canonical_version_column);
    }

    #[test]
    fn test_is_at_least() {
        assert!(SchemaVersion::V6_7.is_at_least(SchemaVersion::V6_6));
        assert!(SchemaVersion::V6_6.is_at_least(SchemaVersion::V6_6));
        assert!(!SchemaVersion::V6_5.is_at_least(SchemaVersion::V6_6));
        assert!(!SchemaVersion::Unknown.is_at_least(SchemaVersion::V6_5));
    }
}
