//! Credential hash migration across platform hashing boundaries.
//!
//! Shopware 6 stores bcrypt hashes. WordPress cores bundled with newer
//! WooCommerce majors accept bcrypt hashes unmodified, so those migrate
//! verbatim. Older targets use an incompatible scheme; the hash cannot be
//! converted (it is one-way), so the account gets a non-functional
//! placeholder and must be force-reset by a downstream notification step.

/// Oldest target major version whose hashing scheme accepts the source
/// hash format unmodified.
pub const NATIVE_HASH_MIN_MAJOR: u32 = 7;

/// Non-functional placeholder stored when the hash is not portable.
/// Deliberately not a valid hash in any supported scheme.
pub const RESET_PLACEHOLDER: &str = "!migration-reset-required";

/// Result of migrating one credential hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMigration {
    /// Value to store in the target credential field.
    pub password: String,

    /// Whether the account must be force-reset downstream.
    pub requires_reset: bool,
}

/// Maps credential hashes across platform hashing-algorithm boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordMigrator;

impl PasswordMigrator {
    pub fn new() -> Self {
        Self
    }

    /// Migrate a source hash for a target of the given major version.
    pub fn migrate(&self, source_hash: &str, target_major: u32) -> PasswordMigration {
        if target_major >= NATIVE_HASH_MIN_MAJOR {
            PasswordMigration {
                password: source_hash.to_string(),
                requires_reset: false,
            }
        } else {
            PasswordMigration {
                password: RESET_PLACEHOLDER.to_string(),
                requires_reset: true,
            }
        }
    }
}
