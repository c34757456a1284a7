//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }

    // Target validation
    if config.target.base_url.is_empty() {
        return Err(MigrateError::Config("target.base_url is required".into()));
    }
    if !config.target.base_url.starts_with("http") {
        return Err(MigrateError::Config(format!(
            "target.base_url must be an http(s) URL, got '{}'",
            config.target.base_url
        )));
    }
    if config.target.consumer_key.is_empty() || config.target.consumer_secret.is_empty() {
        return Err(MigrateError::Config(
            "target.consumer_key and target.consumer_secret are required".into(),
        ));
    }
    if config.target.major_version == 0 {
        return Err(MigrateError::Config(
            "target.major_version must be at least 1".into(),
        ));
    }

    // Media API validation
    if config.media.base_url.is_empty() {
        return Err(MigrateError::Config("media.base_url is required".into()));
    }
    if config.media.user.is_empty() || config.media.application_password.is_empty() {
        return Err(MigrateError::Config(
            "media.user and media.application_password are required".into(),
        ));
    }

    // Migration options validation
    if config.migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if config.migration.request_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "migration.request_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}
