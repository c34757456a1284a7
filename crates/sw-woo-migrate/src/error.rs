//! Error types for the migration engine.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// HTTP transport error talking to a target API
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Target API rejected a request
    #[error("Target API error ({status}): {message}\n  Context: {context}")]
    Api {
        status: u16,
        message: String,
        context: String,
    },

    /// State store error
    #[error("State error: {0}")]
    State(String),

    /// A field transform failed for a single entity
    #[error("Transform failed for {entity}: {message}")]
    Transform { entity: String, message: String },

    /// Run lifecycle transition was not allowed
    #[error("Invalid run transition: {0}")]
    Lifecycle(String),

    /// Run was cancelled by an external command
    #[error("Migration cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error (config file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Create an Api error with context about where it occurred.
    pub fn api(status: u16, message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Api {
            status,
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Transform error for a single entity.
    pub fn transform(entity: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transform {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the run as a whole cannot continue.
    ///
    /// Connectivity-level failures (source unreachable, target auth rejected)
    /// abort all remaining stages. Everything else is recoverable at the
    /// entity level: the record is marked failed and the stage continues.
    pub fn is_connectivity(&self) -> bool {
        match self {
            MigrateError::Source(_) => true,
            MigrateError::Api { status, .. } => *status == 401 || *status == 403,
            MigrateError::Config(_) | MigrateError::State(_) => true,
            MigrateError::Cancelled => true,
            _ => false,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
