//! Field transformers applied between source read and target write.
//!
//! All transformers share one rule: malformed input never fails a
//! migration destructively. Bad markup is repaired best-effort, missing
//! images are dropped, and non-portable credential hashes degrade to a
//! forced reset.

pub mod content;
pub mod media;
pub mod password;

pub use content::ContentMigrator;
pub use media::{ImageMigrator, ImageResolver};
pub use password::PasswordMigrator;
