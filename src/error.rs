//! Fatal error kinds for the batch run.
//!
//! Everything that is recoverable inside a stage (bad rows, unreadable files,
//! one failed download) is logged and counted where it happens. The variants
//! here are the conditions that abort the run; they travel inside
//! `anyhow::Error` and can be recovered with `downcast_ref`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    /// No alias for the registry identifier column is present, so the join is impossible.
    #[error("registry has no identifier column (looked for {aliases:?}; available: {available:?})")]
    MissingJoinKey {
        aliases: Vec<String>,
        available: Vec<String>,
    },

    /// A stage's input artifact does not exist on disk.
    #[error("required artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// One or more schema statements failed with a non-idempotency error.
    #[error("schema initialization failed for {} statement(s): {}", .failures.len(), .failures.join(" | "))]
    SchemaInit { failures: Vec<String> },

    /// Discovery found nothing to download.
    #[error("no quarterly archives found under {0}")]
    NoArchives(String),
}
