//! Error types for the tierback library
//!
//! Every fallible operation in the crate returns [`Result<T>`], an alias over
//! [`BackupError`]. Primitive (archive) and storage (catalog) errors propagate
//! unchanged through the orchestration layer, so callers can match on the
//! variant that actually caused a failure.
//!
//! Verification is the one place where integrity problems are *not* raised as
//! errors: [`crate::BackupService::verify_backup`] collects them into a
//! [`crate::types::VerifyResult`] instead.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the tierback library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all tierback operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during copy, compress, checksum or catalog writes
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during manifest serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Incremental backup requested while the catalog holds no full backup
    #[error("No full backup available to serve as baseline; run a full backup first")]
    NoBaseline,

    /// Archive checksum does not match the value sealed into the catalog
    #[error("Checksum mismatch for backup {id} - expected: {expected}, actual: {actual}")]
    ChecksumMismatch {
        /// Backup whose archive failed the check
        id: String,
        /// Checksum recorded at creation time
        expected: String,
        /// Checksum computed now
        actual: String,
    },

    /// Unknown backup id, or its archive was removed out of band
    #[error("Backup not found: {0}")]
    NotFound(String),

    /// Archive is missing, truncated or not a valid tar.gz stream
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Archive could not be produced
    #[error("Compression error: {0}")]
    Compression(String),

    /// Deleting a full backup would orphan live incrementals
    #[error("Cannot delete full backup {full_id}: it is the baseline of {incremental_ids:?}")]
    DanglingBaseline {
        /// Full backup that was asked to be deleted
        full_id: String,
        /// Incremental backups that still depend on it
        incremental_ids: Vec<String>,
    },

    /// Catalog used before `initialize()`
    #[error("Catalog not initialized at path: {0:?}")]
    NotInitialized(PathBuf),

    /// Manifest content violates a catalog invariant
    #[error("Corrupt catalog: {0}")]
    CorruptCatalog(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Exclude pattern parsing error
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Operation aborted through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Cron scheduler failure
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<globset::Error> for BackupError {
    fn from(err: globset::Error) -> Self {
        BackupError::InvalidPattern(err.to_string())
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for BackupError {
    fn from(err: tokio_cron_scheduler::JobSchedulerError) -> Self {
        BackupError::Scheduler(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackupError::Internal(format!("blocking task failed: {}", err))
    }
}

impl BackupError {
    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        BackupError::Decompression(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        BackupError::Compression(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        BackupError::InvalidConfiguration(msg.into())
    }

    /// Check if retrying the same call may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BackupError::Io(_) | BackupError::Cancelled)
    }

    /// Check if this error indicates damaged backup data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BackupError::ChecksumMismatch { .. }
                | BackupError::Decompression(_)
                | BackupError::CorruptCatalog(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackupError::NoBaseline => {
                "No full backup exists yet. Create a full backup before requesting an \
                 incremental one."
                    .to_string()
            }
            BackupError::NotFound(id) => {
                format!("Backup '{}' not found. Use 'list_backups()' to see available backups.", id)
            }
            BackupError::ChecksumMismatch { id, .. } => {
                format!(
                    "Backup '{}' failed its integrity check and was not restored. \
                     Run 'verify_backup()' for details or restore an older backup.",
                    id
                )
            }
            BackupError::NotInitialized(path) => {
                format!("Catalog not initialized at {:?}. Call 'initialize()' first.", path)
            }
            _ => self.to_string(),
        }
    }
}
