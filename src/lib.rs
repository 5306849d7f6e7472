//! # Tierback - Backups for tiered data stores
//!
//! Full and incremental backup, restore and verification for a data store
//! split into `hot`, `warm` and `cold` levels.
//!
//! ## Overview
//!
//! Tierback packs the configured levels into compressed archives and keeps a
//! durable catalog of them. It lets you:
//! - Create self-contained full backups of every level
//! - Create incremental backups holding only files changed since the newest full
//! - Restore any backup, replaying an incremental on top of its baseline
//! - Verify archives without touching anything
//! - Expire old backups by count and age without ever orphaning an incremental
//! - Drive backups from cron schedules
//!
//! ## Architecture
//!
//! - **ArchiveEngine**: stateless primitives (tree copy, tree diff, tar.gz
//!   compress/decompress, streaming checksums)
//! - **Catalog**: the manifest and the archive blobs under the backup root; the
//!   only writer of `manifest.json`
//! - **BackupService**: orchestrates the workflows on top of both, running disk
//!   work on tokio's blocking pool
//! - **BackupScheduler**: cron cadence, only ever calls `create_backup`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tierback::{BackupService, BackupType, RestoreOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = BackupService::builder()
//!     .backup_root("./backups")
//!     .data_root("./data")
//!     .build()?;
//! service.initialize().await?;
//!
//! // Weekly full, daily incremental
//! let full = service.create_backup(BackupType::Full).await?;
//! let inc = service.create_backup(BackupType::Incremental).await?;
//!
//! let report = service.verify_backup(&inc).await?;
//! assert!(report.valid);
//!
//! service
//!     .restore_backup(&inc, RestoreOptions::new("./restore").overwrite(true))
//!     .await?;
//!
//! let deleted = service.apply_retention_policy().await?;
//! println!("full {}, expired {:?}", full, deleted);
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`BackupConfig`] can be loaded from TOML:
//!
//! ```rust
//! use tierback::{BackupConfig, ChecksumAlgorithm};
//!
//! let config = BackupConfig::from_toml_str(r#"
//!     backup_root = "/var/backups/tierback"
//!     data_root = "/srv/data"
//!     checksum_algorithm = "md5"
//!     exclude_patterns = ["*.tmp"]
//!
//!     [retention]
//!     keep_last_full_backups = 4
//!
//!     [schedule]
//!     full = "0 0 2 * * Sun"
//!     incremental = "0 0 2 * * Mon-Sat"
//! "#).unwrap();
//! assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::Md5);
//! assert_eq!(config.retention.keep_last_full_backups, 4);
//! ```
//!
//! ## Known limitations
//!
//! - Incremental backups record added and modified files only. A file deleted
//!   after the baseline reappears when the incremental is restored.
//! - Symlinks and special files are skipped with a warning.
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events and never installs a subscriber.
//!
//! ## Module Organization
//!
//! - [`archive`]: archive and tree primitives
//! - [`catalog`]: manifest and blob storage
//! - [`service`]: backup orchestration
//! - [`scheduler`]: cron-driven backups
//! - [`verification`]: integrity checking
//! - [`retention`]: retention planning
//! - [`diff`]: tree diffing
//! - [`types`]: common types and configuration
//! - [`error`]: error types and handling

// Public API modules
pub mod archive;
pub mod catalog;
pub mod diff;
pub mod error;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod types;
pub mod utils;
pub mod verification;

// Re-export main types for convenience
pub use archive::ArchiveEngine;
pub use catalog::Catalog;
pub use error::{BackupError, Result};
pub use scheduler::BackupScheduler;
pub use service::{BackupService, BackupServiceBuilder};
pub use types::*;
pub use verification::BackupVerifier;
