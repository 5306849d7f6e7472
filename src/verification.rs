//! Backup verification and integrity checking
//!
//! Verification is non-destructive: it never touches the manifest, the
//! archive or any restore target. It runs every check it can and collects the
//! findings instead of stopping at the first one.
//!
//! ## Checks
//!
//! 1. **Archive presence**: the blob exists and is a regular file
//! 2. **Checksum**: the recomputed digest equals the sealed one
//! 3. **Decompression**: the archive unpacks cleanly into scratch space
//! 4. **Chain**: an incremental's baseline is still in the catalog with its blob
//!
//! Failures of these checks are errors and make the backup invalid. A
//! non-completed status, a file count or archive size that disagrees with the
//! record are reported as warnings.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tierback::archive::ArchiveEngine;
//! use tierback::catalog::Catalog;
//! use tierback::types::RetentionPolicy;
//! use tierback::verification::BackupVerifier;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = Catalog::new(PathBuf::from("backups"), RetentionPolicy::default());
//! catalog.initialize()?;
//! let engine = ArchiveEngine::default();
//!
//! let verifier = BackupVerifier::new(&catalog, &engine);
//! let result = verifier.verify("20240601T020000000Z_full_1a2b3c4d")?;
//! if !result.valid {
//!     println!("{}", result.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveEngine;
use crate::catalog::Catalog;
use crate::error::Result;
use crate::types::{BackupRecord, BackupStatus, BackupType, VerifyResult};
use std::fs;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Integrity checker for catalogued backups
#[derive(Debug)]
pub struct BackupVerifier<'a> {
    catalog: &'a Catalog,
    engine: &'a ArchiveEngine,
}

impl<'a> BackupVerifier<'a> {
    /// Create a verifier over `catalog`, unpacking with `engine`
    pub fn new(catalog: &'a Catalog, engine: &'a ArchiveEngine) -> Self {
        Self { catalog, engine }
    }

    /// Verify one backup
    ///
    /// # Errors
    ///
    /// Only when verification cannot run at all: an unknown id
    /// ([`crate::BackupError::NotFound`]) or an unusable scratch directory.
    /// Integrity problems are reported in the result.
    pub fn verify(&self, id: &str) -> Result<VerifyResult> {
        let start = Instant::now();
        let record = self.catalog.get(id)?;
        let mut result = VerifyResult {
            backup_id: record.id.clone(),
            ..Default::default()
        };

        if record.status != BackupStatus::Completed {
            result
                .warnings
                .push(format!("Backup status is {:?}, not Completed", record.status));
        }

        self.check_archive(&record, &mut result)?;
        self.check_chain(&record, &mut result);

        result.valid = result.errors.is_empty();
        result.duration_ms = start.elapsed().as_millis() as u64;

        if result.valid {
            info!("Backup {} verified in {}ms", record.short_id(), result.duration_ms);
        } else {
            warn!("Backup {} failed verification: {}", record.short_id(), result.summary());
        }
        Ok(result)
    }

    fn check_archive(&self, record: &BackupRecord, result: &mut VerifyResult) -> Result<()> {
        let path = self.catalog.archive_path(record);
        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                result.errors.push(format!("Archive path {:?} is not a regular file", path));
                return Ok(());
            }
            Err(e) => {
                result.errors.push(format!("Archive file missing at {:?}: {}", path, e));
                return Ok(());
            }
        };
        result.file_integrity = true;

        if metadata.len() != record.compressed_size {
            result.warnings.push(format!(
                "Archive is {} bytes on disk but {} bytes were recorded",
                metadata.len(),
                record.compressed_size
            ));
        }

        debug!("Checking {} digest of {:?}", record.checksum_algorithm, path);
        match self.engine.checksum(&path, record.checksum_algorithm) {
            Ok(actual) if actual == record.checksum => result.checksum_match = true,
            Ok(actual) => result.errors.push(format!(
                "Checksum mismatch: expected {}, got {}",
                record.checksum, actual
            )),
            Err(e) => result.errors.push(format!("Failed to read archive for checksum: {}", e)),
        }

        fs::create_dir_all(self.catalog.temp_dir())?;
        let scratch = tempfile::Builder::new()
            .prefix("verify-")
            .tempdir_in(self.catalog.temp_dir())?;
        match self.engine.decompress(&path, scratch.path()) {
            Ok(count) => {
                result.can_decompress = true;
                result.file_count = count;
                if count != record.file_count {
                    result.warnings.push(format!(
                        "Archive holds {} files but {} were recorded",
                        count, record.file_count
                    ));
                }
            }
            Err(e) => result.errors.push(format!("Archive cannot be decompressed: {}", e)),
        }
        Ok(())
    }

    fn check_chain(&self, record: &BackupRecord, result: &mut VerifyResult) {
        if record.backup_type != BackupType::Incremental {
            return;
        }
        let Some(baseline_id) = record.baseline_id.as_deref() else {
            result.errors.push("Incremental backup has no baseline".to_string());
            return;
        };
        match self.catalog.get(baseline_id) {
            Ok(baseline) => {
                if !self.catalog.archive_path(&baseline).is_file() {
                    result
                        .errors
                        .push(format!("Archive of baseline {} is missing", baseline_id));
                }
            }
            Err(_) => result
                .errors
                .push(format!("Baseline {} is not in the catalog", baseline_id)),
        }
    }
}

impl VerifyResult {
    /// One-line description of the findings
    pub fn summary(&self) -> String {
        if self.valid {
            format!(
                "Backup {} is valid ({} files, {} warnings)",
                self.backup_id,
                self.file_count,
                self.warnings.len()
            )
        } else {
            format!(
                "Backup {} is invalid: {}",
                self.backup_id,
                self.errors.join("; ")
            )
        }
    }
}
