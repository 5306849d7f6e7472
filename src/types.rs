//! Core data types used throughout the tierback library
//!
//! This module contains the data model shared by the archive engine, the
//! catalog and the backup service.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Catalog state**: [`BackupRecord`], [`BackupType`], [`BackupStatus`] - one persisted
//!   entry per backup
//! - **Tree comparison**: [`DiffEntry`], [`DiffKind`] - ephemeral results of diffing two trees
//! - **Configuration**: [`BackupConfig`], [`RetentionPolicy`], [`ScheduleConfig`] -
//!   construction-time settings
//! - **Operations**: [`RestoreOptions`], [`RestoreResult`], [`VerifyResult`], [`BackupStats`] -
//!   call parameters and results
//!
//! ## Examples
//!
//! ```rust
//! use tierback::types::{BackupConfig, DataLevel, RetentionPolicy};
//!
//! let config = BackupConfig {
//!     include_levels: vec![DataLevel::Hot, DataLevel::Warm],
//!     retention: RetentionPolicy {
//!         keep_last_full_backups: 3,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One of the three partitions of the tiered data store
///
/// Each level is an opaque directory under the configured data root. The
/// engine never inspects what the files inside mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLevel {
    /// Frequently accessed data
    Hot,
    /// Occasionally accessed data
    Warm,
    /// Archival data
    Cold,
}

impl DataLevel {
    /// All levels in their canonical order
    pub const ALL: [DataLevel; 3] = [DataLevel::Hot, DataLevel::Warm, DataLevel::Cold];

    /// Directory name of this level, both in the data root and inside archives
    pub fn as_str(&self) -> &'static str {
        match self {
            DataLevel::Hot => "hot",
            DataLevel::Warm => "warm",
            DataLevel::Cold => "cold",
        }
    }
}

impl fmt::Display for DataLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataLevel {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(DataLevel::Hot),
            "warm" => Ok(DataLevel::Warm),
            "cold" => Ok(DataLevel::Cold),
            other => Err(BackupError::config(format!("unknown data level '{}'", other))),
        }
    }
}

/// Kind of backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Self-contained copy of every configured level
    Full,
    /// Files added or modified since the newest full backup
    Incremental,
}

impl BackupType {
    /// Lowercase name, used in ids and as the catalog subdirectory
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Work in progress (never persisted by the service)
    Pending,
    /// Archive, checksum and manifest entry all written
    Completed,
    /// Creation failed
    Failed,
}

/// Digest used to seal archives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256, 64 lowercase hex characters (default)
    #[default]
    Sha256,
    /// MD5, 32 lowercase hex characters
    Md5,
}

impl ChecksumAlgorithm {
    /// Length of the hex digest this algorithm produces
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Md5 => 32,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => f.write_str("sha256"),
            ChecksumAlgorithm::Md5 => f.write_str("md5"),
        }
    }
}

/// Archive codec. Only gzip-compressed tar is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    /// tar + gzip
    #[default]
    Gzip,
}

/// How [`crate::diff::diff_trees`] decides that a file present in both trees changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetection {
    /// Size or whole-second modification time differs.
    ///
    /// Fast, but a touched-but-unchanged file is reported as modified.
    ModifiedTime,
    /// Size differs, or the SHA-256 of the contents differs (default)
    #[default]
    Content,
}

/// A single persisted catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// `<UTC-timestamp>_<type>_<8-hex-random>`, sorts chronologically
    pub id: String,
    /// Full or incremental
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    /// Lifecycle state
    pub status: BackupStatus,
    /// Location of the tar.gz blob
    pub archive_path: PathBuf,
    /// Hex digest of the archive
    pub checksum: String,
    /// Digest used for `checksum`
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Total bytes of the regular files archived
    pub original_size: u64,
    /// Size of the archive on disk
    pub compressed_size: u64,
    /// `(1 - compressed/original) * 100`, clamped to `[0, 100)`
    pub compression_ratio: f64,
    /// Number of regular files archived
    pub file_count: u64,
    /// Levels actually present in the archive
    pub levels: Vec<DataLevel>,
    /// Full backup this incremental depends on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_id: Option<String>,
    /// When creation started
    pub created_at: DateTime<Utc>,
    /// When the record was sealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    /// Get a short version of the ID for display
    pub fn short_id(&self) -> &str {
        self.id.rsplit('_').next().unwrap_or(&self.id)
    }

    /// Seconds between creation and completion, if completed
    pub fn duration_secs(&self) -> Option<f64> {
        self.completed_at
            .map(|done| (done - self.created_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Classification of a path when diffing a source tree against a baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiffKind {
    /// Only in the source
    Added,
    /// In both, but changed
    Modified,
    /// Only in the baseline
    Deleted,
}

/// One changed path. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiffEntry {
    /// Path relative to the tree roots
    pub path: PathBuf,
    /// What happened to it
    pub kind: DiffKind,
}

/// Rules governing which backups the catalog deletes automatically
///
/// A full backup that is still the baseline of a retained incremental is
/// never deleted, whatever these counts and ages say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Newest full backups always kept
    pub keep_last_full_backups: usize,
    /// Incrementals younger than this are kept
    pub keep_incremental_days: i64,
    /// Months for which the newest full backup of the month is kept
    pub keep_monthly_backups: usize,
    /// Nothing older than this survives (baselines in use excepted)
    pub max_age_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last_full_backups: 7,
            keep_incremental_days: 30,
            keep_monthly_backups: 12,
            max_age_days: 365,
        }
    }
}

/// Cron cadences consumed by [`crate::scheduler::BackupScheduler`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expression for full backups (e.g. weekly)
    pub full: Option<String>,
    /// Cron expression for incremental backups (e.g. daily)
    pub incremental: Option<String>,
}

/// Configuration for a backup service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Catalog root: `full/`, `incremental/`, `temp/` and `manifest.json` live here
    pub backup_root: PathBuf,
    /// Directory containing one subdirectory per data level
    pub data_root: PathBuf,
    /// Levels to back up
    pub include_levels: Vec<DataLevel>,
    /// Archive codec
    pub compression: CompressionCodec,
    /// gzip level, 1 (fastest) to 9 (smallest)
    pub compression_level: u32,
    /// Digest used to seal archives
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Retention rules
    pub retention: RetentionPolicy,
    /// How incrementals detect modified files
    pub change_detection: ChangeDetection,
    /// Glob patterns, relative to each level root, excluded from backups
    pub exclude_patterns: Vec<String>,
    /// Optional cron cadences for the scheduler
    pub schedule: Option<ScheduleConfig>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("./backups"),
            data_root: PathBuf::from("./data"),
            include_levels: DataLevel::ALL.to_vec(),
            compression: CompressionCodec::Gzip,
            compression_level: 6,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            retention: RetentionPolicy::default(),
            change_detection: ChangeDetection::Content,
            exclude_patterns: Vec::new(),
            schedule: None,
        }
    }
}

impl BackupConfig {
    /// Parse a configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BackupConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check that the configuration describes a usable service
    pub fn validate(&self) -> Result<()> {
        if !(1..=9).contains(&self.compression_level) {
            return Err(BackupError::config(format!(
                "compression_level must be between 1 and 9, got {}",
                self.compression_level
            )));
        }
        if self.include_levels.is_empty() {
            return Err(BackupError::config("include_levels must name at least one level"));
        }
        for (i, level) in self.include_levels.iter().enumerate() {
            if self.include_levels[..i].contains(level) {
                return Err(BackupError::config(format!("level '{}' listed twice", level)));
            }
        }
        if self.retention.keep_incremental_days < 0 || self.retention.max_age_days < 0 {
            return Err(BackupError::config("retention ages must not be negative"));
        }
        for pattern in &self.exclude_patterns {
            globset::Glob::new(pattern)?;
        }
        Ok(())
    }

    /// Source directory of a level
    pub fn level_path(&self, level: DataLevel) -> PathBuf {
        self.data_root.join(level.as_str())
    }
}

/// Size accounting returned by [`crate::archive::ArchiveEngine::compress`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArchiveStats {
    /// Total bytes of regular files archived
    pub original_size: u64,
    /// Archive size on disk
    pub compressed_size: u64,
    /// Percentage saved, in `[0, 100)`
    pub compression_ratio: f64,
    /// Regular files archived
    pub file_count: u64,
}

impl ArchiveStats {
    /// `(1 - compressed/original) * 100`, clamped to `[0, 100)`. Zero for empty input.
    pub fn ratio(original_size: u64, compressed_size: u64) -> f64 {
        if original_size == 0 {
            return 0.0;
        }
        let ratio = (1.0 - compressed_size as f64 / original_size as f64) * 100.0;
        ratio.clamp(0.0, 99.99)
    }
}

/// Fields handed to [`crate::catalog::Catalog::save`]
#[derive(Debug, Clone)]
pub struct NewBackup {
    /// Full or incremental
    pub backup_type: BackupType,
    /// Freshly written archive; the catalog moves it under its root
    pub archive_path: PathBuf,
    /// Archive digest
    pub checksum: String,
    /// Digest algorithm
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Compression accounting
    pub stats: ArchiveStats,
    /// Levels present in the archive
    pub levels: Vec<DataLevel>,
    /// Baseline full backup for incrementals
    pub baseline_id: Option<String>,
    /// When creation started; also the timestamp embedded in the id
    pub created_at: DateTime<Utc>,
}

/// A record together with the resolved location of its archive
#[derive(Debug, Clone)]
pub struct LoadedBackup {
    /// Archive path, known to exist at load time
    pub path: PathBuf,
    /// Catalog entry
    pub record: BackupRecord,
}

/// Options for [`crate::BackupService::restore_backup`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Destination; each level lands in `target_path/<level>`
    pub target_path: PathBuf,
    /// Clear each destination level before writing the full layer
    pub overwrite: bool,
    /// Re-hash the requested archive and abort on mismatch before touching the target
    pub verify_checksum: bool,
    /// Restrict restoration to these levels (default: the record's own levels)
    pub include_levels: Option<Vec<DataLevel>>,
}

impl RestoreOptions {
    /// Restore into `target_path` with checksum verification and no overwrite
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            overwrite: false,
            verify_checksum: true,
            include_levels: None,
        }
    }

    /// Set whether destination levels are cleared first
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set whether the archive checksum is verified first
    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Restrict restoration to the given levels
    pub fn levels(mut self, levels: Vec<DataLevel>) -> Self {
        self.include_levels = Some(levels);
        self
    }
}

/// Result of a restore operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Backup that was requested
    pub backup_id: String,
    /// Records applied, oldest (full) first
    pub chain: Vec<String>,
    /// Files written across all layers
    pub files_restored: u64,
    /// Distinct levels written
    pub levels_restored: Vec<DataLevel>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Findings of a non-destructive backup verification
///
/// `valid` is true exactly when `errors` is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyResult {
    /// Backup that was checked
    pub backup_id: String,
    /// Overall verdict
    pub valid: bool,
    /// Archive exists and is a readable regular file
    pub file_integrity: bool,
    /// Recomputed digest equals the sealed one
    pub checksum_match: bool,
    /// Archive decompresses cleanly
    pub can_decompress: bool,
    /// Regular files found while decompressing
    pub file_count: u64,
    /// Problems that make the backup unusable
    pub errors: Vec<String>,
    /// Suspicious but non-fatal observations
    pub warnings: Vec<String>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Aggregates over the manifest, computed by the catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Records in the manifest
    pub total_backups: usize,
    /// Full records
    pub full_backups: usize,
    /// Incremental records
    pub incremental_backups: usize,
    /// Sum of archive sizes
    pub total_size: u64,
    /// Sum of archived file sizes
    pub total_original_size: u64,
    /// Mean compression ratio over all records, 0 when empty
    pub avg_compression_ratio: f64,
    /// Creation time of the oldest record
    pub oldest_backup: Option<DateTime<Utc>>,
    /// Creation time of the newest record
    pub newest_backup: Option<DateTime<Utc>>,
}

/// Storage statistics plus history-derived fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStats {
    /// Catalog aggregates
    #[serde(flatten)]
    pub storage: StorageStats,
    /// Most recent full backup
    pub last_full_backup: Option<BackupRecord>,
    /// Most recent incremental backup
    pub last_incremental_backup: Option<BackupRecord>,
    /// Mean of `completed_at - created_at` over completed records, in seconds
    pub avg_backup_duration: f64,
    /// `completed / total * 100`, 100 when there are no records
    pub success_rate: f64,
}
