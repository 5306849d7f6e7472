//! Backup orchestration
//!
//! [`BackupService`] composes the [`ArchiveEngine`] and the [`Catalog`] into
//! the full and incremental backup workflows, chained restore, verification,
//! statistics and retention.
//!
//! ## Execution model
//!
//! Every disk-bound step (copy, diff, compress, checksum, decompress, catalog
//! writes) runs on tokio's blocking pool, so the async methods never stall the
//! reactor. Within one call the steps are strictly sequential.
//!
//! ## Mutual exclusion
//!
//! A `tokio::sync::RwLock<()>` serializes the writers. Backup creation and
//! retention take the write half; restore and verify take the read half, so
//! retention cannot remove an archive a restore is still reading.
//!
//! ## Scratch space
//!
//! Each call stages its work in a fresh [`TempDir`] under `backup_root/temp`.
//! The guard is shared with the blocking steps, so the directory disappears on
//! every exit path: success, error, or cancellation once the in-flight step
//! returns. `initialize` and `shutdown` purge anything a crash left behind.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tierback::{BackupService, BackupType, RestoreOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = BackupService::builder()
//!     .backup_root("/var/backups/tierback")
//!     .data_root("/srv/data")
//!     .build()?;
//! service.initialize().await?;
//!
//! let full = service.create_backup(BackupType::Full).await?;
//! let inc = service.create_backup(BackupType::Incremental).await?;
//!
//! let restored = service
//!     .restore_backup(&inc, RestoreOptions::new("/srv/restore").overwrite(true))
//!     .await?;
//! println!("restored {} files from chain {:?}", restored.files_restored, restored.chain);
//! # let _ = full;
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveEngine;
use crate::catalog::Catalog;
use crate::error::{BackupError, Result};
use crate::types::{
    ArchiveStats, BackupConfig, BackupRecord, BackupStats, BackupStatus, BackupType,
    ChangeDetection, ChecksumAlgorithm, DataLevel, DiffKind, LoadedBackup, NewBackup,
    RestoreOptions, RestoreResult, RetentionPolicy, ScheduleConfig, VerifyResult,
};
use crate::utils::{self, ExcludeSet};
use crate::verification::BackupVerifier;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Backup orchestrator for tiered data
///
/// Construct with [`BackupService::new`] or [`BackupService::builder`], call
/// [`BackupService::initialize`] once, and [`BackupService::shutdown`] on
/// teardown. The service is `Send + Sync`; share it behind an `Arc`.
#[derive(Debug)]
pub struct BackupService {
    config: BackupConfig,
    catalog: Arc<Catalog>,
    engine: Arc<ArchiveEngine>,
    jobs: RwLock<()>,
}

impl BackupService {
    /// Create a service from a validated configuration
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] / [`BackupError::InvalidPattern`]
    ///   if `config` fails validation
    pub fn new(config: BackupConfig) -> Result<Self> {
        config.validate()?;
        let engine = ArchiveEngine::new(config.compression_level)
            .with_change_detection(config.change_detection)
            .with_excludes(ExcludeSet::new(&config.exclude_patterns)?);
        let catalog = Catalog::new(config.backup_root.clone(), config.retention.clone());

        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            engine: Arc::new(engine),
            jobs: RwLock::new(()),
        })
    }

    /// Start building a service
    pub fn builder() -> BackupServiceBuilder {
        BackupServiceBuilder::new()
    }

    /// Configuration in effect
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Underlying catalog
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Whether a backup or retention run currently holds the write lock
    pub fn is_busy(&self) -> bool {
        self.jobs.try_write().is_err()
    }

    /// Prepare the backup root and load the catalog
    ///
    /// Idempotent. Scratch directories left by an earlier crash are removed.
    /// Waits for running jobs first, since it clears their scratch space.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let _job = self.jobs.write().await;
        info!("Initializing backup service at {:?}", self.config.backup_root);
        let catalog = Arc::clone(&self.catalog);
        tokio::task::spawn_blocking(move || {
            catalog.initialize()?;
            utils::clear_dir(&catalog.temp_dir())
        })
        .await?
    }

    /// Create a backup of the configured levels
    ///
    /// Returns the new backup id. On failure no catalog record is left behind.
    ///
    /// # Errors
    ///
    /// - [`BackupError::NoBaseline`] for an incremental when no full backup exists
    /// - Any archive or catalog error, unchanged
    pub async fn create_backup(&self, backup_type: BackupType) -> Result<String> {
        self.create_backup_with_cancel(backup_type, CancellationToken::new())
            .await
    }

    /// [`BackupService::create_backup`] that aborts with [`BackupError::Cancelled`]
    /// when `cancel` fires before the catalog write starts
    #[instrument(skip(self, cancel))]
    pub async fn create_backup_with_cancel(
        &self,
        backup_type: BackupType,
        cancel: CancellationToken,
    ) -> Result<String> {
        let _job = self.jobs.write().await;
        self.ensure_initialized()?;

        let created_at = Utc::now();
        info!("Creating {} backup", backup_type);
        let result = match backup_type {
            BackupType::Full => self.run_full(created_at, &cancel).await,
            BackupType::Incremental => self.run_incremental(created_at, &cancel).await,
        };

        match &result {
            Ok(id) => info!("Created {} backup {}", backup_type, id),
            Err(BackupError::Cancelled) => warn!("{} backup cancelled", backup_type),
            Err(e) => error!("{} backup failed: {}", backup_type, e),
        }
        result
    }

    async fn run_full(
        &self,
        created_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let scratch = Arc::new(self.scratch("full-")?);
        let staging = scratch.path().join("staging");
        let levels = self.config.include_levels.clone();
        let sources: Vec<(DataLevel, PathBuf)> = levels
            .iter()
            .map(|&level| (level, self.config.level_path(level)))
            .collect();

        let engine = Arc::clone(&self.engine);
        let guard = Arc::clone(&scratch);
        let target = staging.clone();
        let token = cancel.clone();
        let copied = self
            .step(cancel, "copy", move || {
                let _scratch = guard;
                let mut copied = 0;
                for (level, source) in sources {
                    let dest = target.join(level.as_str());
                    let count = engine.stage_tree(&source, &dest, &token)?;
                    debug!("Staged {} files of level {}", count, level);
                    copied += count;
                }
                Ok(copied)
            })
            .await?;
        debug!("Staged {} files for full backup", copied);

        let (archive_path, stats, checksum) = self.seal(cancel, &scratch, staging).await?;
        self.commit(
            cancel,
            scratch,
            NewBackup {
                backup_type: BackupType::Full,
                archive_path,
                checksum,
                checksum_algorithm: self.config.checksum_algorithm,
                stats,
                levels,
                baseline_id: None,
                created_at,
            },
        )
        .await
    }

    async fn run_incremental(
        &self,
        created_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let Some(baseline) = self.catalog.latest(BackupType::Full)? else {
            warn!("Incremental backup requested but no full backup exists");
            return Err(BackupError::NoBaseline);
        };
        let baseline = self.catalog.load(&baseline.id)?;
        debug!("Using full backup {} as baseline", baseline.record.id);

        let scratch = Arc::new(self.scratch("incremental-")?);
        let baseline_dir = scratch.path().join("baseline");
        let staging = scratch.path().join("staging");

        let engine = Arc::clone(&self.engine);
        let guard = Arc::clone(&scratch);
        let archive = baseline.path.clone();
        let unpack_dir = baseline_dir.clone();
        let token = cancel.clone();
        self.step(cancel, "unpack baseline", move || {
            let _scratch = guard;
            engine.decompress_with_cancel(&archive, &unpack_dir, &token)
        })
        .await?;

        let engine = Arc::clone(&self.engine);
        let guard = Arc::clone(&scratch);
        let sources: Vec<(DataLevel, PathBuf)> = self
            .config
            .include_levels
            .iter()
            .map(|&level| (level, self.config.level_path(level)))
            .collect();
        let target = staging.clone();
        let token = cancel.clone();
        let levels = self
            .step(cancel, "diff", move || {
                let _scratch = guard;
                stage_changes(&engine, &sources, &baseline_dir, &target, &token)
            })
            .await?;

        let (archive_path, stats, checksum) = self.seal(cancel, &scratch, staging).await?;
        self.commit(
            cancel,
            scratch,
            NewBackup {
                backup_type: BackupType::Incremental,
                archive_path,
                checksum,
                checksum_algorithm: self.config.checksum_algorithm,
                stats,
                levels,
                baseline_id: Some(baseline.record.id),
                created_at,
            },
        )
        .await
    }

    /// Compress `staging` into the scratch dir and checksum the result
    async fn seal(
        &self,
        cancel: &CancellationToken,
        scratch: &Arc<TempDir>,
        staging: PathBuf,
    ) -> Result<(PathBuf, ArchiveStats, String)> {
        let engine = Arc::clone(&self.engine);
        let guard = Arc::clone(scratch);
        let archive_path = scratch.path().join("archive.tar.gz");
        let algorithm = self.config.checksum_algorithm;
        let token = cancel.clone();
        self.step(cancel, "compress", move || {
            let _scratch = guard;
            let stats = engine.compress_with_cancel(&staging, &archive_path, &token)?;
            let checksum = engine.checksum(&archive_path, algorithm)?;
            Ok((archive_path, stats, checksum))
        })
        .await
    }

    /// Hand the sealed archive to the catalog. Not cancellable once started.
    async fn commit(
        &self,
        cancel: &CancellationToken,
        scratch: Arc<TempDir>,
        backup: NewBackup,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        let catalog = Arc::clone(&self.catalog);
        tokio::task::spawn_blocking(move || {
            let _scratch = scratch;
            catalog.save(backup)
        })
        .await?
    }

    /// Restore a backup, and for an incremental its baseline first
    ///
    /// Each level lands in `options.target_path/<level>`. When
    /// `options.verify_checksum` is set the requested archive is re-hashed
    /// before anything under the target is touched.
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] if the id, or any archive of its chain, is missing
    /// - [`BackupError::ChecksumMismatch`] if verification fails; the target is untouched
    /// - [`BackupError::Decompression`] for a corrupt archive
    pub async fn restore_backup(
        &self,
        id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreResult> {
        self.restore_backup_with_cancel(id, options, CancellationToken::new())
            .await
    }

    /// [`BackupService::restore_backup`] that aborts with [`BackupError::Cancelled`]
    /// when `cancel` fires
    ///
    /// Layers already written stay in place; a cancelled restore leaves a
    /// partially restored target. Nothing is written to the target after
    /// this returns.
    #[instrument(skip(self, cancel))]
    pub async fn restore_backup_with_cancel(
        &self,
        id: &str,
        options: RestoreOptions,
        cancel: CancellationToken,
    ) -> Result<RestoreResult> {
        let _job = self.jobs.read().await;
        self.ensure_initialized()?;
        let start = Instant::now();
        info!("Restoring backup {} into {:?}", id, options.target_path);

        let result = self.run_restore(id, &options, &cancel).await;
        match result {
            Ok(mut restored) => {
                restored.duration_ms = start.elapsed().as_millis() as u64;
                info!(
                    "Restored {} files across {} layers in {}ms",
                    restored.files_restored,
                    restored.chain.len(),
                    restored.duration_ms
                );
                Ok(restored)
            }
            Err(e) => {
                error!("Restore of {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    async fn run_restore(
        &self,
        id: &str,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreResult> {
        let chain = resolve_chain(&self.catalog, id)?;
        let requested = chain
            .last()
            .ok_or_else(|| BackupError::internal("empty restore chain"))?
            .clone();

        if options.verify_checksum {
            let engine = Arc::clone(&self.engine);
            let loaded = requested.clone();
            self.step(cancel, "verify checksum", move || {
                let actual = engine.checksum(&loaded.path, loaded.record.checksum_algorithm)?;
                if actual != loaded.record.checksum {
                    return Err(BackupError::ChecksumMismatch {
                        id: loaded.record.id,
                        expected: loaded.record.checksum,
                        actual,
                    });
                }
                Ok(())
            })
            .await?;
            debug!("Checksum of {} verified", requested.record.id);
        }

        let scratch = Arc::new(self.scratch("restore-")?);
        let mut result = RestoreResult {
            backup_id: requested.record.id.clone(),
            chain: chain.iter().map(|l| l.record.id.clone()).collect(),
            files_restored: 0,
            levels_restored: Vec::new(),
            duration_ms: 0,
        };

        for (position, layer) in chain.into_iter().enumerate() {
            let levels = options
                .include_levels
                .clone()
                .unwrap_or_else(|| layer.record.levels.clone());
            let engine = Arc::clone(&self.engine);
            let guard = Arc::clone(&scratch);
            let target = options.target_path.clone();
            // Only the full layer may clear, overlays must keep baseline files
            let clear = options.overwrite && position == 0;
            let layer_id = layer.record.id.clone();
            let token = cancel.clone();

            let (files, written) = self
                .step(cancel, "apply layer", move || {
                    let unpacked = guard.path().join(format!("layer-{}", position));
                    engine.decompress_with_cancel(&layer.path, &unpacked, &token)?;
                    let applied =
                        apply_layer(&engine, &unpacked, &target, &levels, clear, &token);
                    fs::remove_dir_all(&unpacked)?;
                    applied
                })
                .await?;

            debug!("Applied layer {} ({} files)", layer_id, files);
            result.files_restored += files;
            for level in written {
                if !result.levels_restored.contains(&level) {
                    result.levels_restored.push(level);
                }
            }
        }

        result.levels_restored.sort();
        Ok(result)
    }

    /// Non-destructive integrity check of one backup
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] for an unknown id; integrity problems are
    ///   reported in the result instead
    #[instrument(skip(self))]
    pub async fn verify_backup(&self, id: &str) -> Result<VerifyResult> {
        let _job = self.jobs.read().await;
        self.ensure_initialized()?;
        let catalog = Arc::clone(&self.catalog);
        let engine = Arc::clone(&self.engine);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || BackupVerifier::new(&catalog, &engine).verify(&id))
            .await?
    }

    /// Records newest first, optionally of one type only
    pub async fn list_backups(&self, filter: Option<BackupType>) -> Result<Vec<BackupRecord>> {
        let catalog = Arc::clone(&self.catalog);
        tokio::task::spawn_blocking(move || catalog.list(filter)).await?
    }

    /// Catalog aggregates plus history-derived fields
    #[instrument(skip(self))]
    pub async fn get_backup_stats(&self) -> Result<BackupStats> {
        let catalog = Arc::clone(&self.catalog);
        let (storage, records) = tokio::task::spawn_blocking(move || {
            Ok::<_, BackupError>((catalog.get_storage_stats()?, catalog.list(None)?))
        })
        .await??;

        let last_full_backup = records
            .iter()
            .find(|r| r.backup_type == BackupType::Full)
            .cloned();
        let last_incremental_backup = records
            .iter()
            .find(|r| r.backup_type == BackupType::Incremental)
            .cloned();

        let durations: Vec<f64> = records
            .iter()
            .filter(|r| r.status == BackupStatus::Completed)
            .filter_map(BackupRecord::duration_secs)
            .collect();
        let avg_backup_duration = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        let completed = records
            .iter()
            .filter(|r| r.status == BackupStatus::Completed)
            .count();
        let success_rate = if records.is_empty() {
            100.0
        } else {
            completed as f64 / records.len() as f64 * 100.0
        };

        Ok(BackupStats {
            storage,
            last_full_backup,
            last_incremental_backup,
            avg_backup_duration,
            success_rate,
        })
    }

    /// Delete expired backups, see [`Catalog::apply_retention_policy`]
    #[instrument(skip(self))]
    pub async fn apply_retention_policy(&self) -> Result<Vec<String>> {
        let _job = self.jobs.write().await;
        self.ensure_initialized()?;
        let catalog = Arc::clone(&self.catalog);
        let deleted =
            tokio::task::spawn_blocking(move || catalog.apply_retention_policy()).await??;
        info!("Retention removed {} backups", deleted.len());
        Ok(deleted)
    }

    /// Wait for in-flight work, then clear scratch space
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let _job = self.jobs.write().await;
        let temp = self.catalog.temp_dir();
        tokio::task::spawn_blocking(move || utils::clear_dir(&temp)).await??;
        info!("Backup service shut down");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn jobs_for_test(&self) -> &RwLock<()> {
        &self.jobs
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.catalog.is_initialized() {
            Ok(())
        } else {
            Err(BackupError::NotInitialized(self.config.backup_root.clone()))
        }
    }

    fn scratch(&self, prefix: &str) -> Result<TempDir> {
        let temp = self.catalog.temp_dir();
        fs::create_dir_all(&temp)?;
        Ok(tempfile::Builder::new().prefix(prefix).tempdir_in(temp)?)
    }

    /// Run `work` on the blocking pool, racing it against `cancel`
    ///
    /// `work` must watch the same token. After a cancel the blocking task is
    /// still awaited, so the caller's job lock covers it until it stops.
    async fn step<T, F>(&self, cancel: &CancellationToken, name: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            debug!("Cancelled before {}", name);
            return Err(BackupError::Cancelled);
        }
        let mut handle = tokio::task::spawn_blocking(work);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            joined = &mut handle => return joined?,
        }

        debug!("Cancelled during {}, waiting for it to stop", name);
        match handle.await? {
            Ok(_) | Err(BackupError::Cancelled) => {}
            Err(e) => debug!("{} failed after cancel: {}", name, e),
        }
        Err(BackupError::Cancelled)
    }
}

/// Copy every added or modified file of each level into `staging`
///
/// Returns the levels that gained at least one file. Deletions are logged
/// only; an archive cannot express them.
fn stage_changes(
    engine: &ArchiveEngine,
    sources: &[(DataLevel, PathBuf)],
    baseline_dir: &Path,
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<DataLevel>> {
    let mut levels = Vec::new();
    for (level, source) in sources {
        let changes = engine.diff(source, &baseline_dir.join(level.as_str()))?;
        let mut staged = 0usize;
        let mut deleted = 0usize;
        for change in &changes {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            match change.kind {
                DiffKind::Added | DiffKind::Modified => {
                    engine.copy_file(
                        &source.join(&change.path),
                        &staging.join(level.as_str()).join(&change.path),
                    )?;
                    staged += 1;
                }
                DiffKind::Deleted => deleted += 1,
            }
        }
        if deleted > 0 {
            debug!(
                "Level {}: {} deletions not representable in incremental",
                level, deleted
            );
        }
        if staged > 0 {
            debug!("Level {}: staged {} changed files", level, staged);
            levels.push(*level);
        }
    }
    Ok(levels)
}

/// Copy the unpacked levels of one layer into the target
fn apply_layer(
    engine: &ArchiveEngine,
    unpacked: &Path,
    target: &Path,
    levels: &[DataLevel],
    clear: bool,
    cancel: &CancellationToken,
) -> Result<(u64, Vec<DataLevel>)> {
    let mut files = 0;
    let mut written = Vec::new();
    for level in levels {
        let source = unpacked.join(level.as_str());
        if !source.is_dir() {
            continue;
        }
        let dest = target.join(level.as_str());
        if clear {
            utils::clear_dir(&dest)?;
        }
        files += engine.copy_tree_with_cancel(&source, &dest, cancel)?;
        written.push(*level);
    }
    Ok((files, written))
}

/// Follow baseline links from `id`, oldest layer first
///
/// Every archive of the chain must exist.
fn resolve_chain(catalog: &Catalog, id: &str) -> Result<Vec<LoadedBackup>> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut next = Some(id.to_string());

    while let Some(current) = next.take() {
        if !visited.insert(current.clone()) {
            return Err(BackupError::CorruptCatalog(format!(
                "baseline cycle through {}",
                current
            )));
        }
        let loaded = catalog.load(&current)?;
        if loaded.record.backup_type == BackupType::Incremental {
            next = loaded.record.baseline_id.clone();
        }
        chain.push(loaded);
    }

    chain.reverse();
    Ok(chain)
}

/// Builder for [`BackupService`]
///
/// Starts from [`BackupConfig::default`].
///
/// # Examples
///
/// ```rust
/// use tierback::{BackupServiceBuilder, ChecksumAlgorithm, DataLevel};
///
/// let service = BackupServiceBuilder::new()
///     .backup_root("/tmp/backups")
///     .data_root("/tmp/data")
///     .include_levels(vec![DataLevel::Hot, DataLevel::Warm])
///     .checksum_algorithm(ChecksumAlgorithm::Md5)
///     .build()
///     .unwrap();
/// assert_eq!(service.config().include_levels.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BackupServiceBuilder {
    config: BackupConfig,
}

impl BackupServiceBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Catalog root
    pub fn backup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.backup_root = path.into();
        self
    }

    /// Directory holding one subdirectory per level
    pub fn data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_root = path.into();
        self
    }

    /// Levels to back up
    pub fn include_levels(mut self, levels: Vec<DataLevel>) -> Self {
        self.config.include_levels = levels;
        self
    }

    /// gzip level, 1 to 9
    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level;
        self
    }

    /// Digest used to seal archives
    pub fn checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.config.checksum_algorithm = algorithm;
        self
    }

    /// Retention rules
    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.config.retention = policy;
        self
    }

    /// How incrementals detect modified files
    pub fn change_detection(mut self, detection: ChangeDetection) -> Self {
        self.config.change_detection = detection;
        self
    }

    /// Glob patterns excluded from every level
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.exclude_patterns = patterns;
        self
    }

    /// Cron cadences for [`crate::scheduler::BackupScheduler`]
    pub fn schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.config.schedule = Some(schedule);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<BackupService> {
        BackupService::new(self.config)
    }
}
