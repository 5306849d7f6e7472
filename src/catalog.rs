//! Backup catalog: manifest and archive blob storage
//!
//! The catalog is the only component that writes the manifest. It owns the
//! on-disk layout under the backup root:
//!
//! ```text
//! backup_root/
//! ├── manifest.json        # Ordered list of BackupRecords
//! ├── full/                # Archives of full backups
//! │   └── <id>.tar.gz
//! ├── incremental/         # Archives of incremental backups
//! │   └── <id>.tar.gz
//! └── temp/                # Scratch space, owned by the backup service
//! ```
//!
//! ## Consistency
//!
//! - The manifest is replaced atomically (temp file, fsync, rename), so a
//!   crash leaves either the old or the new manifest, never a torn one.
//! - `save` moves the blob into place *before* the manifest write and removes
//!   it again if the write fails. A crash between the two leaves an
//!   unreferenced blob, which `initialize` sweeps.
//! - Deletion rewrites the manifest first, then removes blobs, so a manifest
//!   entry never points at a blob that was deliberately removed.
//! - A full backup that is still the baseline of a live incremental is never
//!   deleted.
//!
//! ## Thread Safety
//!
//! Mutations (`initialize`, `save`, `delete`, retention) are serialized by a
//! writer mutex held across blob moves, sweeps and the manifest write. The
//! in-memory manifest lives behind a `parking_lot::RwLock` that is only
//! write-locked to swap in the new snapshot, so readers never wait on disk.

use crate::error::{BackupError, Result};
use crate::retention;
use crate::types::{
    BackupRecord, BackupStatus, BackupType, LoadedBackup, NewBackup, RetentionPolicy, StorageStats,
};
use crate::utils;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;
const ARCHIVE_EXTENSION: &str = "tar.gz";

/// On-disk manifest document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    backups: Vec<BackupRecord>,
}

/// Durable record-keeping for backups
///
/// # Example
///
/// ```rust,no_run
/// use tierback::catalog::Catalog;
/// use tierback::types::{BackupType, RetentionPolicy};
/// use std::path::PathBuf;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let catalog = Catalog::new(PathBuf::from("/var/backups/store"), RetentionPolicy::default());
/// catalog.initialize()?;
/// for record in catalog.list(Some(BackupType::Full))? {
///     println!("{} {} files", record.id, record.file_count);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
    retention: RetentionPolicy,
    manifest: RwLock<Option<Manifest>>,
    writer: Mutex<()>,
}

impl Catalog {
    /// Create a catalog handle. Nothing touches the disk until [`Catalog::initialize`].
    pub fn new(root: PathBuf, retention: RetentionPolicy) -> Self {
        Self {
            root,
            retention,
            manifest: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    /// Root directory of the catalog
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory handed to the backup service
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Retention rules this catalog enforces
    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Whether [`Catalog::initialize`] has loaded a manifest
    pub fn is_initialized(&self) -> bool {
        self.manifest.read().is_some()
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn blob_dir(&self, backup_type: BackupType) -> PathBuf {
        self.root.join(backup_type.as_str())
    }

    /// Create the directory layout and load the manifest
    ///
    /// Idempotent. An existing manifest is loaded and validated; unreferenced
    /// blobs left by an interrupted `save` are removed.
    ///
    /// # Errors
    ///
    /// - [`BackupError::Io`] if the layout cannot be created
    /// - [`BackupError::Json`] / [`BackupError::CorruptCatalog`] if the manifest is unreadable
    pub fn initialize(&self) -> Result<()> {
        let _writer = self.writer.lock();
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.blob_dir(BackupType::Full))?;
        fs::create_dir_all(self.blob_dir(BackupType::Incremental))?;
        fs::create_dir_all(self.temp_dir())?;

        let manifest_path = self.manifest_path();
        let manifest = if manifest_path.exists() {
            let text = fs::read_to_string(&manifest_path)?;
            let manifest: Manifest = serde_json::from_str(&text)?;
            validate_manifest(&manifest)?;
            manifest
        } else {
            let manifest = Manifest {
                version: MANIFEST_VERSION,
                backups: Vec::new(),
            };
            self.write_manifest(&manifest)?;
            manifest
        };

        let swept = self.sweep_orphans(&manifest)?;
        info!(
            "Catalog ready at {:?}: {} backups, {} orphaned blobs removed",
            self.root,
            manifest.backups.len(),
            swept
        );
        *self.manifest.write() = Some(manifest);
        Ok(())
    }

    fn sweep_orphans(&self, manifest: &Manifest) -> Result<usize> {
        let referenced: HashSet<PathBuf> = manifest
            .backups
            .iter()
            .map(|r| self.resolve(&r.archive_path))
            .collect();

        let mut swept = 0;
        for backup_type in [BackupType::Full, BackupType::Incremental] {
            for entry in fs::read_dir(self.blob_dir(backup_type))? {
                let path = entry?.path();
                if path.is_file() && !referenced.contains(&path) {
                    warn!("Removing unreferenced archive {:?}", path);
                    fs::remove_file(&path)?;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    fn resolve(&self, archive_path: &Path) -> PathBuf {
        if archive_path.is_absolute() {
            archive_path.to_path_buf()
        } else {
            self.root.join(archive_path)
        }
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        utils::atomic_write(&self.manifest_path(), json.as_bytes())
    }

    fn read<T>(&self, f: impl FnOnce(&Manifest) -> T) -> Result<T> {
        let guard = self.manifest.read();
        let manifest = guard
            .as_ref()
            .ok_or_else(|| BackupError::NotInitialized(self.root.clone()))?;
        Ok(f(manifest))
    }

    /// Persist `next` and make it the in-memory manifest. Caller holds the writer lock.
    fn publish(&self, next: Manifest) -> Result<()> {
        self.write_manifest(&next)?;
        *self.manifest.write() = Some(next);
        Ok(())
    }

    /// Record a finished backup
    ///
    /// Generates the id, moves the archive to `<type>/<id>.tar.gz` and appends
    /// a `Completed` record. If the manifest cannot be written the moved blob
    /// is removed again, so a failed call leaves no trace.
    ///
    /// Returns the new id.
    pub fn save(&self, backup: NewBackup) -> Result<String> {
        let _writer = self.writer.lock();
        let mut next = self.read(Manifest::clone)?;

        if let Some(baseline) = &backup.baseline_id {
            if !next.backups.iter().any(|r| &r.id == baseline) {
                return Err(BackupError::NotFound(baseline.clone()));
            }
        }
        let mut id = generate_id(backup.backup_type, backup.created_at);
        while next.backups.iter().any(|r| r.id == id) {
            id = generate_id(backup.backup_type, backup.created_at);
        }

        let relative = PathBuf::from(backup.backup_type.as_str())
            .join(format!("{}.{}", id, ARCHIVE_EXTENSION));
        let destination = self.root.join(&relative);
        move_file(&backup.archive_path, &destination)?;

        next.backups.push(BackupRecord {
            id: id.clone(),
            backup_type: backup.backup_type,
            status: BackupStatus::Completed,
            archive_path: relative,
            checksum: backup.checksum,
            checksum_algorithm: backup.checksum_algorithm,
            original_size: backup.stats.original_size,
            compressed_size: backup.stats.compressed_size,
            compression_ratio: backup.stats.compression_ratio,
            file_count: backup.stats.file_count,
            levels: backup.levels,
            baseline_id: backup.baseline_id,
            created_at: backup.created_at,
            completed_at: Some(Utc::now()),
        });

        if let Err(e) = self.publish(next) {
            if let Err(cleanup) = fs::remove_file(&destination) {
                warn!(
                    "Failed to remove archive {:?} after manifest error: {}",
                    destination, cleanup
                );
            }
            return Err(e);
        }

        info!("Saved {} backup {}", backup.backup_type, id);
        Ok(id)
    }

    /// Metadata of `id` without touching its archive
    pub fn get(&self, id: &str) -> Result<BackupRecord> {
        self.read(|m| m.backups.iter().find(|r| r.id == id).cloned())?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    /// Absolute archive path of a record
    pub fn archive_path(&self, record: &BackupRecord) -> PathBuf {
        self.resolve(&record.archive_path)
    }

    /// Look up `id` and its archive
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] if the id is unknown or its archive was
    ///   deleted out of band
    pub fn load(&self, id: &str) -> Result<LoadedBackup> {
        let record = self.get(id)?;
        let path = self.archive_path(&record);
        if !path.is_file() {
            warn!("Archive for backup {} is missing at {:?}", id, path);
            return Err(BackupError::NotFound(id.to_string()));
        }
        Ok(LoadedBackup { path, record })
    }

    /// Records newest first, optionally of one type only
    pub fn list(&self, filter: Option<BackupType>) -> Result<Vec<BackupRecord>> {
        let mut records = self.read(|m| {
            m.backups
                .iter()
                .filter(|r| filter.map_or(true, |t| r.backup_type == t))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    /// Newest completed record of `backup_type`
    pub fn latest(&self, backup_type: BackupType) -> Result<Option<BackupRecord>> {
        Ok(self
            .list(Some(backup_type))?
            .into_iter()
            .find(|r| r.status == BackupStatus::Completed))
    }

    /// Aggregates over the whole manifest
    pub fn get_storage_stats(&self) -> Result<StorageStats> {
        self.read(|m| {
            let mut stats = StorageStats {
                total_backups: m.backups.len(),
                ..Default::default()
            };
            let mut ratio_sum = 0.0;
            for record in &m.backups {
                match record.backup_type {
                    BackupType::Full => stats.full_backups += 1,
                    BackupType::Incremental => stats.incremental_backups += 1,
                }
                stats.total_size += record.compressed_size;
                stats.total_original_size += record.original_size;
                ratio_sum += record.compression_ratio;
                stats.oldest_backup = Some(match stats.oldest_backup {
                    Some(t) if t <= record.created_at => t,
                    _ => record.created_at,
                });
                stats.newest_backup = Some(match stats.newest_backup {
                    Some(t) if t >= record.created_at => t,
                    _ => record.created_at,
                });
            }
            if !m.backups.is_empty() {
                stats.avg_compression_ratio = ratio_sum / m.backups.len() as f64;
            }
            stats
        })
    }

    /// Delete one backup and its archive
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] if the id is unknown
    /// - [`BackupError::DanglingBaseline`] if it is the baseline of incrementals
    pub fn delete(&self, id: &str) -> Result<()> {
        let _writer = self.writer.lock();
        let current = self.read(Manifest::clone)?;

        if !current.backups.iter().any(|r| r.id == id) {
            return Err(BackupError::NotFound(id.to_string()));
        }
        let dependents: Vec<String> = current
            .backups
            .iter()
            .filter(|r| r.baseline_id.as_deref() == Some(id))
            .map(|r| r.id.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(BackupError::DanglingBaseline {
                full_id: id.to_string(),
                incremental_ids: dependents,
            });
        }

        let removed = self.remove_records(current, &[id.to_string()])?;
        self.remove_blobs(&removed);
        info!("Deleted backup {}", id);
        Ok(())
    }

    /// Delete every record that has expired under the retention policy
    pub fn apply_retention_policy(&self) -> Result<Vec<String>> {
        self.apply_retention_policy_at(Utc::now())
    }

    /// [`Catalog::apply_retention_policy`] evaluated at instant `now`
    ///
    /// Full backups still referenced by a retained incremental are kept
    /// regardless of age or count. Returns the deleted ids, oldest first.
    pub fn apply_retention_policy_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let _writer = self.writer.lock();
        let current = self.read(Manifest::clone)?;

        let plan = retention::plan(&current.backups, &self.retention, now);
        for id in &plan.kept_as_baseline {
            debug!("Retention kept {} as a baseline in use", id);
        }
        if plan.expired.is_empty() {
            debug!("Retention found nothing to delete");
            return Ok(Vec::new());
        }

        let removed = self.remove_records(current, &plan.expired)?;
        self.remove_blobs(&removed);

        info!(
            "Retention deleted {} backups ({} kept as baselines)",
            plan.expired.len(),
            plan.kept_as_baseline.len()
        );
        Ok(plan.expired)
    }

    /// Drop `ids` from `current` and publish it. Returns the archive paths to remove.
    fn remove_records(&self, current: Manifest, ids: &[String]) -> Result<Vec<PathBuf>> {
        let (gone, kept): (Vec<_>, Vec<_>) =
            current.backups.into_iter().partition(|r| ids.contains(&r.id));
        let removed = gone.iter().map(|r| self.resolve(&r.archive_path)).collect();
        self.publish(Manifest {
            version: current.version,
            backups: kept,
        })?;
        Ok(removed)
    }

    fn remove_blobs(&self, paths: &[PathBuf]) {
        for path in paths {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed archive {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Failed to remove archive {:?}: {} (will be swept on next start)",
                    path, e
                ),
            }
        }
    }
}

/// `<UTC-timestamp>_<type>_<8-hex-random>`
pub fn generate_id(backup_type: BackupType, created_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        created_at.format("%Y%m%dT%H%M%S%3fZ"),
        backup_type.as_str(),
        &suffix[..8]
    )
}

fn validate_manifest(manifest: &Manifest) -> Result<()> {
    let mut ids = HashSet::new();
    for record in &manifest.backups {
        if !ids.insert(record.id.as_str()) {
            return Err(BackupError::CorruptCatalog(format!("duplicate id {}", record.id)));
        }
    }
    for record in &manifest.backups {
        if let Some(baseline) = &record.baseline_id {
            if !ids.contains(baseline.as_str()) {
                return Err(BackupError::CorruptCatalog(format!(
                    "incremental {} references missing baseline {}",
                    record.id, baseline
                )));
            }
        }
    }
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_err() {
        // Different filesystem: copy then remove
        fs::copy(from, to)?;
        fs::File::open(to)?.sync_all()?;
        fs::remove_file(from)?;
    }
    Ok(())
}
