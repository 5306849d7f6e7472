//! Stateless tree and archive primitives
//!
//! [`ArchiveEngine`] knows nothing about full or incremental backups. It
//! copies trees, diffs trees, packs a tree into a gzip-compressed tar
//! archive, unpacks one, and checksums files.
//!
//! ## Archive format
//!
//! Archives are plain `tar.gz`. Entries are written in sorted path order with
//! relative paths, full headers (mode and mtime) and no symlinks, so any tar
//! implementation can read them back. An empty tree produces a valid archive
//! with no entries.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tierback::archive::ArchiveEngine;
//! use tierback::types::ChecksumAlgorithm;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ArchiveEngine::new(6);
//! let stats = engine.compress(Path::new("staging"), Path::new("out.tar.gz"))?;
//! let digest = engine.checksum(Path::new("out.tar.gz"), ChecksumAlgorithm::Sha256)?;
//! println!("{} files, {:.1}% saved", stats.file_count, stats.compression_ratio);
//! println!("sha256 {}", digest);
//! engine.decompress(Path::new("out.tar.gz"), Path::new("restored"))?;
//! # Ok(())
//! # }
//! ```

use crate::diff;
use crate::error::{BackupError, Result};
use crate::types::{ArchiveStats, ChangeDetection, ChecksumAlgorithm, DiffEntry};
use crate::utils::{self, ExcludeSet, WalkedEntry};
use filetime::FileTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Tree copy, diff, compression and checksum primitives
#[derive(Debug, Clone)]
pub struct ArchiveEngine {
    compression_level: u32,
    change_detection: ChangeDetection,
    excludes: ExcludeSet,
}

impl Default for ArchiveEngine {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ArchiveEngine {
    /// Create an engine with the given gzip level (clamped to 1..=9)
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: compression_level.clamp(1, 9),
            change_detection: ChangeDetection::default(),
            excludes: ExcludeSet::default(),
        }
    }

    /// Use `detection` for [`ArchiveEngine::diff`]
    pub fn with_change_detection(mut self, detection: ChangeDetection) -> Self {
        self.change_detection = detection;
        self
    }

    /// Skip paths matching `excludes` when reading live data
    ///
    /// Patterns are matched relative to the tree handed to
    /// [`ArchiveEngine::stage_tree`] or [`ArchiveEngine::diff`]. Archives and
    /// restores always carry every entry.
    pub fn with_excludes(mut self, excludes: ExcludeSet) -> Self {
        self.excludes = excludes;
        self
    }

    /// Recursively mirror `source` into `dest`
    ///
    /// Directories are created as needed; file bytes and modification times
    /// are preserved. Symlinks are skipped. Returns the number of regular
    /// files copied, 0 for an empty or missing source.
    pub fn copy_tree(&self, source: &Path, dest: &Path) -> Result<u64> {
        self.copy_tree_with_cancel(source, dest, &CancellationToken::new())
    }

    /// [`ArchiveEngine::copy_tree`] that stops between files once `cancel` fires
    pub fn copy_tree_with_cancel(
        &self,
        source: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        mirror(source, dest, &ExcludeSet::default(), cancel)
    }

    /// Copy live data from `source` into `dest`, skipping excluded paths
    pub fn stage_tree(
        &self,
        source: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        mirror(source, dest, &self.excludes, cancel)
    }

    /// Copy one file, creating parent directories and preserving its mtime
    pub fn copy_file(&self, source: &Path, dest: &Path) -> Result<()> {
        copy_file(source, dest)
    }

    /// Diff `source` against `baseline`, see [`crate::diff::diff_trees`]
    ///
    /// Excludes apply to both trees, so an excluded file is never reported.
    pub fn diff(&self, source: &Path, baseline: &Path) -> Result<Vec<DiffEntry>> {
        diff::diff_trees(source, baseline, self.change_detection, &self.excludes)
    }

    /// Pack `source` into a tar.gz archive at `archive_path`
    ///
    /// Entries carry paths relative to `source`. An empty or missing source
    /// yields a valid empty archive with `file_count == 0`.
    pub fn compress(&self, source: &Path, archive_path: &Path) -> Result<ArchiveStats> {
        self.compress_with_cancel(source, archive_path, &CancellationToken::new())
    }

    /// [`ArchiveEngine::compress`] that stops between entries once `cancel` fires
    ///
    /// A cancelled call leaves a partial file at `archive_path`.
    pub fn compress_with_cancel(
        &self,
        source: &Path,
        archive_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ArchiveStats> {
        let start = Instant::now();
        if let Some(parent) = archive_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(archive_path)?;
        let level = Compression::new(self.compression_level);
        let encoder = GzEncoder::new(BufWriter::new(file), level);
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.mode(tar::HeaderMode::Complete);

        let mut stats = ArchiveStats::default();
        for entry in utils::walk_tree(source, &ExcludeSet::default())? {
            check(cancel)?;
            match entry {
                WalkedEntry::Dir { absolute, relative } => {
                    builder.append_dir(&relative, &absolute).map_err(|e| {
                        BackupError::compression(format!("{:?}: {}", relative, e))
                    })?;
                }
                WalkedEntry::File(walked) => {
                    let mut src = File::open(&walked.absolute)?;
                    builder
                        .append_file(&walked.relative, &mut src)
                        .map_err(|e| {
                            BackupError::compression(format!("{:?}: {}", walked.relative, e))
                        })?;
                    stats.file_count += 1;
                    stats.original_size += walked.size;
                    trace!("Archived {:?} ({} bytes)", walked.relative, walked.size);
                }
            }
        }

        let encoder = builder.into_inner().map_err(|e| {
            BackupError::compression(format!("failed to finish tar stream: {}", e))
        })?;
        let writer = encoder.finish().map_err(|e| {
            BackupError::compression(format!("failed to finish gzip stream: {}", e))
        })?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::compression(format!("failed to flush archive: {}", e)))?;
        file.sync_all()?;

        stats.compressed_size = fs::metadata(archive_path)?.len();
        stats.compression_ratio = ArchiveStats::ratio(stats.original_size, stats.compressed_size);

        debug!(
            "Compressed {} files ({}) into {:?} ({}, {:.1}% saved) in {}ms",
            stats.file_count,
            utils::format_bytes(stats.original_size),
            archive_path,
            utils::format_bytes(stats.compressed_size),
            stats.compression_ratio,
            start.elapsed().as_millis()
        );
        Ok(stats)
    }

    /// Unpack the archive at `archive_path` into `dest`
    ///
    /// Modification times are restored from the archive headers. The gzip
    /// trailer is read and checked even after the last tar entry, so a
    /// truncated archive fails instead of silently yielding a partial tree.
    ///
    /// Returns the number of regular files unpacked.
    ///
    /// # Errors
    ///
    /// - [`BackupError::Decompression`] if the archive is missing, truncated
    ///   or not a tar.gz stream
    pub fn decompress(&self, archive_path: &Path, dest: &Path) -> Result<u64> {
        self.decompress_with_cancel(archive_path, dest, &CancellationToken::new())
    }

    /// [`ArchiveEngine::decompress`] that stops between entries once `cancel` fires
    pub fn decompress_with_cancel(
        &self,
        archive_path: &Path,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if !archive_path.is_file() {
            return Err(BackupError::decompression(format!(
                "archive {:?} does not exist",
                archive_path
            )));
        }
        fs::create_dir_all(dest)?;

        let file = File::open(archive_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);

        let corrupt = |e: io::Error| {
            BackupError::decompression(format!("invalid archive {:?}: {}", archive_path, e))
        };

        let mut file_count = 0u64;
        for entry in archive.entries().map_err(corrupt)? {
            check(cancel)?;
            let mut entry = entry.map_err(corrupt)?;
            if entry.header().entry_type().is_file() {
                file_count += 1;
            }
            entry.unpack_in(dest).map_err(corrupt)?;
        }

        // Drain to EOF so the gzip CRC and length trailer get verified
        let mut rest = archive.into_inner();
        io::copy(&mut rest, &mut io::sink()).map_err(corrupt)?;

        debug!(
            "Decompressed {} files from {:?} into {:?}",
            file_count, archive_path, dest
        );
        Ok(file_count)
    }

    /// Stream `path` through `algorithm`, returning the lowercase hex digest
    pub fn checksum(&self, path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
        utils::checksum_file(path, algorithm)
    }
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(BackupError::Cancelled)
    } else {
        Ok(())
    }
}

fn mirror(
    source: &Path,
    dest: &Path,
    excludes: &ExcludeSet,
    cancel: &CancellationToken,
) -> Result<u64> {
    if !source.exists() {
        debug!("Copy source {:?} does not exist, nothing copied", source);
        return Ok(0);
    }
    fs::create_dir_all(dest)?;

    let mut copied = 0u64;
    for entry in utils::walk_tree(source, excludes)? {
        check(cancel)?;
        match entry {
            WalkedEntry::Dir { relative, .. } => {
                fs::create_dir_all(dest.join(relative))?;
            }
            WalkedEntry::File(file) => {
                copy_file(&file.absolute, &dest.join(&file.relative))?;
                copied += 1;
            }
        }
    }

    debug!("Copied {} files from {:?} to {:?}", copied, source, dest);
    Ok(copied)
}

fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    let metadata = fs::metadata(source)?;
    filetime::set_file_mtime(dest, FileTime::from_last_modification_time(&metadata))?;
    Ok(())
}
