//! Utility functions for tierback
//!
//! Common helpers used by the archive engine and the catalog:
//!
//! - Streaming file digests (SHA-256 and MD5)
//! - Durable atomic file replacement
//! - Tree walking that never follows symlinks and honours exclude patterns
//! - Human-readable byte formatting for log lines
//!
//! All functions are synchronous. The service runs them on the blocking pool.

use crate::error::Result;
use crate::types::ChecksumAlgorithm;
use globset::{Glob, GlobSet, GlobSetBuilder};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{trace, warn};
use walkdir::WalkDir;

/// Stream a file through `algorithm` and return the lowercase hex digest
///
/// Uses an 8KB buffer so arbitrarily large archives hash in constant memory.
///
/// # Errors
///
/// - [`crate::BackupError::Io`] if the file cannot be opened or read
pub fn checksum_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => digest_file::<Sha256>(path),
        ChecksumAlgorithm::Md5 => digest_file::<Md5>(path),
    }
}

fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of in-memory data
pub fn hash_data(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Replace `path` with `content` so that readers see either the old or the new file
///
/// The content goes to a sibling temp file which is fsynced and renamed over
/// the destination. On unix the parent directory is fsynced as well so the
/// rename itself survives a crash.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }

    Ok(())
}

/// Compiled exclude patterns, matched against paths relative to a tree root
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    globs: Option<GlobSet>,
}

impl ExcludeSet {
    /// Compile `patterns`. An empty list matches nothing.
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            globs: Some(builder.build()?),
        })
    }

    /// Whether `relative` is excluded
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.globs
            .as_ref()
            .map(|globs| globs.is_match(relative))
            .unwrap_or(false)
    }
}

/// A regular file found by [`walk_files`]
#[derive(Debug, Clone)]
pub struct WalkedFile {
    /// Absolute (or root-joined) path
    pub absolute: PathBuf,
    /// Path relative to the walk root
    pub relative: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
}

/// Entry kinds yielded by [`walk_tree`]
#[derive(Debug, Clone)]
pub enum WalkedEntry {
    /// A directory below the root (the root itself is not reported)
    Dir {
        /// Root-joined path
        absolute: PathBuf,
        /// Path relative to the root
        relative: PathBuf,
    },
    /// A regular file
    File(WalkedFile),
}

/// Walk `root` in sorted order, yielding directories and regular files
///
/// Symlinks are never followed and are skipped with a warning, as are
/// excluded paths (an excluded directory prunes its whole subtree). A root
/// that does not exist yields nothing.
pub fn walk_tree(root: &Path, excludes: &ExcludeSet) -> Result<Vec<WalkedEntry>> {
    let mut entries = Vec::new();
    if !root.exists() {
        trace!("Walk root {:?} does not exist, nothing to visit", root);
        return Ok(entries);
    }

    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| crate::BackupError::internal(e.to_string()))?
            .to_path_buf();

        if excludes.is_excluded(&relative) {
            trace!("Excluded {:?}", relative);
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            warn!("Skipping symlink {:?}", entry.path());
        } else if file_type.is_dir() {
            entries.push(WalkedEntry::Dir {
                absolute: entry.path().to_path_buf(),
                relative,
            });
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            entries.push(WalkedEntry::File(WalkedFile {
                absolute: entry.path().to_path_buf(),
                relative,
                size: metadata.len(),
                modified: metadata.modified()?,
            }));
        } else {
            warn!("Skipping special file {:?}", entry.path());
        }
    }

    Ok(entries)
}

/// Regular files under `root`, see [`walk_tree`]
pub fn walk_files(root: &Path, excludes: &ExcludeSet) -> Result<Vec<WalkedFile>> {
    Ok(walk_tree(root, excludes)?
        .into_iter()
        .filter_map(|entry| match entry {
            WalkedEntry::File(file) => Some(file),
            WalkedEntry::Dir { .. } => None,
        })
        .collect())
}

/// Remove everything inside `dir`, keeping `dir` itself. Missing dirs are fine.
pub fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let removed = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {}
            // Raced with another remover, e.g. a dropped scratch guard
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
