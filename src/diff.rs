//! File-level diff between two directory trees
//!
//! Compares a *source* tree against a *baseline* tree, keyed by path relative
//! to each root:
//!
//! - only in source → [`DiffKind::Added`]
//! - in both, changed → [`DiffKind::Modified`]
//! - only in baseline → [`DiffKind::Deleted`]
//!
//! Unchanged files are omitted. What counts as "changed" depends on the
//! [`ChangeDetection`] mode:
//!
//! - [`ChangeDetection::ModifiedTime`] compares size and whole-second mtimes.
//!   Archives only keep second precision, so sub-second differences would
//!   otherwise flag every file. A touched-but-unchanged file is still
//!   reported as modified.
//! - [`ChangeDetection::Content`] compares size, then SHA-256 of both files.
//!   Hashing runs in parallel.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tierback::diff::diff_trees;
//! use tierback::types::{ChangeDetection, DiffKind};
//! use tierback::utils::ExcludeSet;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let changes = diff_trees(
//!     Path::new("data/hot"),
//!     Path::new("/tmp/baseline/hot"),
//!     ChangeDetection::Content,
//!     &ExcludeSet::default(),
//! )?;
//! let added = changes.iter().filter(|c| c.kind == DiffKind::Added).count();
//! println!("{} new files", added);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::types::{ChangeDetection, ChecksumAlgorithm, DiffEntry, DiffKind};
use crate::utils::{self, ExcludeSet, WalkedFile};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Diff `source` against `baseline`
///
/// Either root may be missing, in which case it is treated as empty. The
/// result is sorted by path, then kind.
pub fn diff_trees(
    source: &Path,
    baseline: &Path,
    detection: ChangeDetection,
    excludes: &ExcludeSet,
) -> Result<Vec<DiffEntry>> {
    let source_files = index(utils::walk_files(source, excludes)?);
    let baseline_files = index(utils::walk_files(baseline, excludes)?);

    let mut changes = Vec::new();
    let mut candidates = Vec::new();

    for (path, file) in &source_files {
        match baseline_files.get(path) {
            None => changes.push(DiffEntry {
                path: path.clone(),
                kind: DiffKind::Added,
            }),
            Some(old) if file.size != old.size => changes.push(DiffEntry {
                path: path.clone(),
                kind: DiffKind::Modified,
            }),
            Some(old) => candidates.push((path, file, old)),
        }
    }

    let modified: Vec<Result<Option<PathBuf>>> = match detection {
        ChangeDetection::ModifiedTime => candidates
            .iter()
            .map(|(path, new, old)| {
                Ok((unix_secs(new.modified) != unix_secs(old.modified)).then(|| (*path).clone()))
            })
            .collect(),
        ChangeDetection::Content => candidates
            .par_iter()
            .map(|(path, new, old)| {
                let a = utils::checksum_file(&new.absolute, ChecksumAlgorithm::Sha256)?;
                let b = utils::checksum_file(&old.absolute, ChecksumAlgorithm::Sha256)?;
                Ok((a != b).then(|| (*path).clone()))
            })
            .collect(),
    };
    for entry in modified {
        if let Some(path) = entry? {
            changes.push(DiffEntry {
                path,
                kind: DiffKind::Modified,
            });
        }
    }

    for path in baseline_files.keys() {
        if !source_files.contains_key(path) {
            changes.push(DiffEntry {
                path: path.clone(),
                kind: DiffKind::Deleted,
            });
        }
    }

    changes.sort();
    debug!(
        "Diffed {:?} against {:?}: {} changes ({} candidates compared by {:?})",
        source,
        baseline,
        changes.len(),
        candidates.len(),
        detection
    );
    Ok(changes)
}

fn index(files: Vec<WalkedFile>) -> BTreeMap<PathBuf, WalkedFile> {
    files
        .into_iter()
        .map(|file| (file.relative.clone(), file))
        .collect()
}

fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
