use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry::{TEMP_EXTENSION, remove_file_best_effort};
use super::key::{is_entry_file_name, shard_names};

/// A committed entry found while scanning the shards.
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub path: PathBuf,
    /// `None` when the filesystem could not report a modification time.
    pub modified: Option<SystemTime>,
    pub size: u64,
}

/// Eviction policy for the on-disk cache
pub trait EvictionPolicy: Send + Sync {
    /// Reorder `entries` so the first element is the first to be evicted.
    fn order(&self, entries: &mut [DiskEntry]);
}

/// LRU (Least Recently Used) eviction policy
///
/// Recency is the file modification time, which reads refresh. Entries whose
/// mtime is unreadable sort ahead of everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruEvictionPolicy;

impl EvictionPolicy for LruEvictionPolicy {
    fn order(&self, entries: &mut [DiskEntry]) {
        // `None` orders before any `Some`.
        entries.sort_unstable_by_key(|entry| entry.modified);
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub scanned_entries: usize,
    pub scanned_bytes: u64,
    pub target_bytes: u64,
    pub removed_entries: usize,
    pub freed_bytes: u64,
    /// Entries that disappeared before we got to them.
    pub vanished_entries: usize,
    pub failed_deletions: usize,
    pub remaining_bytes: u64,
}

pub fn target_bytes(max_bytes: u64, fraction: f64) -> u64 {
    (max_bytes as f64 * fraction) as u64
}

/// Lists every committed entry under `root`.
pub fn enumerate_entries(root: &Path) -> Vec<DiskEntry> {
    shard_names()
        .collect::<Vec<_>>()
        .par_iter()
        .flat_map_iter(|shard| shard_entries(&root.join(shard)))
        .collect()
}

fn shard_entries(dir: &Path) -> Vec<DiskEntry> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for entry in read_dir.filter_map(Result::ok) {
        if !is_entry_file_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "could not stat cache entry");
                continue;
            }
        };
        entries.push(DiskEntry {
            modified: metadata.modified().ok(),
            size: metadata.len(),
            path,
        });
    }
    entries
}

/// Deletes least recently used entries until the cache holds at most
/// `max_bytes * target_fraction` bytes.
pub fn evict_to_target(root: &Path, max_bytes: u64, target_fraction: f64) -> EvictionReport {
    evict_with_policy(root, max_bytes, target_fraction, &LruEvictionPolicy)
}

pub fn evict_with_policy(
    root: &Path,
    max_bytes: u64,
    target_fraction: f64,
    policy: &dyn EvictionPolicy,
) -> EvictionReport {
    let mut entries = enumerate_entries(root);
    let scanned_bytes: u64 = entries.iter().map(|entry| entry.size).sum();
    let mut report = EvictionReport {
        scanned_entries: entries.len(),
        scanned_bytes,
        target_bytes: target_bytes(max_bytes, target_fraction),
        remaining_bytes: scanned_bytes,
        ..EvictionReport::default()
    };

    if report.remaining_bytes <= report.target_bytes {
        return report;
    }

    info!(
        current = report.remaining_bytes,
        target = report.target_bytes,
        entries = report.scanned_entries,
        "starting cache eviction"
    );

    policy.order(&mut entries);
    for entry in &entries {
        if report.remaining_bytes <= report.target_bytes {
            break;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                report.removed_entries += 1;
                report.freed_bytes += entry.size;
                report.remaining_bytes -= entry.size;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                report.vanished_entries += 1;
                report.remaining_bytes -= entry.size;
            }
            Err(err) => {
                report.failed_deletions += 1;
                warn!(path = %entry.path.display(), error = %err, "failed to evict cache entry");
            }
        }
    }

    info!(
        removed = report.removed_entries,
        freed = report.freed_bytes,
        failed = report.failed_deletions,
        remaining = report.remaining_bytes,
        "cache eviction complete"
    );
    report
}

/// Removes `*.tmp` files older than `max_age` left behind by writers that
/// never reached their rename. Returns how many were deleted.
pub fn sweep_stale_temp_files(root: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    shard_names()
        .collect::<Vec<_>>()
        .par_iter()
        .map(|shard| {
            let Ok(read_dir) = fs::read_dir(root.join(shard)) else {
                return 0;
            };
            read_dir
                .filter_map(Result::ok)
                .filter(|entry| {
                    Path::new(&entry.file_name())
                        .extension()
                        .is_some_and(|ext| ext == TEMP_EXTENSION)
                })
                .filter(|entry| {
                    entry
                        .metadata()
                        .and_then(|metadata| metadata.modified())
                        .ok()
                        .and_then(|modified| now.duration_since(modified).ok())
                        .is_some_and(|age| age >= max_age)
                })
                .filter(|entry| remove_file_best_effort(&entry.path(), "stale temp file"))
                .count()
        })
        .sum()
}
