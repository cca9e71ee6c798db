use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;

use super::key::{is_entry_file_name, shard_names};

/// Approximate running total of bytes held by the cache.
///
/// The counter is only a trigger signal for maintenance. It drifts from the
/// real directory size (other processes, failed deletes) and is reconciled by
/// [`scan_exact`] at the end of every maintenance pass.
#[derive(Debug, Default)]
pub struct SizeLedger {
    approximate_bytes: AtomicU64,
}

impl SizeLedger {
    pub fn new(initial: u64) -> Self {
        Self {
            approximate_bytes: AtomicU64::new(initial),
        }
    }

    /// Adds `bytes` and returns the new total.
    pub fn add(&self, bytes: u64) -> u64 {
        self.approximate_bytes
            .fetch_add(bytes, Ordering::AcqRel)
            .saturating_add(bytes)
    }

    pub fn snapshot(&self) -> u64 {
        self.approximate_bytes.load(Ordering::Acquire)
    }

    pub fn reset(&self, bytes: u64) {
        self.approximate_bytes.store(bytes, Ordering::Release);
    }
}

/// Sums the sizes of every committed entry across all shards.
///
/// Unreadable shards and entries count as zero.
pub fn scan_exact(root: &Path) -> u64 {
    shard_names()
        .collect::<Vec<_>>()
        .par_iter()
        .map(|shard| shard_size(&root.join(shard)))
        .sum()
}

fn shard_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| is_entry_file_name(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| entry.metadata().ok())
        .filter(fs::Metadata::is_file)
        .map(|metadata| metadata.len())
        .sum()
}
