use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures on the write side of the cache. None of these are fatal to the
/// host: the façade logs them and carries on as if the cache were empty.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache is disabled")]
    Disabled,
    #[error("refusing to store an entry with an empty integrity basis")]
    EmptyIntegrityBasis,
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    #[error("update of {len} bytes at offset {offset} exceeds the {limit} byte blob limit")]
    UpdateOutOfRange {
        offset: usize,
        len: usize,
        limit: usize,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Reasons a lookup did not produce a payload. Every variant is treated as
/// "not cached" by callers.
#[derive(Debug, Error)]
pub enum CacheMiss {
    #[error("no cache entry")]
    NotFound,
    #[error("cache entry is {len} bytes, too short to hold a digest")]
    Truncated { len: u64 },
    #[error("cache entry failed integrity verification")]
    DigestMismatch,
    #[error("failed to read cache entry: {0}")]
    Io(#[from] io::Error),
}

impl CacheMiss {
    /// True when the entry existed but its contents could not be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::DigestMismatch)
    }
}
