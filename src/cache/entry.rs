//! On-disk entry format: `payload || sha1(integrity basis)`.
//!
//! Entries are never modified in place. A write goes to a uniquely named
//! `*.tmp` sibling which is renamed over the destination only once the payload
//! and digest are fully written, so readers observe either the previous entry
//! or the new one.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use super::error::{CacheError, CacheMiss};

/// Length of the trailing SHA1 digest.
pub const DIGEST_LEN: usize = 20;

/// Extension carried by in-progress writes.
pub const TEMP_EXTENSION: &str = "tmp";

/// Selects what the trailing digest of an entry is computed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrityMode {
    /// `sha1(payload || version_token)`. Detects corrupted payloads as well as
    /// stale entries stored under a different version token.
    #[default]
    Content,
    /// `sha1(version_token)` only. Kept for reading caches written by the
    /// legacy delegate; a damaged payload with a matching token is accepted.
    LegacyToken,
}

/// The live, caller-supplied half of an entry's integrity check.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityBasis<'a> {
    mode: IntegrityMode,
    token: &'a [u8],
}

impl<'a> IntegrityBasis<'a> {
    pub fn new(mode: IntegrityMode, token: &'a [u8]) -> Self {
        Self { mode, token }
    }

    pub fn content(token: &'a [u8]) -> Self {
        Self::new(IntegrityMode::Content, token)
    }

    pub fn legacy_token(token: &'a [u8]) -> Self {
        Self::new(IntegrityMode::LegacyToken, token)
    }

    pub fn mode(&self) -> IntegrityMode {
        self.mode
    }

    /// A legacy basis with no token hashes nothing the caller controls.
    fn is_meaningless(&self) -> bool {
        self.mode == IntegrityMode::LegacyToken && self.token.is_empty()
    }

    pub fn digest(&self, payload: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha1::new();
        if self.mode == IntegrityMode::Content {
            hasher.update(payload);
        }
        hasher.update(self.token);

        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

/// Size on disk of an entry holding `payload_len` bytes.
pub fn entry_size(payload_len: usize) -> u64 {
    (payload_len + DIGEST_LEN) as u64
}

/// Atomically writes `payload` followed by its digest to `path`.
///
/// The parent directory must already exist. On failure the destination is
/// left untouched and the temporary file is removed.
pub fn write_entry(
    path: &Path,
    payload: &[u8],
    basis: &IntegrityBasis<'_>,
) -> Result<(), CacheError> {
    if basis.is_meaningless() {
        return Err(CacheError::EmptyIntegrityBasis);
    }

    let (dir, file_name) = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => (dir, name.to_string_lossy()),
        _ => {
            return Err(CacheError::io(
                path,
                io::Error::new(ErrorKind::InvalidInput, "entry path has no file name"),
            ));
        }
    };

    let prefix = format!("{file_name}.");
    let suffix = format!(".{TEMP_EXTENSION}");
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(&suffix);
    // tempfile defaults to 0600; entries get the mode a plain create would,
    // so the umask decides who else can read a shared cache root.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    let mut temp = builder
        .tempfile_in(dir)
        .map_err(|err| CacheError::io(dir, err))?;

    let digest = basis.digest(payload);
    // No fsync: a torn write surviving a crash fails digest verification.
    let write_result = (|| -> io::Result<()> {
        temp.write_all(payload)?;
        temp.write_all(&digest)?;
        temp.flush()
    })();
    if let Err(err) = write_result {
        return Err(CacheError::io(temp.path(), err));
    }

    temp.persist(path)
        .map_err(|err| CacheError::io(path, err.error))?;
    Ok(())
}

/// Reads and verifies the entry at `path`, returning its payload.
///
/// A digest mismatch deletes the entry. A verified entry has its modification
/// time bumped so eviction treats it as recently used.
pub fn read_entry(path: &Path, basis: &IntegrityBasis<'_>) -> Result<Vec<u8>, CacheMiss> {
    let mut content = match fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(CacheMiss::NotFound),
        Err(err) => return Err(CacheMiss::Io(err)),
    };

    if content.len() < DIGEST_LEN {
        return Err(CacheMiss::Truncated {
            len: content.len() as u64,
        });
    }

    let payload_len = content.len() - DIGEST_LEN;
    let computed = basis.digest(&content[..payload_len]);
    if content[payload_len..] != computed {
        remove_file_best_effort(path, "digest mismatch");
        return Err(CacheMiss::DigestMismatch);
    }

    content.truncate(payload_len);
    touch(path);
    Ok(content)
}

fn touch(path: &Path) {
    if let Err(err) = filetime::set_file_mtime(path, FileTime::now()) {
        debug!(path = %path.display(), error = %err, "failed to refresh cache entry mtime");
    }
}

/// Deletes `path`, treating an already-missing file as success.
pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => true,
        Err(err) => {
            debug!(path = %path.display(), reason, error = %err, "failed to remove cache file");
            false
        }
    }
}
