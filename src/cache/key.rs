use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

/// Number of shard directories under the cache root, one per leading hex byte.
pub const SHARD_COUNT: usize = 256;

/// Extension of committed cache entries.
pub const ENTRY_EXTENSION: &str = "cache";

/// Stable cache key: the lowercase hex SHA1 of a source identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<String>);

impl CacheKey {
    pub fn derive(source_id: &str) -> Self {
        let digest = Sha1::digest(source_id.as_bytes());
        Self(Arc::new(format!("{digest:x}")))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// First two hex characters; names one of [`SHARD_COUNT`] directories.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Remaining 38 hex characters plus the entry extension.
    pub fn file_name(&self) -> String {
        format!("{}.{ENTRY_EXTENSION}", &self.0[2..])
    }

    pub fn shard_dir(&self, root: &Path) -> PathBuf {
        root.join(self.shard())
    }

    pub fn entry_path(&self, root: &Path) -> PathBuf {
        self.shard_dir(root).join(self.file_name())
    }
}

/// Splits the key for `source_id` into its shard directory and file name.
pub fn derive_key(source_id: &str) -> (String, String) {
    let key = CacheKey::derive(source_id);
    (key.shard().to_string(), key.file_name())
}

/// Names of every shard directory, `00` through `ff`.
pub fn shard_names() -> impl Iterator<Item = String> {
    (0..SHARD_COUNT).map(|index| format!("{index:02x}"))
}

/// True for file names that look like committed entries (not temp files).
pub fn is_entry_file_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext == ENTRY_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_matches_known_sha1() {
        let key = CacheKey::derive("abc");
        assert_eq!(key.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(key.shard(), "a9");
        assert_eq!(key.file_name(), "993e364706816aba3e25717850c26c9cd0d89d.cache");
    }

    #[test]
    fn empty_identifier_has_the_well_known_digest() {
        let (shard, file) = derive_key("");
        assert_eq!(shard, "da");
        assert_eq!(file, "39a3ee5e6b4b0d3255bfef95601890afd80709.cache");
    }

    #[test]
    fn entry_path_is_sharded_under_root() {
        let key = CacheKey::derive("https://example.com/app.js");
        let path = key.entry_path(Path::new("/tmp/root"));
        assert_eq!(
            path,
            Path::new("/tmp/root")
                .join(key.shard())
                .join(key.file_name())
        );
    }

    #[test]
    fn shard_names_cover_every_leading_byte() {
        let names: Vec<_> = shard_names().collect();
        assert_eq!(names.len(), SHARD_COUNT);
        assert_eq!(names.first().map(String::as_str), Some("00"));
        assert_eq!(names.last().map(String::as_str), Some("ff"));
    }

    #[test]
    fn temp_files_are_not_entries() {
        assert!(is_entry_file_name("abc.cache"));
        assert!(!is_entry_file_name("abc.cache.x1y2.tmp"));
        assert!(!is_entry_file_name("abc"));
    }

    proptest! {
        #[test]
        fn derivation_is_deterministic(source in ".*") {
            let first = derive_key(&source);
            let second = derive_key(&source);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.0.len(), 2);
            prop_assert_eq!(first.1.len(), 38 + 1 + ENTRY_EXTENSION.len());
            prop_assert!(first.0.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}
