use std::path::{Path, PathBuf};

use directories::BaseDirs;
use tracing::debug;

use super::error::CacheError;
use crate::config::CacheConfig;

const DEFAULT_SUBPATH: [&str; 2] = ["codecache", "bytecode"];

/// Resolves the cache root: the configured override if it is non-empty,
/// otherwise the platform cache directory plus a fixed subpath. `None` means
/// no usable location exists and the cache must stay disabled.
pub fn cache_root(config: &CacheConfig) -> Option<PathBuf> {
    if let Some(custom) = config.root.as_deref() {
        if !custom.as_os_str().is_empty() {
            return Some(custom.to_path_buf());
        }
    }

    let Some(base_dirs) = BaseDirs::new() else {
        debug!("failed to determine user directories");
        return None;
    };
    let mut root = base_dirs.cache_dir().to_path_buf();
    root.extend(DEFAULT_SUBPATH);
    Some(root)
}

pub fn ensure_structure(root: &Path) -> Result<(), CacheError> {
    std::fs::create_dir_all(root).map_err(|err| CacheError::io(root, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_platform_default() {
        let config = CacheConfig {
            root: Some(PathBuf::from("/var/cache/custom")),
            ..CacheConfig::default()
        };
        assert_eq!(cache_root(&config), Some(PathBuf::from("/var/cache/custom")));
    }

    #[test]
    fn empty_override_falls_back_to_platform_default() {
        let config = CacheConfig {
            root: Some(PathBuf::new()),
            ..CacheConfig::default()
        };
        if let Some(root) = cache_root(&config) {
            assert!(root.ends_with("codecache/bytecode"));
        }
    }

    #[test]
    fn ensure_structure_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("a").join("b").join("c");
        ensure_structure(&root).unwrap();
        assert!(root.is_dir());
    }
}
