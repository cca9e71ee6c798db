use std::sync::Arc;

use parking_lot::RwLock;

use super::store::CacheStore;

/// Storage capability a host installs for an engine.
///
/// `None` from [`load_bytecode`](Self::load_bytecode) is a miss; an empty
/// vector is a legitimate zero-length payload.
pub trait CacheDelegate: Send + Sync {
    fn load_bytecode(&self, source_id: &str, version_token: &str) -> Option<Vec<u8>>;

    fn store_bytecode(&self, source_id: &str, version_token: &str, payload: &[u8]);

    /// Hint that now is a good time to run background upkeep.
    fn perform_maintenance(&self) {}
}

impl CacheDelegate for CacheStore {
    fn load_bytecode(&self, source_id: &str, version_token: &str) -> Option<Vec<u8>> {
        self.load(source_id, version_token)
    }

    fn store_bytecode(&self, source_id: &str, version_token: &str, payload: &[u8]) {
        self.store(source_id, version_token, payload);
    }

    fn perform_maintenance(&self) {
        self.maintain();
    }
}

/// Holds the optional delegate. With nothing installed, caching is disabled:
/// loads miss and stores are dropped.
#[derive(Default)]
pub struct CacheHost {
    delegate: RwLock<Option<Arc<dyn CacheDelegate>>>,
}

impl CacheHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delegate(delegate: Arc<dyn CacheDelegate>) -> Self {
        Self {
            delegate: RwLock::new(Some(delegate)),
        }
    }

    /// Installs `delegate`, returning the one it replaced.
    pub fn install(&self, delegate: Arc<dyn CacheDelegate>) -> Option<Arc<dyn CacheDelegate>> {
        self.delegate.write().replace(delegate)
    }

    pub fn clear(&self) -> Option<Arc<dyn CacheDelegate>> {
        self.delegate.write().take()
    }

    pub fn delegate(&self) -> Option<Arc<dyn CacheDelegate>> {
        self.delegate.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.delegate.read().is_some()
    }

    pub fn load(&self, source_id: &str, version_token: &str) -> Option<Vec<u8>> {
        self.delegate()?.load_bytecode(source_id, version_token)
    }

    pub fn store(&self, source_id: &str, version_token: &str, payload: &[u8]) {
        if let Some(delegate) = self.delegate() {
            delegate.store_bytecode(source_id, version_token, payload);
        }
    }

    pub fn perform_maintenance(&self) {
        if let Some(delegate) = self.delegate() {
            delegate.perform_maintenance();
        }
    }
}

impl std::fmt::Debug for CacheHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHost")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryDelegate {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        maintenance_calls: Mutex<usize>,
    }

    impl CacheDelegate for MemoryDelegate {
        fn load_bytecode(&self, source_id: &str, version_token: &str) -> Option<Vec<u8>> {
            self.entries
                .lock()
                .get(&format!("{source_id}@{version_token}"))
                .cloned()
        }

        fn store_bytecode(&self, source_id: &str, version_token: &str, payload: &[u8]) {
            self.entries
                .lock()
                .insert(format!("{source_id}@{version_token}"), payload.to_vec());
        }

        fn perform_maintenance(&self) {
            *self.maintenance_calls.lock() += 1;
        }
    }

    #[test]
    fn absent_delegate_disables_caching() {
        let host = CacheHost::new();
        assert!(!host.is_enabled());
        host.store("a", "v", b"bytes");
        host.perform_maintenance();
        assert_eq!(host.load("a", "v"), None);
    }

    #[test]
    fn installed_delegate_receives_calls() {
        let delegate = Arc::new(MemoryDelegate::default());
        let host = CacheHost::with_delegate(delegate.clone());

        host.store("a", "v", b"bytes");
        assert_eq!(host.load("a", "v").as_deref(), Some(&b"bytes"[..]));
        assert_eq!(host.load("a", "other"), None);

        host.perform_maintenance();
        assert_eq!(*delegate.maintenance_calls.lock(), 1);
    }

    #[test]
    fn empty_payload_is_a_hit() {
        let host = CacheHost::with_delegate(Arc::new(MemoryDelegate::default()));
        host.store("empty", "v", b"");
        assert_eq!(host.load("empty", "v"), Some(Vec::new()));
    }

    #[test]
    fn clear_detaches_delegate() {
        let host = CacheHost::new();
        assert!(host.install(Arc::new(MemoryDelegate::default())).is_none());
        host.store("a", "v", b"x");

        assert!(host.clear().is_some());
        assert_eq!(host.load("a", "v"), None);
    }
}
