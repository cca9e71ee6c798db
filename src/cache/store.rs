use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry::{IntegrityBasis, entry_size, read_entry, remove_file_best_effort, write_entry};
use super::error::{CacheError, CacheMiss};
use super::eviction::{
    EvictionPolicy, LruEvictionPolicy, enumerate_entries, evict_with_policy,
    sweep_stale_temp_files,
};
use super::key::CacheKey;
use super::ledger::{SizeLedger, scan_exact};
use super::maintenance::MaintenanceScheduler;
use super::path::{cache_root, ensure_structure};
use crate::config::CacheConfig;

/// Lifecycle of a [`CacheStore`]. Initialization happens on first use and the
/// outcome is fixed for the lifetime of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Uninitialized,
    Disabled,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub state: CacheState,
    pub root: Option<PathBuf>,
    pub approximate_bytes: u64,
    pub max_bytes: u64,
    pub maintenance_runs: u64,
    pub maintenance_pending: bool,
}

/// State shared with maintenance passes running on the background worker.
struct DiskShared {
    root: PathBuf,
    ledger: SizeLedger,
    config: CacheConfig,
    policy: Arc<dyn EvictionPolicy>,
}

impl DiskShared {
    fn run_maintenance(&self) {
        let started = Instant::now();
        let swept = sweep_stale_temp_files(
            &self.root,
            Duration::from_secs(self.config.stale_temp_secs),
        );
        let report = evict_with_policy(
            &self.root,
            self.config.max_bytes,
            self.config.target_fraction,
            self.policy.as_ref(),
        );
        let exact = scan_exact(&self.root);
        self.ledger.reset(exact);

        info!(
            exact_bytes = exact,
            removed = report.removed_entries,
            freed = report.freed_bytes,
            stale_temp_files = swept,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache maintenance complete"
        );
    }
}

struct Ready {
    shared: Arc<DiskShared>,
    scheduler: MaintenanceScheduler,
}

impl Ready {
    fn schedule_pass(&self) -> bool {
        self.scheduler.schedule(maintenance_pass(Arc::clone(&self.shared)))
    }
}

fn maintenance_pass(shared: Arc<DiskShared>) -> impl FnOnce() + Send + 'static {
    move || shared.run_maintenance()
}

/// Disk-backed compiled-code cache.
///
/// Entries live at `<root>/<shard>/<rest-of-key>.cache`. Every operation is
/// fail-soft: when the cache is disabled or an I/O step fails, loads miss and
/// stores do nothing.
pub struct CacheStore {
    config: CacheConfig,
    policy: Arc<dyn EvictionPolicy>,
    state: OnceCell<Option<Ready>>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            policy: Arc::new(LruEvictionPolicy),
            state: OnceCell::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(CacheConfig::from_env())
    }

    /// Replaces the eviction ordering. Only effective before first use.
    pub fn with_eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn state(&self) -> CacheState {
        match self.state.get() {
            None => CacheState::Uninitialized,
            Some(None) => CacheState::Disabled,
            Some(Some(_)) => CacheState::Ready,
        }
    }

    /// Resolves and creates the cache root if that has not happened yet.
    pub fn initialize(&self) -> CacheState {
        self.ready();
        self.state()
    }

    pub fn root(&self) -> Option<&Path> {
        self.ready().map(|ready| ready.shared.root.as_path())
    }

    fn ready(&self) -> Option<&Ready> {
        self.state.get_or_init(|| self.open()).as_ref()
    }

    fn open(&self) -> Option<Ready> {
        if !self.config.enabled {
            info!("code cache disabled by configuration");
            return None;
        }
        if let Err(err) = self.config.validate() {
            warn!(error = %err, "code cache disabled");
            return None;
        }
        let Some(root) = cache_root(&self.config) else {
            warn!("code cache disabled: could not determine cache directory");
            return None;
        };
        if let Err(err) = ensure_structure(&root) {
            warn!(error = %err, "code cache disabled: could not create cache directory");
            return None;
        }

        info!(
            root = %root.display(),
            max_mb = self.config.max_bytes / (1024 * 1024),
            "code cache enabled"
        );

        let ready = Ready {
            shared: Arc::new(DiskShared {
                root,
                ledger: SizeLedger::default(),
                config: self.config.clone(),
                policy: Arc::clone(&self.policy),
            }),
            scheduler: MaintenanceScheduler::new(),
        };
        // The ledger starts empty; reconcile it with whatever earlier runs left.
        ready.schedule_pass();
        Some(ready)
    }

    fn basis<'a>(&self, version_token: &'a str) -> IntegrityBasis<'a> {
        IntegrityBasis::new(self.config.integrity, version_token.as_bytes())
    }

    /// Returns the cached payload for `source_id` if one exists and verifies
    /// against `version_token`.
    pub fn load(&self, source_id: &str, version_token: &str) -> Option<Vec<u8>> {
        let ready = self.ready()?;
        let path = CacheKey::derive(source_id).entry_path(&ready.shared.root);

        match read_entry(&path, &self.basis(version_token)) {
            Ok(payload) => {
                debug!(source_id, bytes = payload.len(), "cache hit");
                Some(payload)
            }
            Err(CacheMiss::NotFound) => {
                debug!(source_id, "cache miss");
                None
            }
            Err(miss) if miss.is_corruption() => {
                warn!(source_id, path = %path.display(), reason = %miss, "invalid cache entry");
                None
            }
            Err(miss) => {
                debug!(source_id, reason = %miss, "cache miss");
                None
            }
        }
    }

    /// Stores `payload` for `source_id`. Failures are logged and swallowed.
    pub fn store(&self, source_id: &str, version_token: &str, payload: &[u8]) {
        match self.try_store(source_id, version_token, payload) {
            Ok(()) | Err(CacheError::Disabled) => {}
            Err(err) => warn!(source_id, error = %err, "failed to store cache entry"),
        }
    }

    pub fn try_store(
        &self,
        source_id: &str,
        version_token: &str,
        payload: &[u8],
    ) -> Result<(), CacheError> {
        let ready = self.ready().ok_or(CacheError::Disabled)?;
        let key = CacheKey::derive(source_id);

        let shard_dir = key.shard_dir(&ready.shared.root);
        if !shard_dir.is_dir() {
            fs::create_dir_all(&shard_dir).map_err(|err| CacheError::io(&shard_dir, err))?;
        }

        write_entry(
            &key.entry_path(&ready.shared.root),
            payload,
            &self.basis(version_token),
        )?;

        let approximate = ready.shared.ledger.add(entry_size(payload.len()));
        debug!(source_id, bytes = payload.len(), approximate, "cache store");

        ready.scheduler.maybe_schedule(
            approximate,
            self.config.max_bytes,
            self.config.high_water_fraction,
            maintenance_pass(Arc::clone(&ready.shared)),
        );
        Ok(())
    }

    /// Queues a maintenance pass regardless of the ledger. Returns false when
    /// the cache is disabled or a pass is already queued.
    pub fn maintain(&self) -> bool {
        self.ready()
            .is_some_and(Ready::schedule_pass)
    }

    /// Waits for queued and running maintenance to finish.
    pub fn wait_for_maintenance(&self, timeout: Duration) -> bool {
        match self.state.get() {
            Some(Some(ready)) => ready.scheduler.wait_idle(timeout),
            _ => true,
        }
    }

    pub fn approximate_bytes(&self) -> u64 {
        match self.state.get() {
            Some(Some(ready)) => ready.shared.ledger.snapshot(),
            _ => 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let ready = match self.state.get() {
            Some(Some(ready)) => Some(ready),
            _ => None,
        };
        CacheStats {
            state: self.state(),
            root: ready.map(|ready| ready.shared.root.clone()),
            approximate_bytes: ready.map_or(0, |ready| ready.shared.ledger.snapshot()),
            max_bytes: self.config.max_bytes,
            maintenance_runs: ready.map_or(0, |ready| ready.scheduler.completed_runs()),
            maintenance_pending: ready.is_some_and(|ready| ready.scheduler.is_pending()),
        }
    }

    /// Deletes every entry and returns how many were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let ready = self.ready().ok_or(CacheError::Disabled)?;
        let removed = enumerate_entries(&ready.shared.root)
            .iter()
            .filter(|entry| remove_file_best_effort(&entry.path, "clear"))
            .count();
        ready.shared.ledger.reset(scan_exact(&ready.shared.root));
        info!(removed, "cache cleared");
        Ok(removed)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
