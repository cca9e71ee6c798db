pub mod delegate;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod key;
pub mod ledger;
pub mod maintenance;
pub mod path;
pub mod store;

pub use delegate::{CacheDelegate, CacheHost};
pub use entry::{IntegrityBasis, IntegrityMode, read_entry, write_entry};
pub use error::{CacheError, CacheMiss};
pub use eviction::{EvictionPolicy, EvictionReport, LruEvictionPolicy, evict_to_target};
pub use key::{CacheKey, derive_key};
pub use ledger::{SizeLedger, scan_exact};
pub use maintenance::MaintenanceScheduler;
pub use store::{CacheState, CacheStats, CacheStore};
