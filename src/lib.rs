//! Disk-backed cache for compiled code.
//!
//! Entries are content-verified blobs sharded by the SHA-1 of their source
//! identifier, kept under a size budget by mtime-based LRU eviction that runs
//! on a background maintenance thread.

pub mod cache;
pub mod cli;
pub mod config;
pub mod session;
pub mod utils;

pub use cache::{CacheDelegate, CacheHost, CacheState, CacheStats, CacheStore};
pub use codecache_eligibility as eligibility;
pub use config::CacheConfig;
pub use session::CacheSession;
