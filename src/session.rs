//! Producer side of the cache: accumulates patches to a compiled-code blob and
//! writes the result back through the host's delegate.

use codecache_eligibility::{CacheEligibilityIndex, SpecializationKind};
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheHost};

/// Largest blob a session will assemble. Updates reaching past it are refused.
pub const MAX_BLOB_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingUpdate {
    offset: usize,
    /// `offset + bytes.len()`, checked against [`MAX_BLOB_LEN`] on insert.
    end: usize,
    bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct CacheSession<'h> {
    host: &'h CacheHost,
    source_id: String,
    version_token: String,
    base: Vec<u8>,
    cache_hit: bool,
    updates: Vec<PendingUpdate>,
    eligibility: CacheEligibilityIndex,
}

impl<'h> CacheSession<'h> {
    /// Opens a session for `source_id`, seeding it with whatever the host's
    /// delegate currently holds. A miss or a missing delegate gives an empty
    /// base.
    pub fn open(host: &'h CacheHost, source_id: &str, version_token: &str) -> Self {
        let loaded = host.load(source_id, version_token);
        debug!(source_id, hit = loaded.is_some(), "opened cache session");
        Self {
            host,
            source_id: source_id.to_string(),
            version_token: version_token.to_string(),
            cache_hit: loaded.is_some(),
            base: loaded.unwrap_or_default(),
            updates: Vec::new(),
            eligibility: CacheEligibilityIndex::new(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn base(&self) -> &[u8] {
        &self.base
    }

    pub fn was_cached(&self) -> bool {
        self.cache_hit
    }

    /// Replaces the eligibility index with one decoded from `bytes`. Malformed
    /// input yields an empty index.
    pub fn load_eligibility(&mut self, bytes: &[u8]) {
        self.eligibility = CacheEligibilityIndex::decode_or_empty(bytes);
    }

    pub fn eligibility(&self) -> &CacheEligibilityIndex {
        &self.eligibility
    }

    pub fn record_function(&mut self, offset: i32, kind: SpecializationKind) {
        self.eligibility.record_eligible(offset, kind);
    }

    pub fn should_cache(&self, offset: i32, kind: SpecializationKind) -> bool {
        self.eligibility.is_eligible(offset, kind)
    }

    /// Queues `bytes` to be written at `offset` of the blob on commit. An
    /// update ending past [`MAX_BLOB_LEN`] is refused and nothing is queued.
    pub fn add_update(
        &mut self,
        offset: usize,
        bytes: impl Into<Vec<u8>>,
    ) -> Result<(), CacheError> {
        let bytes = bytes.into();
        let Some(end) = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= MAX_BLOB_LEN)
        else {
            warn!(
                source_id = %self.source_id,
                offset,
                len = bytes.len(),
                "refusing out-of-range cache update"
            );
            return Err(CacheError::UpdateOutOfRange {
                offset,
                len: bytes.len(),
                limit: MAX_BLOB_LEN,
            });
        };
        self.updates.push(PendingUpdate { offset, end, bytes });
        Ok(())
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    /// Applies the queued updates to a copy of the base. Later updates win
    /// where they overlap; gaps left by growing the buffer are zero-filled.
    pub fn assemble(&self) -> Vec<u8> {
        let mut blob = self.base.clone();
        for update in &self.updates {
            if blob.len() < update.end {
                blob.resize(update.end, 0);
            }
            blob[update.offset..update.end].copy_from_slice(&update.bytes);
        }
        blob
    }

    /// Stores the assembled blob through the delegate. Returns whether anything
    /// was handed to it.
    pub fn commit(self) -> bool {
        if !self.has_updates() {
            return false;
        }
        let Some(delegate) = self.host.delegate() else {
            debug!(source_id = %self.source_id, "no cache delegate; dropping updates");
            return false;
        };

        let blob = self.assemble();
        debug!(
            source_id = %self.source_id,
            updates = self.updates.len(),
            bytes = blob.len(),
            "committing cache session"
        );
        delegate.store_bytecode(&self.source_id, &self.version_token, &blob);
        true
    }
}
