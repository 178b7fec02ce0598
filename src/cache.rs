//! LRU cache for encoded image payloads.
//!
//! Preprocessing (decode, resize, re-encode, base64) is the expensive part of
//! preparing an image, and retries or repeated runs over the same folder hit
//! the same inputs. [`PreprocessCache`] memoizes the encoded payload keyed by
//! the file's identity and the encoding parameters, on top of a `moka` cache
//! with LRU eviction.

use crate::types::FileIdentity;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::sync::Arc;

/// Encoding parameters that affect the produced payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodeParams {
    pub max_dimensions: (u32, u32),
    pub max_bytes: u64,
    pub compression: bool,
}

/// Composite cache key: file identity plus encoding parameters.
///
/// Because modification time and size are part of the identity, an edited
/// file produces a different key and never sees a stale payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub identity: FileIdentity,
    pub params: EncodeParams,
}

/// Thread-safe LRU cache of encoded payloads.
///
/// Entries whose identity is incomplete (the file could not be stat'ed) are
/// never stored.
///
/// # Example
///
/// ```
/// use vision_batch::cache::{EncodeParams, PreprocessCache};
/// use vision_batch::types::FileIdentity;
/// use std::path::PathBuf;
/// use std::time::SystemTime;
///
/// let cache = PreprocessCache::new(2);
/// let id = FileIdentity {
///     path: PathBuf::from("a.png"),
///     modified: Some(SystemTime::UNIX_EPOCH),
///     size: Some(10),
/// };
/// let params = EncodeParams {
///     max_dimensions: (1024, 1024),
///     max_bytes: 1 << 20,
///     compression: true,
/// };
/// cache.put(&id, params, "data:image/png;base64,AAAA".into());
/// assert!(cache.get(&id, params).is_some());
/// ```
pub struct PreprocessCache {
    capacity: usize,
    entries: Cache<CacheKey, Arc<str>>,
}

impl PreprocessCache {
    /// Create a cache holding at most `capacity` payloads (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let entries = Cache::builder()
            .max_capacity(capacity as u64)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { capacity, entries }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a payload, promoting it to most recently used on a hit.
    pub fn get(&self, identity: &FileIdentity, params: EncodeParams) -> Option<Arc<str>> {
        if !identity.is_cacheable() {
            return None;
        }
        self.entries.get(&CacheKey {
            identity: identity.clone(),
            params,
        })
    }

    /// Store a payload, evicting the least recently used entry when full.
    pub fn put(&self, identity: &FileIdentity, params: EncodeParams, payload: Arc<str>) {
        if !identity.is_cacheable() {
            return;
        }
        let key = CacheKey {
            identity: identity.clone(),
            params,
        };
        self.entries.insert(key, payload);
        // Apply buffered reads before evicting so recency is exact.
        self.entries.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }
}

impl std::fmt::Debug for PreprocessCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreprocessCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl Default for PreprocessCache {
    fn default() -> Self {
        Self::new(100)
    }
}
