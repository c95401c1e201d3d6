//! ETag-keyed response cache.
//!
//! One instance per content-encoding pool. The metadata side-table
//! maps an ETag to the headers worth replaying plus a hash into the
//! content-addressed buffer store, so identical bodies under different
//! ETags share one stored copy.

use crate::config::CacheSection;
use crate::error::GatewayResult;
use crate::proxy::wire::ContentEncoding;
use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tiered_cache::TieredCache;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

/// Approximate per-entry footprint used to size the metadata table
/// from the byte budgets.
const METADATA_ENTRY_BYTES: u64 = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponseMetadata {
    pub etag: String,
    pub mime_type: String,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
    pub vary: Option<String>,
    pub access_control_allow_origin: Option<String>,
    pub content_encoding: ContentEncoding,
    pub buffer_hash: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub maxsize: u64,
    pub size: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
}

pub struct ResponseCache {
    name: &'static str,
    metadata: Mutex<LruCache<String, CachedResponseMetadata>>,
    buffers: TieredCache,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl ResponseCache {
    pub fn open(name: &'static str, section: &CacheSection) -> GatewayResult<Self> {
        let memory = section.memory_bytes.bytes();
        let filesystem = section.filesystem_bytes.bytes();
        let directory = section
            .directory
            .clone()
            .unwrap_or_else(|| default_directory(name));

        let entries = ((memory + filesystem) / METADATA_ENTRY_BYTES).max(1) as usize;
        let capacity = NonZeroUsize::new(entries).expect("at least one metadata entry");

        info!(
            pool = name,
            memory_bytes = memory,
            filesystem_bytes = filesystem,
            directory = %directory.display(),
            metadata_entries = entries,
            "response cache pool ready"
        );

        Ok(Self {
            name,
            metadata: Mutex::new(LruCache::new(capacity)),
            buffers: TieredCache::open(memory, filesystem, directory)?,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        })
    }

    /// Looks up a cached response. A metadata hit whose buffer has
    /// already been evicted counts as a miss; the stale metadata ages
    /// out of the LRU on its own.
    pub fn find(&self, etag: &str) -> Option<(Bytes, CachedResponseMetadata)> {
        let metadata = {
            let mut table = self.metadata.lock().expect("metadata lock");
            table.get(etag).cloned()
        };

        let Some(metadata) = metadata else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match self.buffers.find(metadata.buffer_hash) {
            Some(buffer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(pool = self.name, etag, "cache hit");
                Some((buffer, metadata))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(pool = self.name, etag, "metadata present but buffer evicted");
                None
            }
        }
    }

    /// Inserts a response body under its ETag, replacing any previous
    /// metadata for the same tag.
    pub fn insert(&self, mut metadata: CachedResponseMetadata, body: Bytes) {
        let hash = xxh3_64(&body);
        metadata.buffer_hash = hash;

        let hash_hex = format!("{hash:016x}");
        debug!(
            pool = self.name,
            etag = %metadata.etag,
            bytes = body.len(),
            hash = %hash_hex,
            "caching response"
        );

        {
            let mut table = self.metadata.lock().expect("metadata lock");
            table.put(metadata.etag.clone(), metadata);
        }
        self.buffers.insert(hash, body);
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            maxsize: self.buffers.capacity_bytes(),
            size: self.buffers.size_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }
}

fn default_directory(name: &str) -> PathBuf {
    std::env::temp_dir().join("cluster-gateway-cache").join(name)
}
