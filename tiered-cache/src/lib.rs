//! Two-tier LRU byte store.
//!
//! Entries are keyed by a caller-supplied `u64` (typically a content
//! hash). The hot tier lives in memory under a byte budget; entries
//! evicted from memory spill to a flat directory on disk, one file per
//! key, also under a byte budget. Disk hits are promoted back into
//! memory. Files are written through a temp file and renamed into
//! place, so a crash leaves either a complete file or nothing.

use bytes::Bytes;
use lru::LruCache;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TieredCacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache directory error: {0}")]
    Directory(String),
}

pub type TieredCacheResult<T> = Result<T, TieredCacheError>;

/// Byte-budgeted memory/filesystem LRU keyed by `u64`.
pub struct TieredCache {
    inner: Mutex<Inner>,
    dir: PathBuf,
    memory_budget: u64,
    filesystem_budget: u64,
}

struct Inner {
    memory: LruCache<u64, Bytes>,
    memory_bytes: u64,
    // key -> file size; the file lives at `self.entry_path(key)`
    filesystem: LruCache<u64, u64>,
    filesystem_bytes: u64,
}

impl TieredCache {
    /// Opens the cache over `dir`, adopting any intact files already
    /// present. Partially written temp files from an earlier crash are
    /// removed.
    pub fn open(
        memory_budget: u64,
        filesystem_budget: u64,
        dir: impl Into<PathBuf>,
    ) -> TieredCacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let cache = Self {
            inner: Mutex::new(Inner {
                memory: LruCache::unbounded(),
                memory_bytes: 0,
                filesystem: LruCache::unbounded(),
                filesystem_bytes: 0,
            }),
            dir,
            memory_budget,
            filesystem_budget,
        };
        cache.scan_directory()?;
        Ok(cache)
    }

    /// Total bytes currently held across both tiers.
    pub fn size_bytes(&self) -> u64 {
        let inner = self.inner.lock().expect("tiered cache lock");
        inner.memory_bytes + inner.filesystem_bytes
    }

    /// Combined byte budget of both tiers.
    pub fn capacity_bytes(&self) -> u64 {
        self.memory_budget + self.filesystem_budget
    }

    /// Looks up `key`, probing memory first and then the filesystem.
    /// A filesystem hit is promoted into memory when it fits the
    /// memory budget; oversized entries are served from disk in place.
    pub fn find(&self, key: u64) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("tiered cache lock");

        if let Some(buffer) = inner.memory.get(&key) {
            return Some(buffer.clone());
        }

        if inner.filesystem.get(&key).is_none() {
            return None;
        }

        let path = self.entry_path(key);
        let buffer = match fs::read(&path) {
            Ok(data) => Bytes::from(data),
            Err(err) => {
                // The entry vanished under us; forget it and miss.
                let key_hex = format!("{key:016x}");
                warn!(key = %key_hex, error = %err, "cache file unreadable");
                if let Some(size) = inner.filesystem.pop(&key) {
                    inner.filesystem_bytes -= size;
                }
                return None;
            }
        };

        if (buffer.len() as u64) <= self.memory_budget {
            if let Some(size) = inner.filesystem.pop(&key) {
                inner.filesystem_bytes -= size;
            }
            let _ = fs::remove_file(&path);
            self.insert_memory(&mut inner, key, buffer.clone());
        }

        Some(buffer)
    }

    /// Inserts `buffer` under `key`. Re-inserting an existing key only
    /// refreshes its recency; the store is content-addressed so the
    /// bytes are assumed identical.
    pub fn insert(&self, key: u64, buffer: Bytes) {
        let mut inner = self.inner.lock().expect("tiered cache lock");

        if inner.memory.get(&key).is_some() || inner.filesystem.get(&key).is_some() {
            return;
        }

        if (buffer.len() as u64) > self.memory_budget {
            // Never fits in memory; write straight to the disk tier.
            self.spill_to_disk(&mut inner, key, &buffer);
            return;
        }

        self.insert_memory(&mut inner, key, buffer);
    }

    fn insert_memory(&self, inner: &mut Inner, key: u64, buffer: Bytes) {
        inner.memory_bytes += buffer.len() as u64;
        inner.memory.put(key, buffer);

        while inner.memory_bytes > self.memory_budget {
            let Some((evicted_key, evicted)) = inner.memory.pop_lru() else {
                break;
            };
            inner.memory_bytes -= evicted.len() as u64;
            self.spill_to_disk(inner, evicted_key, &evicted);
        }
    }

    fn spill_to_disk(&self, inner: &mut Inner, key: u64, buffer: &Bytes) {
        let size = buffer.len() as u64;
        let key_hex = format!("{key:016x}");
        if size > self.filesystem_budget {
            debug!(key = %key_hex, size, "entry exceeds filesystem budget, dropping");
            return;
        }

        if let Err(err) = self.write_entry(key, buffer) {
            warn!(key = %key_hex, error = %err, "cache spill failed");
            return;
        }

        inner.filesystem_bytes += size;
        inner.filesystem.put(key, size);

        while inner.filesystem_bytes > self.filesystem_budget {
            let Some((old_key, old_size)) = inner.filesystem.pop_lru() else {
                break;
            };
            inner.filesystem_bytes -= old_size;
            let _ = fs::remove_file(self.entry_path(old_key));
        }
    }

    // Temp file + rename keeps the directory free of torn entries.
    fn write_entry(&self, key: u64, buffer: &Bytes) -> std::io::Result<()> {
        let final_path = self.entry_path(key);
        let temp_path = self.dir.join(format!(".tmp-{key:016x}"));
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(buffer)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)
    }

    fn entry_path(&self, key: u64) -> PathBuf {
        self.dir.join(format!("{key:016x}"))
    }

    fn scan_directory(&self) -> TieredCacheResult<()> {
        let mut inner = self.inner.lock().expect("tiered cache lock");

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with(".tmp-") {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let Some(key) = parse_entry_name(&name) else {
                debug!(file = %name, "ignoring foreign file in cache directory");
                continue;
            };
            let size = entry.metadata()?.len();
            inner.filesystem_bytes += size;
            inner.filesystem.put(key, size);
        }

        while inner.filesystem_bytes > self.filesystem_budget {
            let Some((key, size)) = inner.filesystem.pop_lru() else {
                break;
            };
            inner.filesystem_bytes -= size;
            let _ = fs::remove_file(self.entry_path(key));
        }

        debug!(
            entries = inner.filesystem.len(),
            bytes = inner.filesystem_bytes,
            dir = %self.dir.display(),
            "adopted filesystem cache"
        );
        Ok(())
    }
}

fn parse_entry_name(name: &str) -> Option<u64> {
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn round_trip_from_memory() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::open(1024, 1024, dir.path()).unwrap();

        cache.insert(1, bytes_of(10, b'a'));
        assert_eq!(cache.find(1), Some(bytes_of(10, b'a')));
        assert_eq!(cache.find(2), None);
    }

    #[test]
    fn memory_eviction_spills_to_disk() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::open(100, 1024, dir.path()).unwrap();

        cache.insert(1, bytes_of(60, b'a'));
        cache.insert(2, bytes_of(60, b'b'));

        // Key 1 no longer fits in memory and must live on disk.
        assert!(dir.path().join(format!("{:016x}", 1u64)).exists());
        assert_eq!(cache.find(1), Some(bytes_of(60, b'a')));
    }

    #[test]
    fn disk_hit_promotes_back_to_memory() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::open(100, 1024, dir.path()).unwrap();

        cache.insert(1, bytes_of(60, b'a'));
        cache.insert(2, bytes_of(60, b'b'));
        assert!(dir.path().join(format!("{:016x}", 1u64)).exists());

        // Promotion pulls the entry off disk and spills key 2 instead.
        assert_eq!(cache.find(1), Some(bytes_of(60, b'a')));
        assert!(!dir.path().join(format!("{:016x}", 1u64)).exists());
        assert!(dir.path().join(format!("{:016x}", 2u64)).exists());
    }

    #[test]
    fn filesystem_eviction_removes_files() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::open(50, 100, dir.path()).unwrap();

        cache.insert(1, bytes_of(40, b'a'));
        cache.insert(2, bytes_of(40, b'b'));
        cache.insert(3, bytes_of(40, b'c'));
        cache.insert(4, bytes_of(40, b'd'));

        // Two entries fit on disk at most; the oldest file is gone.
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(files.len() <= 2);
        assert_eq!(cache.find(4), Some(bytes_of(40, b'd')));
    }

    #[test]
    fn oversized_entry_bypasses_memory() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::open(16, 1024, dir.path()).unwrap();

        cache.insert(7, bytes_of(64, b'x'));
        assert!(dir.path().join(format!("{:016x}", 7u64)).exists());
        // Served from disk, not promoted.
        assert_eq!(cache.find(7), Some(bytes_of(64, b'x')));
        assert!(dir.path().join(format!("{:016x}", 7u64)).exists());
    }

    #[test]
    fn reopen_adopts_existing_files() {
        let dir = tempdir().unwrap();
        {
            let cache = TieredCache::open(16, 1024, dir.path()).unwrap();
            cache.insert(9, bytes_of(64, b'z'));
        }

        let cache = TieredCache::open(1024, 1024, dir.path()).unwrap();
        assert_eq!(cache.find(9), Some(bytes_of(64, b'z')));
    }

    #[test]
    fn reopen_discards_temp_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".tmp-0000000000000001"), b"torn").unwrap();
        fs::write(dir.path().join("not-a-cache-entry"), b"keep").unwrap();

        let cache = TieredCache::open(1024, 1024, dir.path()).unwrap();
        assert!(!dir.path().join(".tmp-0000000000000001").exists());
        // Foreign files are left alone and never served.
        assert!(dir.path().join("not-a-cache-entry").exists());
        assert_eq!(cache.find(1), None);
    }

    #[test]
    fn reinsert_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::open(1024, 1024, dir.path()).unwrap();

        cache.insert(5, bytes_of(30, b'q'));
        cache.insert(5, bytes_of(30, b'q'));
        assert_eq!(cache.size_bytes(), 30);
    }

    #[test]
    fn size_tracks_both_tiers() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::open(50, 1024, dir.path()).unwrap();

        cache.insert(1, bytes_of(40, b'a'));
        cache.insert(2, bytes_of(40, b'b'));
        assert_eq!(cache.size_bytes(), 80);
        assert_eq!(cache.capacity_bytes(), 50 + 1024);
    }
}
