//! Two-tier cache component
//!
//! Memory tier: striped-mutex LRU bounded by resident bytes. Disk tier:
//! content-addressed files bounded by their own budget. Entries evicted from
//! memory spill to disk; disk hits are promoted back. The cache is never a
//! source of truth, so disk-tier failures are logged and counted but never
//! surface to callers.

mod disk;

use crate::config::CACHE_STRIPES;
use crate::core::component::{Component, ComponentStatus};
use crate::core::error::Result;
use async_trait::async_trait;
use disk::{now_unix, DiskTier};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters exposed through `/metrics` and `Stats()`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_bytes: u64,
    pub disk_resident_bytes: u64,
    pub disk_errors: u64,
}

struct MemEntry {
    value: Vec<u8>,
    expires_at: Option<u64>,
    size: u64,
    last_access: u64,
}

#[derive(Default)]
struct Stripe {
    map: HashMap<Vec<u8>, MemEntry>,
    resident: u64,
    tick: u64,
}

/// Two-tier key/value cache with TTL
pub struct TieredCache {
    stripes: Vec<Mutex<Stripe>>,
    stripe_budget: u64,
    default_ttl: u64,
    disk: DiskTier,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    disk_errors: AtomicU64,
}

impl TieredCache {
    pub fn new(cache_dir: PathBuf, mem_bytes: u64, disk_bytes: u64, default_ttl: u64) -> Self {
        let stripes = (0..CACHE_STRIPES).map(|_| Mutex::new(Stripe::default())).collect();
        Self {
            stripes,
            stripe_budget: (mem_bytes / CACHE_STRIPES as u64).max(1),
            default_ttl,
            disk: DiskTier::new(cache_dir, disk_bytes),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            disk_errors: AtomicU64::new(0),
        }
    }

    fn stripe_for(&self, key: &[u8]) -> &Mutex<Stripe> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn expiry(&self, ttl_seconds: Option<u64>) -> Option<u64> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        (ttl > 0).then(|| now_unix() + ttl)
    }

    /// Look up a key: memory first, then disk with promotion
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        enum MemLookup {
            Hit(Vec<u8>),
            Expired(u64),
            Miss,
        }

        {
            let mut stripe = self.stripe_for(key).lock().expect("cache stripe poisoned");
            let lookup = match stripe.map.get(key) {
                Some(entry) if entry.expires_at.map(|d| now_unix() >= d).unwrap_or(false) => {
                    MemLookup::Expired(entry.size)
                }
                Some(entry) => MemLookup::Hit(entry.value.clone()),
                None => MemLookup::Miss,
            };
            match lookup {
                MemLookup::Hit(value) => {
                    stripe.tick += 1;
                    let tick = stripe.tick;
                    if let Some(entry) = stripe.map.get_mut(key) {
                        entry.last_access = tick;
                    }
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                MemLookup::Expired(size) => {
                    // Expired: tombstone in place.
                    stripe.map.remove(key);
                    stripe.resident = stripe.resident.saturating_sub(size);
                }
                MemLookup::Miss => {}
            }
        }

        match self.disk.get(key) {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                // Promote without re-arming TTL beyond the disk copy's.
                self.set_memory(key, value.clone(), None);
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.disk_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("cache disk read failed: {}", e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value; oversized entries bypass memory and go straight to disk
    pub fn set(&self, key: &[u8], value: Vec<u8>, ttl_seconds: Option<u64>) {
        let expires_at = self.expiry(ttl_seconds);
        let size = (key.len() + value.len()) as u64;

        if size > self.stripe_budget {
            if let Err(e) = self.disk.put(key, &value, expires_at) {
                self.disk_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("cache disk write failed: {}", e);
            }
            return;
        }

        let spilled = self.insert_memory(key, value, expires_at, size);
        for (spilled_key, entry) in spilled {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.disk.put(&spilled_key, &entry.value, entry.expires_at) {
                self.disk_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("cache spill failed: {}", e);
            }
        }
    }

    fn set_memory(&self, key: &[u8], value: Vec<u8>, expires_at: Option<u64>) {
        let size = (key.len() + value.len()) as u64;
        if size > self.stripe_budget {
            return;
        }
        let spilled = self.insert_memory(key, value, expires_at, size);
        // Promotion-driven evictions already live on disk; just count them.
        self.evictions
            .fetch_add(spilled.len() as u64, Ordering::Relaxed);
    }

    fn insert_memory(
        &self,
        key: &[u8],
        value: Vec<u8>,
        expires_at: Option<u64>,
        size: u64,
    ) -> Vec<(Vec<u8>, MemEntry)> {
        let mut stripe = self.stripe_for(key).lock().expect("cache stripe poisoned");
        if let Some(old) = stripe.map.remove(key) {
            stripe.resident = stripe.resident.saturating_sub(old.size);
        }
        stripe.tick += 1;
        let tick = stripe.tick;
        stripe.map.insert(
            key.to_vec(),
            MemEntry {
                value,
                expires_at,
                size,
                last_access: tick,
            },
        );
        stripe.resident += size;

        let mut spilled = Vec::new();
        while stripe.resident > self.stripe_budget {
            let Some(victim) = stripe
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = stripe.map.remove(&victim) {
                stripe.resident = stripe.resident.saturating_sub(entry.size);
                spilled.push((victim, entry));
            }
        }
        spilled
    }

    /// Remove a key from both tiers
    pub fn invalidate(&self, key: &[u8]) {
        {
            let mut stripe = self.stripe_for(key).lock().expect("cache stripe poisoned");
            if let Some(entry) = stripe.map.remove(key) {
                stripe.resident = stripe.resident.saturating_sub(entry.size);
            }
        }
        if let Err(e) = self.disk.remove(key) {
            self.disk_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("cache disk remove failed: {}", e);
        }
    }

    /// Remove every key starting with `prefix` from both tiers
    pub fn invalidate_prefix(&self, prefix: &[u8]) {
        for stripe in &self.stripes {
            let mut stripe = stripe.lock().expect("cache stripe poisoned");
            let victims: Vec<Vec<u8>> = stripe
                .map
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            for key in victims {
                if let Some(entry) = stripe.map.remove(&key) {
                    stripe.resident = stripe.resident.saturating_sub(entry.size);
                }
            }
        }
        if let Err(e) = self.disk.remove_prefix(prefix) {
            self.disk_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("cache disk prefix remove failed: {}", e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let resident_bytes = self
            .stripes
            .iter()
            .map(|s| s.lock().expect("cache stripe poisoned").resident)
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident_bytes,
            disk_resident_bytes: self.disk.resident_bytes(),
            disk_errors: self.disk_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Component for TieredCache {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn initialize(&self) -> Result<()> {
        let entries = self.disk.scan()?;
        tracing::info!(disk_entries = entries, "cache ready");
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        ComponentStatus::healthy()
    }

    fn is_critical(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(mem: u64) -> (TempDir, TieredCache) {
        let tmp = TempDir::new().unwrap();
        let cache = TieredCache::new(tmp.path().to_path_buf(), mem, 1024 * 1024, 0);
        cache.disk.scan().unwrap();
        (tmp, cache)
    }

    #[test]
    fn test_set_get_invalidate() {
        let (_tmp, cache) = cache(1024 * 1024);
        cache.set(b"k", b"v".to_vec(), None);
        assert_eq!(cache.get(b"k").unwrap(), b"v");

        cache.invalidate(b"k");
        assert!(cache.get(b"k").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_eviction_spills_to_disk_and_promotes_back() {
        // Stripe budget = mem / stripes; make entries big enough that two
        // land in the same stripe only via spill.
        let (_tmp, cache) = cache(CACHE_STRIPES as u64 * 100);
        let big = vec![7u8; 90];
        cache.set(b"first", big.clone(), None);
        // Same stripe or not, pushing many entries forces spills somewhere.
        for i in 0..64u32 {
            cache.set(format!("filler-{i}").as_bytes(), vec![1u8; 90], None);
        }

        let stats = cache.stats();
        assert!(stats.evictions > 0);
        assert!(stats.resident_bytes <= CACHE_STRIPES as u64 * 100);

        // Spilled entries are still readable (from disk) and get promoted.
        assert_eq!(cache.get(b"first").unwrap(), big);
    }

    #[test]
    fn test_ttl_expiry() {
        let tmp = TempDir::new().unwrap();
        let cache = TieredCache::new(tmp.path().to_path_buf(), 1024 * 1024, 1024 * 1024, 3600);
        cache.disk.scan().unwrap();

        // An entry whose deadline is already in the past reads as absent.
        let size = (b"gone".len() + b"v".len()) as u64;
        let spilled = cache.insert_memory(b"gone", b"v".to_vec(), Some(now_unix() - 1), size);
        assert!(spilled.is_empty());
        assert!(cache.get(b"gone").is_none());
    }

    #[test]
    fn test_prefix_invalidation_spans_tiers() {
        let (_tmp, cache) = cache(1024 * 1024);
        cache.set(b"kb:q:adr:a", b"1".to_vec(), None);
        cache.set(b"kb:q:any:b", b"2".to_vec(), None);
        cache.set(b"kb:e:c", b"3".to_vec(), None);

        cache.invalidate_prefix(b"kb:q:adr:");
        assert!(cache.get(b"kb:q:adr:a").is_none());
        assert!(cache.get(b"kb:q:any:b").is_some());
        assert!(cache.get(b"kb:e:c").is_some());
    }

    #[test]
    fn test_oversized_entry_goes_to_disk() {
        let (_tmp, cache) = cache(CACHE_STRIPES as u64 * 8);
        let huge = vec![0u8; 4096];
        cache.set(b"huge", huge.clone(), None);
        // Memory cannot hold it, disk serves it.
        assert_eq!(cache.get(b"huge").unwrap(), huge);
        assert_eq!(cache.stats().resident_bytes, 0);
    }
}
