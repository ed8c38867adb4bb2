//! Disk tier of the two-tier cache
//!
//! Content-addressed files under `<cache_dir>/<hh>/<hash>.bin`, where `hh`
//! is the first two hex characters of the key hash. Each file frames the
//! original key and expiry so prefix invalidation and lazy TTL reaping work
//! from the file alone. LRU accounting lives in an in-memory index rebuilt
//! by scanning the directory at startup.

use crate::core::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

struct DiskMeta {
    key: Vec<u8>,
    size: u64,
    expires_at: Option<u64>,
    last_access: u64,
}

struct DiskIndex {
    entries: HashMap<String, DiskMeta>,
    total_bytes: u64,
    access_tick: u64,
}

/// LRU-bounded on-disk cache tier
pub struct DiskTier {
    root: PathBuf,
    budget_bytes: u64,
    index: Mutex<DiskIndex>,
}

impl DiskTier {
    pub fn new(root: PathBuf, budget_bytes: u64) -> Self {
        Self {
            root,
            budget_bytes,
            index: Mutex::new(DiskIndex {
                entries: HashMap::new(),
                total_bytes: 0,
                access_tick: 0,
            }),
        }
    }

    /// Rebuild the index from the shard directories
    pub fn scan(&self) -> Result<usize> {
        fs::create_dir_all(&self.root)?;
        let mut index = self.index.lock().expect("disk index poisoned");
        index.entries.clear();
        index.total_bytes = 0;

        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("bin") {
                    continue;
                }
                let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match read_frame_header(&path) {
                    Ok((key, expires_at)) => {
                        let size = entry.metadata()?.len();
                        index.total_bytes += size;
                        index.entries.insert(
                            hash.to_string(),
                            DiskMeta {
                                key,
                                size,
                                expires_at,
                                last_access: 0,
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!("unreadable cache file {}, removing: {}", path.display(), e);
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        Ok(index.entries.len())
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(format!("{hash}.bin"))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        enum Lookup {
            Missing,
            Expired(u64),
            Present,
        }

        let hash = key_hash(key);
        {
            let mut index = self.index.lock().expect("disk index poisoned");
            let lookup = match index.entries.get(&hash) {
                None => Lookup::Missing,
                Some(meta) if is_expired(meta.expires_at) => Lookup::Expired(meta.size),
                Some(_) => Lookup::Present,
            };
            match lookup {
                Lookup::Missing => return Ok(None),
                Lookup::Expired(size) => {
                    // Tombstone on access; the file is reaped right here.
                    index.entries.remove(&hash);
                    index.total_bytes = index.total_bytes.saturating_sub(size);
                    drop(index);
                    let _ = fs::remove_file(self.path_for(&hash));
                    return Ok(None);
                }
                Lookup::Present => {
                    index.access_tick += 1;
                    let tick = index.access_tick;
                    if let Some(meta) = index.entries.get_mut(&hash) {
                        meta.last_access = tick;
                    }
                }
            }
        }

        let path = self.path_for(&hash);
        match read_frame(&path) {
            Ok((_, _, value)) => Ok(Some(value)),
            Err(e) => {
                // Index said present but the file is gone or torn; heal.
                let mut index = self.index.lock().expect("disk index poisoned");
                if let Some(meta) = index.entries.remove(&hash) {
                    index.total_bytes = index.total_bytes.saturating_sub(meta.size);
                }
                Err(e)
            }
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8], expires_at: Option<u64>) -> Result<()> {
        let hash = key_hash(key);
        let path = self.path_for(&hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            let key_len = key.len() as u32;
            file.write_all(&key_len.to_le_bytes())?;
            file.write_all(key)?;
            file.write_all(&expires_at.unwrap_or(0).to_le_bytes())?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let size = (4 + key.len() + 8 + value.len()) as u64;
        let evict: Vec<(String, PathBuf)> = {
            let mut index = self.index.lock().expect("disk index poisoned");
            if let Some(old) = index.entries.remove(&hash) {
                index.total_bytes = index.total_bytes.saturating_sub(old.size);
            }
            index.access_tick += 1;
            let tick = index.access_tick;
            index.entries.insert(
                hash,
                DiskMeta {
                    key: key.to_vec(),
                    size,
                    expires_at,
                    last_access: tick,
                },
            );
            index.total_bytes += size;
            self.collect_evictions(&mut index)
        };

        for (_, path) in evict {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    /// Pop least-recently-used entries until the tier fits its budget
    fn collect_evictions(&self, index: &mut DiskIndex) -> Vec<(String, PathBuf)> {
        let mut victims = Vec::new();
        while index.total_bytes > self.budget_bytes && !index.entries.is_empty() {
            let Some(oldest) = index
                .entries
                .iter()
                .min_by_key(|(_, meta)| meta.last_access)
                .map(|(hash, _)| hash.clone())
            else {
                break;
            };
            if let Some(meta) = index.entries.remove(&oldest) {
                index.total_bytes = index.total_bytes.saturating_sub(meta.size);
                victims.push((oldest.clone(), self.path_for(&oldest)));
            }
        }
        victims
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let hash = key_hash(key);
        let mut index = self.index.lock().expect("disk index poisoned");
        if let Some(meta) = index.entries.remove(&hash) {
            index.total_bytes = index.total_bytes.saturating_sub(meta.size);
            drop(index);
            let _ = fs::remove_file(self.path_for(&hash));
        }
        Ok(())
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn remove_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let victims: Vec<(String, u64)> = {
            let index = self.index.lock().expect("disk index poisoned");
            index
                .entries
                .iter()
                .filter(|(_, meta)| meta.key.starts_with(prefix))
                .map(|(hash, meta)| (hash.clone(), meta.size))
                .collect()
        };

        let count = victims.len();
        let mut index = self.index.lock().expect("disk index poisoned");
        for (hash, size) in victims {
            index.entries.remove(&hash);
            index.total_bytes = index.total_bytes.saturating_sub(size);
            let _ = fs::remove_file(self.path_for(&hash));
        }
        Ok(count)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.index.lock().expect("disk index poisoned").total_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.index.lock().expect("disk index poisoned").entries.len()
    }
}

fn key_hash(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn is_expired(expires_at: Option<u64>) -> bool {
    match expires_at {
        Some(deadline) => now_unix() >= deadline,
        None => false,
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_frame_header(path: &Path) -> Result<(Vec<u8>, Option<u64>)> {
    let mut file = fs::File::open(path)?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let key_len = u32::from_le_bytes(len_bytes) as usize;
    if key_len > 64 * 1024 {
        return Err(Error::internal("cache frame key length out of range"));
    }
    let mut key = vec![0u8; key_len];
    file.read_exact(&mut key)?;
    let mut exp_bytes = [0u8; 8];
    file.read_exact(&mut exp_bytes)?;
    let raw = u64::from_le_bytes(exp_bytes);
    Ok((key, (raw != 0).then_some(raw)))
}

fn read_frame(path: &Path) -> Result<(Vec<u8>, Option<u64>, Vec<u8>)> {
    let mut file = fs::File::open(path)?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let key_len = u32::from_le_bytes(len_bytes) as usize;
    if key_len > 64 * 1024 {
        return Err(Error::internal("cache frame key length out of range"));
    }
    let mut key = vec![0u8; key_len];
    file.read_exact(&mut key)?;
    let mut exp_bytes = [0u8; 8];
    file.read_exact(&mut exp_bytes)?;
    let raw = u64::from_le_bytes(exp_bytes);
    let mut value = Vec::new();
    file.read_to_end(&mut value)?;
    Ok((key, (raw != 0).then_some(raw), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let tier = DiskTier::new(tmp.path().to_path_buf(), 1024 * 1024);
        tier.scan().unwrap();

        tier.put(b"key1", b"value1", None).unwrap();
        assert_eq!(tier.get(b"key1").unwrap().unwrap(), b"value1");
        assert_eq!(tier.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_scan_rebuilds_index() {
        let tmp = TempDir::new().unwrap();
        {
            let tier = DiskTier::new(tmp.path().to_path_buf(), 1024 * 1024);
            tier.scan().unwrap();
            tier.put(b"persisted", b"survives restart", None).unwrap();
        }

        let tier = DiskTier::new(tmp.path().to_path_buf(), 1024 * 1024);
        let count = tier.scan().unwrap();
        assert_eq!(count, 1);
        assert_eq!(tier.get(b"persisted").unwrap().unwrap(), b"survives restart");
    }

    #[test]
    fn test_expired_entries_tombstoned_on_access() {
        let tmp = TempDir::new().unwrap();
        let tier = DiskTier::new(tmp.path().to_path_buf(), 1024 * 1024);
        tier.scan().unwrap();

        tier.put(b"stale", b"old", Some(now_unix() - 1)).unwrap();
        assert_eq!(tier.get(b"stale").unwrap(), None);
        assert_eq!(tier.entry_count(), 0);
    }

    #[test]
    fn test_budget_evicts_lru() {
        let tmp = TempDir::new().unwrap();
        // Each entry is 4 + 2 + 8 + 64 = 78 bytes; budget fits two.
        let tier = DiskTier::new(tmp.path().to_path_buf(), 160);
        tier.scan().unwrap();

        tier.put(b"k1", &[1u8; 64], None).unwrap();
        tier.put(b"k2", &[2u8; 64], None).unwrap();
        // Touch k1 so k2 is the LRU victim.
        tier.get(b"k1").unwrap();
        tier.put(b"k3", &[3u8; 64], None).unwrap();

        assert!(tier.get(b"k1").unwrap().is_some());
        assert!(tier.get(b"k2").unwrap().is_none());
        assert!(tier.get(b"k3").unwrap().is_some());
        assert!(tier.resident_bytes() <= 160);
    }

    #[test]
    fn test_remove_prefix() {
        let tmp = TempDir::new().unwrap();
        let tier = DiskTier::new(tmp.path().to_path_buf(), 1024 * 1024);
        tier.scan().unwrap();

        tier.put(b"kb:q:adr:1", b"a", None).unwrap();
        tier.put(b"kb:q:adr:2", b"b", None).unwrap();
        tier.put(b"kb:q:doc:1", b"c", None).unwrap();

        let removed = tier.remove_prefix(b"kb:q:adr:").unwrap();
        assert_eq!(removed, 2);
        assert!(tier.get(b"kb:q:adr:1").unwrap().is_none());
        assert!(tier.get(b"kb:q:doc:1").unwrap().is_some());
    }
}
