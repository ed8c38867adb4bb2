//! Pattern sidecar persistence
//!
//! One JSON file per pattern under `<kb_dir>/patterns/<id>.json`. Writes
//! take a per-id advisory file lock and go through a temp-file rename so
//! readers never observe a torn record; reads are lock-free and treat a
//! missing file as absence (the orphan-vector case).

use crate::core::error::{Error, Result};
use crate::core::types::Pattern;
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};

/// Filesystem store for pattern sidecar records
pub struct SidecarStore {
    dir: PathBuf,
}

impl SidecarStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        // Ids are uuids; reject anything that could escape the directory.
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::validation(format!("invalid pattern id '{id}'")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    /// Write a sidecar under the per-id advisory lock
    pub fn write(&self, pattern: &Pattern) -> Result<()> {
        let path = self.path_for(&pattern.id)?;
        let lock_file = fs::File::create(self.lock_path(&pattern.id))?;
        lock_file.lock_exclusive()?;

        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(pattern)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        fs2::FileExt::unlock(&lock_file)?;
        Ok(())
    }

    /// Lock-free read; `None` when the sidecar does not exist
    pub fn read(&self, id: &str) -> Result<Option<Pattern>> {
        let path = self.path_for(id)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a sidecar; `false` when it was already absent
    pub fn remove(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        let lock_file = fs::File::create(self.lock_path(id))?;
        lock_file.lock_exclusive()?;

        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                let _ = fs2::FileExt::unlock(&lock_file);
                return Err(e.into());
            }
        };

        fs2::FileExt::unlock(&lock_file)?;
        let _ = fs::remove_file(self.lock_path(id));
        Ok(removed)
    }

    /// All pattern ids with a sidecar on disk
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// Load every readable sidecar, skipping corrupt files with a warning
    pub fn load_all(&self) -> Result<Vec<Pattern>> {
        let mut patterns = Vec::new();
        for id in self.list_ids()? {
            match self.read(&id) {
                Ok(Some(pattern)) => patterns.push(pattern),
                Ok(None) => {}
                Err(e) => tracing::warn!("skipping corrupt sidecar {}: {}", id, e),
            }
        }
        Ok(patterns)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PatternKind;
    use tempfile::TempDir;

    fn pattern(id: &str) -> Pattern {
        let mut p = Pattern::new(PatternKind::Code, "Title", "Body");
        p.id = id.to_string();
        p
    }

    #[test]
    fn test_write_read_remove() {
        let tmp = TempDir::new().unwrap();
        let store = SidecarStore::new(tmp.path().to_path_buf());
        store.ensure_dir().unwrap();

        let p = pattern("11111111-2222-3333-4444-555555555555");
        store.write(&p).unwrap();
        assert_eq!(store.read(&p.id).unwrap().unwrap(), p);

        assert!(store.remove(&p.id).unwrap());
        assert!(store.read(&p.id).unwrap().is_none());
        assert!(!store.remove(&p.id).unwrap());
    }

    #[test]
    fn test_missing_read_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = SidecarStore::new(tmp.path().to_path_buf());
        store.ensure_dir().unwrap();
        assert!(store.read("deadbeef").unwrap().is_none());
    }

    #[test]
    fn test_path_traversal_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = SidecarStore::new(tmp.path().to_path_buf());
        assert!(store.read("../escape").is_err());
        assert!(store.read("").is_err());
    }

    #[test]
    fn test_list_ids() {
        let tmp = TempDir::new().unwrap();
        let store = SidecarStore::new(tmp.path().to_path_buf());
        store.ensure_dir().unwrap();

        store.write(&pattern("aaa")).unwrap();
        store.write(&pattern("bbb")).unwrap();
        let mut ids = store.list_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }
}
