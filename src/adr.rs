//! ADR manager component
//!
//! Architectural decision records live as `{number}-{slug}.md` files with
//! YAML front-matter under `adr_dir`. Numbers are monotone and dense,
//! allocated behind a single mutex. Status changes follow the state machine
//! in [`AdrStatus::can_transition_to`]; superseding writes the successor
//! before the predecessor so a crash between the two leaves a detectable,
//! reconcilable half-state rather than a lie.

use crate::core::component::{Component, ComponentStatus};
use crate::core::error::{Error, Result};
use crate::core::types::{AdrRecord, AdrStatus, Pattern, PatternKind};
use crate::knowledge::KnowledgeBase;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Front-matter block at the top of every ADR file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrontMatter {
    id: String,
    number: u32,
    title: String,
    status: AdrStatus,
    date: DateTime<Utc>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    supersedes: Option<String>,
}

/// Inputs for creating an ADR
#[derive(Debug, Clone, Default)]
pub struct AdrDraft {
    pub title: String,
    pub context: String,
    pub decision: String,
    pub consequences: String,
    pub tags: Vec<String>,
    /// Id of the ADR this one supersedes; the predecessor is flipped to
    /// `superseded` after the successor file lands
    pub supersedes: Option<String>,
}

/// Filesystem-backed ADR store with a status state machine
pub struct AdrManager {
    dir: PathBuf,
    kb: Arc<KnowledgeBase>,
    records: DashMap<String, AdrRecord>,
    /// Serializes number allocation and file creation
    allocator: Mutex<()>,
}

impl AdrManager {
    pub fn new(dir: PathBuf, kb: Arc<KnowledgeBase>) -> Self {
        Self {
            dir,
            kb,
            records: DashMap::new(),
            allocator: Mutex::new(()),
        }
    }

    /// Create a new ADR in `proposed` state; returns the stored record
    pub async fn create(&self, draft: AdrDraft) -> Result<AdrRecord> {
        if draft.title.trim().is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        if draft.decision.trim().is_empty() {
            return Err(Error::validation("decision must not be empty"));
        }

        let predecessor = match &draft.supersedes {
            Some(prev_id) => {
                let prev = self
                    .records
                    .get(prev_id)
                    .map(|r| r.clone())
                    .ok_or_else(|| Error::not_found(format!("adr {prev_id}")))?;
                if !prev.status.can_transition_to(AdrStatus::Superseded) {
                    return Err(Error::AdrTransition {
                        from: prev.status.to_string(),
                        to: AdrStatus::Superseded.to_string(),
                    });
                }
                Some(prev)
            }
            None => None,
        };

        let _guard = self.allocator.lock().await;
        let number = self.records.len() as u32 + 1;
        let record = AdrRecord {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            slug: slugify(&draft.title),
            title: draft.title,
            status: AdrStatus::Proposed,
            context: draft.context,
            decision: draft.decision,
            consequences: draft.consequences,
            tags: draft.tags,
            supersedes: draft.supersedes.clone(),
            date: Utc::now(),
        };

        // Successor first; the predecessor flip below can crash-recover.
        self.write_file(&record)?;
        self.records.insert(record.id.clone(), record.clone());
        drop(_guard);

        if let Some(mut prev) = predecessor {
            prev.status = AdrStatus::Superseded;
            self.write_file(&prev)?;
            self.records.insert(prev.id.clone(), prev);
        }

        self.index_record(&record).await;
        Ok(record)
    }

    /// Apply a status transition; illegal moves leave the record untouched
    pub async fn transition(
        &self,
        id: &str,
        status: AdrStatus,
        superseded_by: Option<&str>,
    ) -> Result<AdrRecord> {
        let current = self
            .records
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::not_found(format!("adr {id}")))?;

        if !current.status.can_transition_to(status) {
            return Err(Error::AdrTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        if status == AdrStatus::Superseded {
            let successor_id =
                superseded_by.ok_or_else(|| Error::validation("superseded requires superseded_by"))?;
            let successor = self
                .records
                .get(successor_id)
                .map(|r| r.clone())
                .ok_or_else(|| Error::not_found(format!("adr {successor_id}")))?;
            if successor.supersedes.as_deref() != Some(id) {
                return Err(Error::validation(format!(
                    "adr {successor_id} does not cite {id} as superseded"
                )));
            }
        }

        let mut updated = current;
        updated.status = status;
        self.write_file(&updated)?;
        self.records.insert(updated.id.clone(), updated.clone());

        tracing::info!(id, status = %status, "adr transitioned");
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<AdrRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// All records ordered by number
    pub fn list(&self) -> Vec<AdrRecord> {
        let mut records: Vec<AdrRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.number);
        records
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    fn file_path(&self, record: &AdrRecord) -> PathBuf {
        self.dir
            .join(format!("{:03}-{}.md", record.number, record.slug))
    }

    fn write_file(&self, record: &AdrRecord) -> Result<()> {
        let front = FrontMatter {
            id: record.id.clone(),
            number: record.number,
            title: record.title.clone(),
            status: record.status,
            date: record.date,
            tags: record.tags.clone(),
            supersedes: record.supersedes.clone(),
        };
        let yaml = serde_yaml::to_string(&front)?;
        let content = format!(
            "---\n{yaml}---\n\n## Context\n\n{}\n\n## Decision\n\n{}\n\n## Consequences\n\n{}\n",
            record.context, record.decision, record.consequences
        );

        let path = self.file_path(record);
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn parse_file(content: &str) -> Result<AdrRecord> {
        let rest = content
            .strip_prefix("---\n")
            .ok_or_else(|| Error::validation("missing front-matter"))?;
        let (yaml, body) = rest
            .split_once("\n---\n")
            .ok_or_else(|| Error::validation("unterminated front-matter"))?;

        let front: FrontMatter = serde_yaml::from_str(yaml)?;
        let (context, decision, consequences) = split_sections(body);

        Ok(AdrRecord {
            id: front.id,
            number: front.number,
            slug: slugify(&front.title),
            title: front.title,
            status: front.status,
            context,
            decision,
            consequences,
            tags: front.tags,
            supersedes: front.supersedes,
            date: front.date,
        })
    }

    /// Push an ADR into the knowledge base; a degraded vector index only
    /// delays searchability, it never blocks the ADR itself
    async fn index_record(&self, record: &AdrRecord) {
        let mut pattern = Pattern::new(PatternKind::Adr, &record.title, adr_body(record));
        pattern.id = record.id.clone();
        pattern.tags = record.tags.clone();
        pattern
            .extra
            .insert("number".to_string(), serde_json::json!(record.number));
        pattern.extra.insert(
            "status".to_string(),
            serde_json::json!(record.status.as_str()),
        );

        if let Err(e) = self.kb.index(pattern).await {
            tracing::warn!(id = %record.id, "adr not indexed yet: {}", e);
        }
    }

    /// Detect a predecessor marked superseded whose supposed successor does
    /// not cite it (crash between the two writes)
    fn reconcile(&self) {
        let records: Vec<AdrRecord> = self.records.iter().map(|r| r.clone()).collect();
        for record in &records {
            if record.status != AdrStatus::Superseded {
                continue;
            }
            let cited = records
                .iter()
                .any(|r| r.supersedes.as_deref() == Some(record.id.as_str()));
            if !cited {
                tracing::warn!(
                    id = %record.id,
                    number = record.number,
                    "superseded adr has no successor citing it"
                );
            }
        }
    }
}

fn adr_body(record: &AdrRecord) -> String {
    format!(
        "## Context\n\n{}\n\n## Decision\n\n{}\n\n## Consequences\n\n{}",
        record.context, record.decision, record.consequences
    )
}

fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("untitled");
    }
    slug
}

fn split_sections(body: &str) -> (String, String, String) {
    let mut context = String::new();
    let mut decision = String::new();
    let mut consequences = String::new();
    let mut current: Option<&mut String> = None;

    for line in body.lines() {
        match line.trim() {
            "## Context" => current = Some(&mut context),
            "## Decision" => current = Some(&mut decision),
            "## Consequences" => current = Some(&mut consequences),
            _ => {
                if let Some(section) = current.as_deref_mut() {
                    if !section.is_empty() {
                        section.push('\n');
                    }
                    section.push_str(line);
                }
            }
        }
    }

    (
        context.trim().to_string(),
        decision.trim().to_string(),
        consequences.trim().to_string(),
    )
}

#[async_trait]
impl Component for AdrManager {
    fn name(&self) -> &'static str {
        "adr-manager"
    }

    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut loaded = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("md") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match Self::parse_file(&content) {
                Ok(record) => {
                    self.records.insert(record.id.clone(), record);
                    loaded += 1;
                }
                Err(e) => tracing::warn!("skipping unparseable adr {}: {}", path.display(), e),
            }
        }

        self.reconcile();

        // Re-index everything so a rebuilt knowledge base catches up.
        let records = self.list();
        for record in &records {
            if self.kb.get(&record.id)?.is_none() {
                self.index_record(record).await;
            }
        }

        tracing::info!(count = loaded, "adr directory scanned");
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        if self.dir.exists() {
            ComponentStatus::healthy()
        } else {
            ComponentStatus::unhealthy("adr directory missing")
        }
    }

    fn is_critical(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::embedder::Embedder;
    use crate::providers::{InMemoryVectorIndex, LocalEmbeddingProvider};
    use crate::vector::VectorStore;
    use tempfile::TempDir;

    const DIM: usize = 64;

    async fn manager(tmp: &TempDir) -> AdrManager {
        let embedder = Arc::new(Embedder::new(
            Arc::new(LocalEmbeddingProvider::new("test", DIM)),
            DIM,
        ));
        let vectors = Arc::new(VectorStore::new(
            Arc::new(InMemoryVectorIndex::new()),
            "adr_test".to_string(),
            DIM,
        ));
        vectors.initialize().await.unwrap();
        let cache = Arc::new(TieredCache::new(
            tmp.path().join("cache"),
            1024 * 1024,
            1024 * 1024,
            0,
        ));
        cache.initialize().await.unwrap();
        let kb = Arc::new(KnowledgeBase::new(
            embedder,
            vectors,
            cache,
            tmp.path().join("patterns"),
            "test".to_string(),
        ));
        kb.initialize().await.unwrap();

        let mgr = AdrManager::new(tmp.path().join("adrs"), kb);
        mgr.initialize().await.unwrap();
        mgr
    }

    fn draft(title: &str) -> AdrDraft {
        AdrDraft {
            title: title.to_string(),
            context: "We need a database".to_string(),
            decision: "Use PostgreSQL".to_string(),
            consequences: "Operational burden".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_numbers_dense_from_one() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;

        for i in 1..=5u32 {
            let record = mgr.create(draft(&format!("Decision {i}"))).await.unwrap();
            assert_eq!(record.number, i);
            assert_eq!(record.status, AdrStatus::Proposed);
        }
        let numbers: Vec<u32> = mgr.list().iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_file_roundtrip_across_restart() {
        let tmp = TempDir::new().unwrap();
        let created = {
            let mgr = manager(&tmp).await;
            mgr.create(draft("Use PostgreSQL for persistence")).await.unwrap()
        };

        let mgr = manager(&tmp).await;
        let loaded = mgr.get(&created.id).unwrap();
        assert_eq!(loaded.title, created.title);
        assert_eq!(loaded.number, 1);
        assert_eq!(loaded.context, "We need a database");
        assert_eq!(loaded.decision, "Use PostgreSQL");
        assert_eq!(loaded.consequences, "Operational burden");
        assert_eq!(loaded.slug, "use-postgresql-for-persistence");
    }

    #[tokio::test]
    async fn test_legal_transition_chain() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let record = mgr.create(draft("Adopt tracing")).await.unwrap();

        let accepted = mgr
            .transition(&record.id, AdrStatus::Accepted, None)
            .await
            .unwrap();
        assert_eq!(accepted.status, AdrStatus::Accepted);

        let implemented = mgr
            .transition(&record.id, AdrStatus::Implemented, None)
            .await
            .unwrap();
        assert_eq!(implemented.status, AdrStatus::Implemented);
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_record_unchanged() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let record = mgr.create(draft("Premature decision")).await.unwrap();

        let err = mgr
            .transition(&record.id, AdrStatus::Implemented, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "adr-illegal-transition");
        assert_eq!(mgr.get(&record.id).unwrap().status, AdrStatus::Proposed);
    }

    #[tokio::test]
    async fn test_supersede_via_create() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let old = mgr.create(draft("Use MySQL")).await.unwrap();
        mgr.transition(&old.id, AdrStatus::Accepted, None)
            .await
            .unwrap();

        let mut replacement = draft("Use PostgreSQL instead");
        replacement.supersedes = Some(old.id.clone());
        let new = mgr.create(replacement).await.unwrap();

        assert_eq!(new.supersedes.as_deref(), Some(old.id.as_str()));
        assert_eq!(mgr.get(&old.id).unwrap().status, AdrStatus::Superseded);
    }

    #[tokio::test]
    async fn test_superseded_patch_requires_citing_successor() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp).await;
        let a = mgr.create(draft("First")).await.unwrap();
        mgr.transition(&a.id, AdrStatus::Accepted, None).await.unwrap();
        let b = mgr.create(draft("Second")).await.unwrap();

        // b does not cite a, so the patch is rejected.
        let err = mgr
            .transition(&a.id, AdrStatus::Superseded, Some(&b.id))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation-failed");
        assert_eq!(mgr.get(&a.id).unwrap().status, AdrStatus::Accepted);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Use PostgreSQL!"), "use-postgresql");
        assert_eq!(slugify("  A  B  "), "a-b");
        assert_eq!(slugify("***"), "untitled");
    }
}
