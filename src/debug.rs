//! Debug analyzer component
//!
//! Turns an issue description into a structured sequence of diagnostic
//! steps, grounding each step in prior art retrieved from the knowledge
//! base (debug notes and ADRs). Stateless across calls; writes nothing.

use crate::core::component::{Component, ComponentStatus};
use crate::core::error::{Error, Result};
use crate::core::types::{
    DiagnosticPhase, DiagnosticStep, PatternKind, SearchFilter, SearchHit,
};
use crate::knowledge::KnowledgeBase;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How many prior-art patterns to retrieve per analysis
const PRIOR_ART_LIMIT: usize = 5;

/// Result of a debug analysis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebugAnalysis {
    pub steps: Vec<DiagnosticStep>,
    pub related: Vec<SearchHit>,
}

/// Issue-to-diagnostic-steps analyzer
pub struct DebugAnalyzer {
    kb: Arc<KnowledgeBase>,
}

impl DebugAnalyzer {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        Self { kb }
    }

    /// Analyze an issue description with optional extra context
    pub async fn analyze(&self, description: &str, context: Option<&str>) -> Result<DebugAnalysis> {
        if description.trim().is_empty() {
            return Err(Error::validation("description must not be empty"));
        }

        let query = match context {
            Some(ctx) if !ctx.trim().is_empty() => format!("{description}\n{ctx}"),
            _ => description.to_string(),
        };

        let filter = SearchFilter {
            kinds: vec![PatternKind::DebugNote, PatternKind::Adr],
            ..Default::default()
        };
        let related = self.kb.search(&query, PRIOR_ART_LIMIT, Some(&filter)).await?.hits;
        let references: Vec<String> = related.iter().map(|h| h.pattern.id.clone()).collect();

        let steps = build_steps(description, &related, &references);
        Ok(DebugAnalysis { steps, related })
    }
}

fn build_steps(
    description: &str,
    related: &[SearchHit],
    references: &[String],
) -> Vec<DiagnosticStep> {
    let prior_art = if related.is_empty() {
        "No recorded prior art matched; treat this as a novel failure.".to_string()
    } else {
        let titles: Vec<&str> = related.iter().map(|h| h.pattern.title.as_str()).collect();
        format!("Closest recorded prior art: {}.", titles.join("; "))
    };

    vec![
        DiagnosticStep {
            phase: DiagnosticPhase::Observe,
            description: format!(
                "Reproduce the issue and capture logs, metrics and inputs around: {description}"
            ),
            references: references.to_vec(),
        },
        DiagnosticStep {
            phase: DiagnosticPhase::Hypothesize,
            description: format!(
                "List candidate causes ranked by likelihood. {prior_art}"
            ),
            references: references.to_vec(),
        },
        DiagnosticStep {
            phase: DiagnosticPhase::Isolate,
            description: "Bisect the failing path: disable caching, retries and concurrency one \
                          at a time until the signal disappears."
                .to_string(),
            references: Vec::new(),
        },
        DiagnosticStep {
            phase: DiagnosticPhase::Fix,
            description: "Apply the smallest change that addresses the isolated cause; prefer \
                          the approach recorded in the referenced decisions."
                .to_string(),
            references: references.to_vec(),
        },
        DiagnosticStep {
            phase: DiagnosticPhase::Verify,
            description: "Re-run the reproduction, confirm the observation from step one is \
                          gone, and record the outcome as a debug note."
                .to_string(),
            references: Vec::new(),
        },
    ]
}

#[async_trait]
impl Component for DebugAnalyzer {
    fn name(&self) -> &'static str {
        "debug-analyzer"
    }

    async fn initialize(&self) -> Result<()> {
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
    use crate::cache::TieredCache;
    use crate::core::component::Component;
    use crate::core::types::Pattern;
    use crate::embedder::Embedder;
    use crate::providers::{InMemoryVectorIndex, LocalEmbeddingProvider};
    use crate::vector::VectorStore;
    use tempfile::TempDir;

    const DIM: usize = 64;

    async fn fixture(tmp: &TempDir) -> (Arc<KnowledgeBase>, DebugAnalyzer) {
        let embedder = Arc::new(Embedder::new(
            Arc::new(LocalEmbeddingProvider::new("test", DIM)),
            DIM,
        ));
        let vectors = Arc::new(VectorStore::new(
            Arc::new(InMemoryVectorIndex::new()),
            "debug_test".to_string(),
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
        (Arc::clone(&kb), DebugAnalyzer::new(kb))
    }

    #[tokio::test]
    async fn test_analysis_covers_all_phases_in_order() {
        let tmp = TempDir::new().unwrap();
        let (_, analyzer) = fixture(&tmp).await;

        let analysis = analyzer
            .analyze("connection pool exhausted under load", None)
            .await
            .unwrap();
        let phases: Vec<DiagnosticPhase> = analysis.steps.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                DiagnosticPhase::Observe,
                DiagnosticPhase::Hypothesize,
                DiagnosticPhase::Isolate,
                DiagnosticPhase::Fix,
                DiagnosticPhase::Verify,
            ]
        );
    }

    #[tokio::test]
    async fn test_prior_art_referenced() {
        let tmp = TempDir::new().unwrap();
        let (kb, analyzer) = fixture(&tmp).await;

        let mut note = Pattern::new(
            PatternKind::DebugNote,
            "connection pool exhaustion",
            "raise pool size, add backpressure",
        );
        note.tags = vec!["db".to_string()];
        let id = kb.index(note).await.unwrap();

        let analysis = analyzer
            .analyze("connection pool exhausted under load", None)
            .await
            .unwrap();
        assert!(analysis.related.iter().any(|h| h.pattern.id == id));
        assert!(analysis.steps[0].references.contains(&id));
    }

    #[tokio::test]
    async fn test_empty_description_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_, analyzer) = fixture(&tmp).await;
        let err = analyzer.analyze("   ", None).await.unwrap_err();
        assert_eq!(err.kind(), "validation-failed");
    }

    #[tokio::test]
    async fn test_only_debug_notes_and_adrs_retrieved() {
        let tmp = TempDir::new().unwrap();
        let (kb, analyzer) = fixture(&tmp).await;

        let code_id = kb
            .index(Pattern::new(
                PatternKind::Code,
                "connection pool helper",
                "fn pool() {}",
            ))
            .await
            .unwrap();

        let analysis = analyzer
            .analyze("connection pool helper misbehaves", None)
            .await
            .unwrap();
        assert!(analysis.related.iter().all(|h| h.pattern.id != code_id));
    }
}
