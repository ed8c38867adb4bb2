//! Vector index provider implementations

mod memory;
mod qdrant;

pub use memory::InMemoryVectorIndex;
pub use qdrant::QdrantVectorIndex;

use crate::core::types::SearchFilter;
use crate::providers::VectorPayload;

/// Evaluate the filter clauses a backend expresses over payloads
///
/// Shared by the in-memory index (which filters in-process) and by the tests
/// that pin down payload semantics. `updated_after` is deliberately absent:
/// that clause is always applied post-hoc by the knowledge base.
pub(crate) fn payload_matches(payload: &VectorPayload, filter: &SearchFilter) -> bool {
    if !filter.kinds.is_empty() {
        let kind = payload.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if !filter.kinds.iter().any(|k| k.as_str() == kind) {
            return false;
        }
    }

    if let Some(tag) = &filter.tag {
        let has_tag = payload
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| tags.iter().any(|t| t.as_str() == Some(tag.as_str())))
            .unwrap_or(false);
        if !has_tag {
            return false;
        }
    }

    if let Some(language) = &filter.language {
        if payload.get("language").and_then(|v| v.as_str()) != Some(language.as_str()) {
            return false;
        }
    }

    true
}

/// Cosine similarity clamped into [0, 1]
pub(crate) fn clamped_cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for i in 0..a.len().min(b.len()) {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}
