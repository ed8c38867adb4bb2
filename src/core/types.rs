//! Core data model shared across components
//!
//! Patterns are the unit of indexable knowledge; ADRs and crawled documents
//! are patterns with extra metadata. Tasks are the orchestration records of
//! the async workflow engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of an indexable pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    Code,
    Adr,
    Doc,
    DebugNote,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Adr => "adr",
            Self::Doc => "doc",
            Self::DebugNote => "debug-note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "adr" => Some(Self::Adr),
            "doc" => Some(Self::Doc),
            "debug-note" => Some(Self::DebugNote),
            _ => None,
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of indexable knowledge
///
/// The vector lives in the vector index and is referenced by `id`; a pattern
/// is only visible once its vector upsert has succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub id: String,
    pub kind: PatternKind,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Extra metadata carried by specialized kinds (ADR status, doc source)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Pattern {
    /// Create a pattern with fresh timestamps and no id assigned yet
    pub fn new(kind: PatternKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            kind,
            title: title.into(),
            body: body.into(),
            tags: Vec::new(),
            language: None,
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    /// Text fed to the embedder for this pattern
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.body)
    }
}

/// ADR lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdrStatus {
    Proposed,
    Accepted,
    Implemented,
    Deprecated,
    Superseded,
}

impl AdrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Accepted => "accepted",
            Self::Implemented => "implemented",
            Self::Deprecated => "deprecated",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(Self::Proposed),
            "accepted" => Some(Self::Accepted),
            "implemented" => Some(Self::Implemented),
            "deprecated" => Some(Self::Deprecated),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }

    /// Legal transitions of the ADR state machine
    ///
    /// proposed -> accepted -> implemented; a decision must be accepted
    /// before it can be deprecated or superseded (a merely proposed record
    /// is rejected instead). Superseding requires the successor to cite the
    /// predecessor.
    pub fn can_transition_to(&self, next: AdrStatus) -> bool {
        use AdrStatus::*;
        matches!(
            (self, next),
            (Proposed, Accepted)
                | (Accepted, Implemented)
                | (Accepted, Deprecated)
                | (Implemented, Deprecated)
                | (Accepted, Superseded)
                | (Implemented, Superseded)
        )
    }
}

impl std::fmt::Display for AdrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architectural decision record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdrRecord {
    pub id: String,
    pub number: u32,
    pub slug: String,
    pub title: String,
    pub status: AdrStatus,
    #[serde(default)]
    pub context: String,
    pub decision: String,
    #[serde(default)]
    pub consequences: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    pub date: DateTime<Utc>,
}

/// Scored hit returned by the vector index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    /// Similarity in [0, 1], descending across a result set
    pub score: f32,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Hydrated search result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub pattern: Pattern,
    pub score: f32,
}

/// Conjunctive filter over pattern metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<PatternKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
            && self.tag.is_none()
            && self.language.is_none()
            && self.updated_after.is_none()
    }

    /// Cache tag used for kind-prefix invalidation: the single filtered kind
    /// or `any` when the query spans kinds
    pub fn kind_tag(&self) -> &str {
        if self.kinds.len() == 1 {
            self.kinds[0].as_str()
        } else {
            "any"
        }
    }
}

/// Task workflow type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    AnalyzeCode,
    CrawlDocs,
    DebugIssue,
    CreateAdr,
    IndexPattern,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalyzeCode => "analyze-code",
            Self::CrawlDocs => "crawl-docs",
            Self::DebugIssue => "debug-issue",
            Self::CreateAdr => "create-adr",
            Self::IndexPattern => "index-pattern",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Structured task failure carried on the record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

/// Orchestration record owned by the task manager
///
/// Terminal states are final; `result` and `error` are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub state: TaskState,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

/// Phase of a diagnostic step produced by the debug analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticPhase {
    Observe,
    Hypothesize,
    Isolate,
    Fix,
    Verify,
}

/// One step of a debug analysis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticStep {
    pub phase: DiagnosticPhase,
    pub description: String,
    /// Ids of prior-art patterns supporting this step
    #[serde(default)]
    pub references: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adr_transitions() {
        use AdrStatus::*;
        assert!(Proposed.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(Implemented));
        assert!(Accepted.can_transition_to(Deprecated));
        assert!(Implemented.can_transition_to(Superseded));

        assert!(!Proposed.can_transition_to(Deprecated));
        assert!(!Proposed.can_transition_to(Implemented));
        assert!(!Deprecated.can_transition_to(Accepted));
        assert!(!Superseded.can_transition_to(Proposed));
        assert!(!Implemented.can_transition_to(Accepted));
    }

    #[test]
    fn test_pattern_kind_roundtrip() {
        for kind in [
            PatternKind::Code,
            PatternKind::Adr,
            PatternKind::Doc,
            PatternKind::DebugNote,
        ] {
            assert_eq!(PatternKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PatternKind::parse("nope"), None);
    }

    #[test]
    fn test_task_terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
    }

    #[test]
    fn test_filter_kind_tag() {
        let mut filter = SearchFilter::default();
        assert_eq!(filter.kind_tag(), "any");
        filter.kinds = vec![PatternKind::Adr];
        assert_eq!(filter.kind_tag(), "adr");
        filter.kinds = vec![PatternKind::Adr, PatternKind::Doc];
        assert_eq!(filter.kind_tag(), "any");
    }
}
