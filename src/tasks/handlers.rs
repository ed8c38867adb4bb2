//! Task handlers
//!
//! Each task type dispatches to one handler over the shared components.
//! Handlers parse their own input payloads; a payload that does not parse is
//! a non-retryable `validation-failed`, so the task terminates instead of
//! looping.

use crate::adr::{AdrDraft, AdrManager};
use crate::core::error::{Error, Result};
use crate::core::types::{Pattern, PatternKind, SearchFilter, TaskType};
use crate::debug::DebugAnalyzer;
use crate::docs::DocManager;
use crate::knowledge::KnowledgeBase;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Components available to task handlers
///
/// The task manager depends on the knowledge base, never the other way
/// around; index-pattern tasks are submitted by transport handlers.
#[derive(Clone)]
pub struct TaskContext {
    pub kb: Arc<KnowledgeBase>,
    pub adrs: Arc<AdrManager>,
    pub docs: Arc<DocManager>,
    pub debug: Arc<DebugAnalyzer>,
}

/// Dispatch a task to its handler by type
pub async fn dispatch(
    ctx: &TaskContext,
    task_type: TaskType,
    input: &serde_json::Value,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    match task_type {
        TaskType::AnalyzeCode => analyze_code(ctx, input).await,
        TaskType::CrawlDocs => crawl_docs(ctx, input, cancel).await,
        TaskType::DebugIssue => debug_issue(ctx, input).await,
        TaskType::CreateAdr => create_adr(ctx, input).await,
        TaskType::IndexPattern => index_pattern(ctx, input).await,
    }
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: &serde_json::Value) -> Result<T> {
    serde_json::from_value(input.clone())
        .map_err(|e| Error::validation(format!("invalid task input: {e}")))
}

#[derive(Deserialize)]
struct AnalyzeCodeInput {
    code: String,
    #[serde(default)]
    context: Option<String>,
}

async fn analyze_code(ctx: &TaskContext, input: &serde_json::Value) -> Result<serde_json::Value> {
    let input: AnalyzeCodeInput = parse_input(input)?;
    if input.code.trim().is_empty() {
        return Err(Error::validation("code must not be empty"));
    }

    let query = match &input.context {
        Some(context) if !context.trim().is_empty() => format!("{}\n{}", input.code, context),
        _ => input.code.clone(),
    };

    let filter = SearchFilter {
        kinds: vec![PatternKind::Code, PatternKind::Adr],
        ..Default::default()
    };
    let related = ctx.kb.search(&query, 5, Some(&filter)).await?.hits;

    let line_count = input.code.lines().count();
    let related_json: Vec<serde_json::Value> = related
        .iter()
        .map(|hit| {
            serde_json::json!({
                "id": hit.pattern.id,
                "title": hit.pattern.title,
                "kind": hit.pattern.kind.as_str(),
                "score": hit.score,
            })
        })
        .collect();

    Ok(serde_json::json!({
        "line_count": line_count,
        "related_patterns": related_json,
        "summary": format!(
            "{} lines analyzed, {} related patterns found",
            line_count,
            related.len()
        ),
    }))
}

#[derive(Deserialize)]
struct CrawlDocsInput {
    urls: Vec<String>,
    source_type: String,
}

async fn crawl_docs(
    ctx: &TaskContext,
    input: &serde_json::Value,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    let input: CrawlDocsInput = parse_input(input)?;
    if input.urls.is_empty() {
        return Err(Error::validation("urls must not be empty"));
    }

    let report = ctx.docs.crawl(&input.urls, &input.source_type, cancel).await?;
    Ok(serde_json::to_value(report)?)
}

#[derive(Deserialize)]
struct DebugIssueInput {
    description: String,
    #[serde(default)]
    context: Option<String>,
}

async fn debug_issue(ctx: &TaskContext, input: &serde_json::Value) -> Result<serde_json::Value> {
    let input: DebugIssueInput = parse_input(input)?;
    let analysis = ctx
        .debug
        .analyze(&input.description, input.context.as_deref())
        .await?;
    Ok(serde_json::to_value(analysis)?)
}

#[derive(Deserialize)]
struct CreateAdrInput {
    title: String,
    decision: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    consequences: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    supersedes: Option<String>,
}

async fn create_adr(ctx: &TaskContext, input: &serde_json::Value) -> Result<serde_json::Value> {
    let input: CreateAdrInput = parse_input(input)?;
    let record = ctx
        .adrs
        .create(AdrDraft {
            title: input.title,
            decision: input.decision,
            context: input.context.unwrap_or_default(),
            consequences: input.consequences.unwrap_or_default(),
            tags: input.tags,
            supersedes: input.supersedes,
        })
        .await?;
    Ok(serde_json::to_value(record)?)
}

#[derive(Deserialize)]
struct IndexPatternInput {
    kind: PatternKind,
    title: String,
    body: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    language: Option<String>,
}

async fn index_pattern(ctx: &TaskContext, input: &serde_json::Value) -> Result<serde_json::Value> {
    let input: IndexPatternInput = parse_input(input)?;
    if input.title.trim().is_empty() {
        return Err(Error::validation("title must not be empty"));
    }

    let mut pattern = Pattern::new(input.kind, input.title, input.body);
    pattern.tags = input.tags;
    pattern.language = input.language;

    let id = ctx.kb.index(pattern).await?;
    Ok(serde_json::json!({ "id": id }))
}
