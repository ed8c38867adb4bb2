//! SSE tool table
//!
//! Named, schema-checked operations exposed over the event stream. The
//! table is built once at initialization from the set of components that
//! actually came up; a tool whose dependency is missing is simply not
//! registered, so clients learn what they can call from the `ready`
//! manifest instead of probing for errors.

use crate::core::error::{Error, Result};
use crate::core::types::{PatternKind, SearchFilter, TaskType};
use crate::server::ComponentRegistry;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Declared tool surface entry
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: serde_json::Value,
    /// Long tools return a task id and stream `task_update` events
    pub long_running: bool,
}

/// How a tool call completed
pub enum ToolOutcome {
    /// Fast tool: the value is the final result
    Immediate(serde_json::Value),
    /// Long tool: a task was submitted, updates stream separately
    Submitted { task_id: String },
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct VectorSearchArgs {
    /// Natural-language query embedded and matched against the index
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct KnowledgeSearchArgs {
    pub query: String,
    /// Restrict results to one pattern kind (code, adr, doc, debug-note)
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AdrGetArgs {
    pub id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TaskStatusArgs {
    pub task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TaskCancelArgs {
    pub task_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeCodeArgs {
    pub code: String,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CrawlDocsArgs {
    pub urls: Vec<String>,
    pub source_type: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DebugIssueArgs {
    pub description: String,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateAdrArgs {
    pub title: String,
    pub decision: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub consequences: Option<String>,
}

/// The registered tool table, fixed after initialization
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl ToolRegistry {
    /// Register every tool whose dependency components initialized
    pub fn build(availability: &HashMap<&'static str, bool>) -> Self {
        let up = |name: &str| availability.get(name).copied().unwrap_or(false);
        let mut tools = BTreeMap::new();

        let mut register = |spec: ToolSpec| {
            tools.insert(spec.name, spec);
        };

        if up("knowledge-base") {
            register(ToolSpec {
                name: "vector-search",
                description: "Similarity search over all indexed patterns, returning ids and scores",
                input_schema: schema_json::<VectorSearchArgs>(),
                long_running: false,
            });
            register(ToolSpec {
                name: "knowledge-search",
                description: "Filtered similarity search returning full patterns",
                input_schema: schema_json::<KnowledgeSearchArgs>(),
                long_running: false,
            });
        }
        if up("adr-manager") {
            register(ToolSpec {
                name: "adr-list",
                description: "List all architectural decision records",
                input_schema: serde_json::json!({"type": "object", "properties": {}}),
                long_running: false,
            });
            register(ToolSpec {
                name: "adr-get",
                description: "Fetch one ADR by id",
                input_schema: schema_json::<AdrGetArgs>(),
                long_running: false,
            });
            if up("task-manager") {
                register(ToolSpec {
                    name: "create-adr",
                    description: "Create a new ADR in proposed state (runs as a task)",
                    input_schema: schema_json::<CreateAdrArgs>(),
                    long_running: true,
                });
            }
        }
        if up("task-manager") {
            register(ToolSpec {
                name: "task-status",
                description: "Fetch the current state of a task",
                input_schema: schema_json::<TaskStatusArgs>(),
                long_running: false,
            });
            register(ToolSpec {
                name: "task-cancel",
                description: "Request cooperative cancellation of a task",
                input_schema: schema_json::<TaskCancelArgs>(),
                long_running: false,
            });
            if up("knowledge-base") {
                register(ToolSpec {
                    name: "analyze-code",
                    description: "Submit code for pattern and architecture analysis",
                    input_schema: schema_json::<AnalyzeCodeArgs>(),
                    long_running: true,
                });
            }
            if up("debug-analyzer") {
                register(ToolSpec {
                    name: "debug-issue",
                    description: "Run a structured debug analysis over prior art",
                    input_schema: schema_json::<DebugIssueArgs>(),
                    long_running: true,
                });
            }
            if up("doc-manager") {
                register(ToolSpec {
                    name: "crawl-docs",
                    description: "Crawl documentation URLs and index new versions",
                    input_schema: schema_json::<CrawlDocsArgs>(),
                    long_running: true,
                });
            }
        }

        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Manifest embedded in the `ready` event
    pub fn manifest(&self) -> Vec<&ToolSpec> {
        self.tools.values().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn schema_json<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: &serde_json::Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| Error::validation(format!("invalid tool arguments: {e}")))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(5).clamp(1, 100)
}

/// Execute a tool call against the component registry
pub async fn dispatch(
    registry: &ComponentRegistry,
    name: &str,
    args: &serde_json::Value,
) -> Result<ToolOutcome> {
    match name {
        "vector-search" => {
            let args: VectorSearchArgs = parse_args(args)?;
            if args.query.trim().is_empty() {
                return Err(Error::validation("query must not be empty"));
            }
            let outcome = registry
                .kb
                .search(&args.query, clamp_limit(args.limit), None)
                .await?;
            let hits: Vec<serde_json::Value> = outcome
                .hits
                .iter()
                .map(|h| serde_json::json!({"id": h.pattern.id, "score": h.score}))
                .collect();
            Ok(ToolOutcome::Immediate(serde_json::json!({ "hits": hits })))
        }
        "knowledge-search" => {
            let args: KnowledgeSearchArgs = parse_args(args)?;
            if args.query.trim().is_empty() {
                return Err(Error::validation("query must not be empty"));
            }
            let filter = match &args.kind {
                Some(kind) => {
                    let kind = PatternKind::parse(kind)
                        .ok_or_else(|| Error::validation(format!("unknown kind '{kind}'")))?;
                    Some(SearchFilter {
                        kinds: vec![kind],
                        ..Default::default()
                    })
                }
                None => None,
            };
            let outcome = registry
                .kb
                .search(&args.query, clamp_limit(args.limit), filter.as_ref())
                .await?;
            Ok(ToolOutcome::Immediate(serde_json::to_value(outcome.hits)?))
        }
        "adr-list" => Ok(ToolOutcome::Immediate(serde_json::to_value(
            registry.adrs.list(),
        )?)),
        "adr-get" => {
            let args: AdrGetArgs = parse_args(args)?;
            let record = registry
                .adrs
                .get(&args.id)
                .ok_or_else(|| Error::not_found(format!("adr {}", args.id)))?;
            Ok(ToolOutcome::Immediate(serde_json::to_value(record)?))
        }
        "create-adr" => {
            let args: CreateAdrArgs = parse_args(args)?;
            if args.title.trim().is_empty() {
                return Err(Error::validation("title must not be empty"));
            }
            if args.decision.trim().is_empty() {
                return Err(Error::validation("decision must not be empty"));
            }
            let task_id = registry.tasks.submit(
                TaskType::CreateAdr,
                serde_json::json!({
                    "title": args.title,
                    "decision": args.decision,
                    "context": args.context,
                    "consequences": args.consequences,
                }),
            )?;
            Ok(ToolOutcome::Submitted { task_id })
        }
        "task-status" => {
            let args: TaskStatusArgs = parse_args(args)?;
            let task = registry
                .tasks
                .get(&args.task_id)
                .ok_or_else(|| Error::not_found(format!("task {}", args.task_id)))?;
            Ok(ToolOutcome::Immediate(serde_json::to_value(task)?))
        }
        "task-cancel" => {
            let args: TaskCancelArgs = parse_args(args)?;
            let task = registry.tasks.cancel(&args.task_id)?;
            Ok(ToolOutcome::Immediate(serde_json::to_value(task)?))
        }
        "analyze-code" => {
            let args: AnalyzeCodeArgs = parse_args(args)?;
            if args.code.trim().is_empty() {
                return Err(Error::validation("code must not be empty"));
            }
            let task_id = registry.tasks.submit(
                TaskType::AnalyzeCode,
                serde_json::json!({"code": args.code, "context": args.context}),
            )?;
            Ok(ToolOutcome::Submitted { task_id })
        }
        "debug-issue" => {
            let args: DebugIssueArgs = parse_args(args)?;
            if args.description.trim().is_empty() {
                return Err(Error::validation("description must not be empty"));
            }
            let task_id = registry.tasks.submit(
                TaskType::DebugIssue,
                serde_json::json!({"description": args.description, "context": args.context}),
            )?;
            Ok(ToolOutcome::Submitted { task_id })
        }
        "crawl-docs" => {
            let args: CrawlDocsArgs = parse_args(args)?;
            if args.urls.is_empty() {
                return Err(Error::validation("urls must not be empty"));
            }
            let task_id = registry.tasks.submit(
                TaskType::CrawlDocs,
                serde_json::json!({"urls": args.urls, "source_type": args.source_type}),
            )?;
            Ok(ToolOutcome::Submitted { task_id })
        }
        other => Err(Error::not_found(format!("tool {other}"))),
    }
}
