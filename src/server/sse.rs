//! SSE tool transport
//!
//! A session is opened by GET `/mcp/sse`: the server assigns an id, emits a
//! `ready` event carrying the tool manifest, and keeps the stream alive with
//! periodic pings. Tool calls arrive via POST `/mcp/messages/{session}` and
//! are executed by a dedicated per-session dispatcher task, so responses on
//! one session preserve call order. Long tools submit a task and stream
//! `task_update` events from a subscription; client disconnect drops the
//! subscription but never the task itself.

use crate::metrics::Metrics;
use crate::server::tools::{ToolOutcome, ToolRegistry};
use crate::server::ComponentRegistry;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 64;
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// One wire event: `event:` name plus `data:` JSON
#[derive(Debug, Clone)]
pub struct WireEvent {
    pub event: &'static str,
    pub data: serde_json::Value,
}

/// Incoming tool call message
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    /// Client-chosen correlation id, echoed on the response event
    #[serde(default)]
    pub id: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

struct SessionHandle {
    inbound: mpsc::Sender<ToolCall>,
    outbound: mpsc::Sender<WireEvent>,
    cancel: CancellationToken,
}

/// Shared state of the SSE transport
pub struct SseState {
    registry: Arc<ComponentRegistry>,
    tools: Arc<ToolRegistry>,
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SseState {
    pub fn new(registry: Arc<ComponentRegistry>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            tools,
            sessions: DashMap::new(),
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn metrics(&self) -> &Metrics {
        &self.registry.metrics
    }

    /// Open a session: returns the id and the outbound event receiver
    pub fn open_session(self: &Arc<Self>) -> (String, mpsc::Receiver<WireEvent>) {
        let session_id = format!("sse_{}", uuid::Uuid::new_v4().simple());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let cancel = CancellationToken::new();

        let handle = Arc::new(SessionHandle {
            inbound: inbound_tx,
            outbound: outbound_tx.clone(),
            cancel: cancel.clone(),
        });
        self.sessions.insert(session_id.clone(), handle);
        self.metrics().sse_sessions.fetch_add(1, Ordering::Relaxed);

        // The ready event is enqueued before the stream is handed back, so
        // it is always the first thing a client sees.
        let manifest: Vec<_> = self.tools.manifest();
        let _ = outbound_tx.try_send(WireEvent {
            event: "ready",
            data: serde_json::json!({
                "session": session_id,
                "tools": manifest,
            }),
        });

        // Dispatcher: executes this session's calls strictly in order.
        let state = Arc::clone(self);
        let dispatcher_session = session_id.clone();
        let dispatcher_out = outbound_tx.clone();
        let dispatcher_cancel = cancel.clone();
        tokio::spawn(async move {
            state
                .dispatch_loop(dispatcher_session, inbound_rx, dispatcher_out, dispatcher_cancel)
                .await;
        });

        // Keepalive pings, at most 30s apart on an idle stream. A failed
        // send means the client is gone; reap the session.
        let ping_state = Arc::clone(self);
        let ping_session = session_id.clone();
        let ping_out = outbound_tx;
        let ping_cancel = cancel;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if ping_out
                            .send(WireEvent { event: "ping", data: serde_json::json!({}) })
                            .await
                            .is_err()
                        {
                            ping_state.close_session(&ping_session);
                            break;
                        }
                    }
                    _ = ping_cancel.cancelled() => break,
                }
            }
        });

        tracing::debug!(session = %session_id, "sse session opened");
        (session_id, outbound_rx)
    }

    /// Deliver a tool call onto a session's inbound queue (202 semantics)
    pub fn deliver(&self, session_id: &str, call: ToolCall) -> Result<(), DeliverError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or(DeliverError::UnknownSession)?;
        handle
            .inbound
            .try_send(call)
            .map_err(|_| DeliverError::Backlogged)
    }

    /// Drop a session and cancel its subscriptions; running tasks continue
    pub fn close_session(&self, session_id: &str) {
        if let Some((_, handle)) = self.sessions.remove(session_id) {
            handle.cancel.cancel();
            self.metrics().sse_sessions.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(session = %session_id, "sse session closed");
        }
    }

    /// Shutdown path: say goodbye and tear every session down
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            let sender = self.sessions.get(&id).map(|h| h.outbound.clone());
            if let Some(sender) = sender {
                let _ = sender
                    .send(WireEvent {
                        event: "bye",
                        data: serde_json::json!({"session": id}),
                    })
                    .await;
            }
            self.close_session(&id);
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        session_id: String,
        mut inbound: mpsc::Receiver<ToolCall>,
        outbound: mpsc::Sender<WireEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let call = tokio::select! {
                call = inbound.recv() => match call {
                    Some(call) => call,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            self.metrics().sse_tool_calls.fetch_add(1, Ordering::Relaxed);
            let event = self.execute(&call, &outbound, &cancel).await;
            if outbound.send(event).await.is_err() {
                // Client went away; cancel subscriptions and stop.
                self.close_session(&session_id);
                break;
            }
        }
    }

    async fn execute(
        &self,
        call: &ToolCall,
        outbound: &mpsc::Sender<WireEvent>,
        cancel: &CancellationToken,
    ) -> WireEvent {
        if self.tools.get(&call.tool).is_none() {
            return tool_error(call, "not-found", &format!("tool {} not available", call.tool));
        }

        match crate::server::tools::dispatch(&self.registry, &call.tool, &call.arguments).await {
            Ok(ToolOutcome::Immediate(result)) => WireEvent {
                event: "tool_result",
                data: serde_json::json!({
                    "id": call.id,
                    "tool": call.tool,
                    "result": result,
                }),
            },
            Ok(ToolOutcome::Submitted { task_id }) => {
                self.spawn_task_forwarder(task_id.clone(), outbound.clone(), cancel.clone());
                WireEvent {
                    event: "tool_result",
                    data: serde_json::json!({
                        "id": call.id,
                        "tool": call.tool,
                        "result": { "task_id": task_id },
                    }),
                }
            }
            Err(e) => tool_error(call, e.kind(), &e.to_string()),
        }
    }

    /// Forward task state snapshots until the task is terminal or the
    /// session goes away; the task itself is never canceled here
    fn spawn_task_forwarder(
        &self,
        task_id: String,
        outbound: mpsc::Sender<WireEvent>,
        cancel: CancellationToken,
    ) {
        let Ok(mut updates) = self.registry.tasks.subscribe(&task_id) else {
            return;
        };

        tokio::spawn(async move {
            loop {
                let snapshot = updates.borrow().clone();
                let terminal = snapshot.state.is_terminal();
                let event = WireEvent {
                    event: "task_update",
                    data: serde_json::json!({
                        "task_id": task_id,
                        "task": snapshot,
                    }),
                };
                if outbound.send(event).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}

fn tool_error(call: &ToolCall, kind: &str, message: &str) -> WireEvent {
    WireEvent {
        event: "tool_error",
        data: serde_json::json!({
            "id": call.id,
            "tool": call.tool,
            "error": { "kind": kind, "message": message },
        }),
    }
}

/// Delivery failures for POST `/mcp/messages/{session}`
#[derive(Debug, PartialEq, Eq)]
pub enum DeliverError {
    UnknownSession,
    Backlogged,
}
