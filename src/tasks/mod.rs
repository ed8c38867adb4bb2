//! Task manager component
//!
//! Bounded-queue worker pool driving the async workflows. Submission
//! reserves queue capacity before any record exists, so a full queue
//! rejects without leaving half-created tasks behind. Every state
//! transition is persisted to its sidecar before subscribers are notified;
//! terminal states are final. Worker panics are contained and recorded as
//! `internal-error`.

mod handlers;

pub use handlers::TaskContext;

use crate::core::component::{Component, ComponentStatus};
use crate::core::error::{Error, Result};
use crate::core::types::{Task, TaskError, TaskState, TaskType};
use crate::metrics::Metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Async workflow engine with a bounded queue and a fixed worker pool
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    records: DashMap<String, Task>,
    watchers: DashMap<String, watch::Sender<Task>>,
    cancel_tokens: DashMap<String, CancellationToken>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    tasks_dir: PathBuf,
    workers: usize,
    retries: u32,
    context: TaskContext,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TaskManager {
    pub fn new(
        context: TaskContext,
        tasks_dir: PathBuf,
        workers: usize,
        queue_depth: usize,
        retries: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_depth);
        Self {
            inner: Arc::new(Inner {
                records: DashMap::new(),
                watchers: DashMap::new(),
                cancel_tokens: DashMap::new(),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                tasks_dir,
                workers,
                retries,
                context,
                metrics,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Enqueue a task; rejects with `queue-full` before creating any record
    pub fn submit(&self, task_type: TaskType, input: serde_json::Value) -> Result<String> {
        let permit = match self.inner.queue_tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                self.inner
                    .metrics
                    .queue_rejections
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(Error::internal("task queue closed"));
            }
        };

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            state: TaskState::Queued,
            input,
            result: None,
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
        };

        let id = task.id.clone();
        self.inner.persist(&task)?;
        let (tx, _) = watch::channel(task.clone());
        self.inner.watchers.insert(id.clone(), tx);
        self.inner.records.insert(id.clone(), task);

        permit.send(id.clone());
        self.inner.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .tasks_submitted
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id = %id, task_type = %task_type, "task queued");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.records.get(id).map(|t| t.clone())
    }

    /// Cooperative cancellation; terminal tasks are a no-op
    pub fn cancel(&self, id: &str) -> Result<Task> {
        let task = self
            .inner
            .records
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| Error::not_found(format!("task {id}")))?;

        match task.state {
            state if state.is_terminal() => Ok(task),
            TaskState::Queued => {
                // The worker skips dequeued ids whose record is terminal.
                let mut canceled = task;
                canceled.state = TaskState::Canceled;
                canceled.finished_at = Some(chrono::Utc::now());
                self.inner.store_and_notify(canceled.clone())?;
                Ok(canceled)
            }
            TaskState::Running => {
                if let Some(token) = self.inner.cancel_tokens.get(id) {
                    token.cancel();
                }
                Ok(task)
            }
            _ => Ok(task),
        }
    }

    /// Stream of state snapshots for one task; ends once a terminal
    /// snapshot has been observed
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<Task>> {
        self.inner
            .watchers
            .get(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::not_found(format!("task {id}")))
    }

    /// Count of tasks per state, for health and metrics
    pub fn state_histogram(&self) -> HashMap<&'static str, usize> {
        let mut histogram = HashMap::new();
        for task in self.inner.records.iter() {
            *histogram.entry(task.state.as_str()).or_insert(0) += 1;
        }
        histogram
    }

    /// Stop workers and wait for the in-flight tasks up to `deadline`
    pub async fn drain(&self, deadline: std::time::Duration) -> bool {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        tokio::select! {
            _ = self.inner.tracker.wait() => true,
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!("task drain deadline elapsed with workers still busy");
                false
            }
        }
    }
}

impl Inner {
    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    fn persist(&self, task: &Task) -> Result<()> {
        let path = self.sidecar_path(&task.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(task)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Persist first, notify second: restart-time state is never ahead of
    /// what subscribers last saw
    fn store_and_notify(&self, task: Task) -> Result<()> {
        self.persist(&task)?;
        self.records.insert(task.id.clone(), task.clone());
        if let Some(tx) = self.watchers.get(&task.id) {
            // send_replace stores the snapshot even with no receivers, so a
            // late subscriber still sees the latest state.
            tx.send_replace(task);
        }
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<String>>>) {
        tracing::debug!(worker_id, "task worker started");
        loop {
            let id = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                    _ = self.shutdown.cancelled() => break,
                }
            };
            self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.run_one(&id).await;
        }
        tracing::debug!(worker_id, "task worker stopped");
    }

    async fn run_one(&self, id: &str) {
        let Some(task) = self.records.get(id).map(|t| t.clone()) else {
            return;
        };
        // Canceled while queued: the terminal record is already persisted.
        if task.state != TaskState::Queued {
            return;
        }

        let mut running = task;
        running.state = TaskState::Running;
        running.attempts += 1;
        running.started_at = Some(chrono::Utc::now());
        if let Err(e) = self.store_and_notify(running.clone()) {
            tracing::error!(id, "failed to persist running transition: {}", e);
            return;
        }

        let token = CancellationToken::new();
        self.cancel_tokens.insert(id.to_string(), token.clone());

        let outcome = AssertUnwindSafe(handlers::dispatch(
            &self.context,
            running.task_type,
            &running.input,
            &token,
        ))
        .catch_unwind()
        .await;

        self.cancel_tokens.remove(id);
        let canceled = token.is_cancelled();
        let mut finished = running;

        match outcome {
            _ if canceled => {
                finished.state = TaskState::Canceled;
                finished.finished_at = Some(chrono::Utc::now());
            }
            Ok(Ok(result)) => {
                finished.state = TaskState::Succeeded;
                finished.result = Some(result);
                finished.finished_at = Some(chrono::Utc::now());
            }
            Ok(Err(e)) if e.is_retryable() && finished.attempts <= self.retries => {
                // Back to the tail, never the head.
                tracing::warn!(id, attempts = finished.attempts, "retrying task: {}", e);
                self.metrics.tasks_retried.fetch_add(1, Ordering::Relaxed);
                finished.state = TaskState::Queued;
                if let Err(persist_err) = self.store_and_notify(finished.clone()) {
                    tracing::error!(id, "failed to persist retry: {}", persist_err);
                    return;
                }
                match self.queue_tx.try_send(id.to_string()) {
                    Ok(()) => {
                        self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    Err(_) => {
                        finished.state = TaskState::Failed;
                        finished.error = Some(TaskError {
                            kind: "queue-full".to_string(),
                            message: "queue full at retry".to_string(),
                        });
                        finished.finished_at = Some(chrono::Utc::now());
                    }
                }
            }
            Ok(Err(e)) => {
                finished.state = TaskState::Failed;
                finished.error = Some(TaskError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                finished.finished_at = Some(chrono::Utc::now());
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panic".to_string());
                tracing::error!(id, "task handler panicked: {}", message);
                finished.state = TaskState::Failed;
                finished.error = Some(TaskError {
                    kind: "internal-error".to_string(),
                    message,
                });
                finished.finished_at = Some(chrono::Utc::now());
            }
        }

        if let Err(e) = self.store_and_notify(finished) {
            tracing::error!(id, "failed to persist terminal transition: {}", e);
        }
    }
}

#[async_trait]
impl Component for TaskManager {
    fn name(&self) -> &'static str {
        "task-manager"
    }

    async fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(&self.inner.tasks_dir)?;

        // Recover persisted records: anything mid-flight at crash time is
        // terminal now, queued work re-enters the queue in creation order.
        let mut recovered: Vec<Task> = Vec::new();
        for entry in std::fs::read_dir(&self.inner.tasks_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(Error::from).and_then(|data| {
                serde_json::from_slice::<Task>(&data).map_err(Error::from)
            }) {
                Ok(task) => recovered.push(task),
                Err(e) => tracing::warn!("skipping corrupt task sidecar {}: {}", path.display(), e),
            }
        }
        recovered.sort_by_key(|t| t.created_at);

        for mut task in recovered {
            if task.state == TaskState::Running {
                task.state = TaskState::Failed;
                task.error = Some(TaskError {
                    kind: "internal-error".to_string(),
                    message: "interrupted".to_string(),
                });
                task.finished_at = Some(chrono::Utc::now());
                self.inner.persist(&task)?;
            }

            let requeue = task.state == TaskState::Queued;
            let id = task.id.clone();
            let (tx, _) = watch::channel(task.clone());
            self.inner.watchers.insert(id.clone(), tx);
            self.inner.records.insert(id.clone(), task);

            if requeue {
                if self.inner.queue_tx.try_send(id.clone()).is_ok() {
                    self.inner.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::warn!(id = %id, "queue full during recovery, task left queued");
                }
            }
        }

        // Spawn the worker pool sharing one receiver.
        let rx = self
            .inner
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::internal("task manager initialized twice"))?;
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            self.inner
                .tracker
                .spawn(async move { inner.worker_loop(worker_id, rx).await });
        }

        tracing::info!(
            workers = self.inner.workers,
            recovered = self.inner.records.len(),
            "task manager ready"
        );
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        if self.inner.shutdown.is_cancelled() {
            ComponentStatus::unhealthy("shutting down")
        } else {
            ComponentStatus::healthy()
        }
    }
}
