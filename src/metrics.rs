//! In-process metrics registry
//!
//! Lightweight atomic counters and gauges snapshotted as JSON by the
//! `/metrics` route. The task and cache histograms are folded in by the
//! HTTP layer at snapshot time.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide counters and gauges
#[derive(Default)]
pub struct Metrics {
    pub http_requests: AtomicU64,
    pub queue_depth: AtomicI64,
    pub queue_rejections: AtomicU64,
    pub tasks_submitted: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub sse_sessions: AtomicI64,
    pub sse_tool_calls: AtomicU64,
    /// Errors shaped onto the wire, by error kind
    errors: DashMap<String, u64>,
}

/// Serializable snapshot of the registry
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub http: HttpMetrics,
    pub queue: QueueMetrics,
    pub tasks: TaskMetrics,
    pub sse: SseMetrics,
    pub errors: std::collections::BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpMetrics {
    pub requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub depth: i64,
    pub rejections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub submitted: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SseMetrics {
    pub sessions: i64,
    pub tool_calls: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, kind: &str) {
        *self.errors.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http: HttpMetrics {
                requests: self.http_requests.load(Ordering::Relaxed),
            },
            queue: QueueMetrics {
                depth: self.queue_depth.load(Ordering::Relaxed),
                rejections: self.queue_rejections.load(Ordering::Relaxed),
            },
            tasks: TaskMetrics {
                submitted: self.tasks_submitted.load(Ordering::Relaxed),
                retried: self.tasks_retried.load(Ordering::Relaxed),
            },
            sse: SseMetrics {
                sessions: self.sse_sessions.load(Ordering::Relaxed),
                tool_calls: self.sse_tool_calls.load(Ordering::Relaxed),
            },
            errors: self
                .errors
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = Metrics::new();
        metrics.http_requests.fetch_add(3, Ordering::Relaxed);
        metrics.queue_depth.store(2, Ordering::Relaxed);
        metrics.record_error("queue-full");
        metrics.record_error("queue-full");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.http.requests, 3);
        assert_eq!(snapshot.queue.depth, 2);
        assert_eq!(snapshot.errors.get("queue-full"), Some(&2));
    }
}
