//! In-process progress event bus.
//!
//! One broadcast topic carries all pipeline progress. Delivery is
//! best-effort and in-order per problem; a subscriber that falls more
//! than the backlog behind sees a `Lagged` error from its receiver and
//! is expected to resubscribe (the transport signals its client to
//! reconnect). The engine itself never blocks on slow subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::pipeline::Stage;

/// Bounded backlog per subscriber before it is dropped from the topic.
pub const EVENT_BACKLOG: usize = 100;

/// Event kinds forwarded to transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    /// A task envelope was accepted.
    #[serde(rename = "task.created")]
    TaskCreated,
    /// The first problem of a task was admitted.
    #[serde(rename = "task.started")]
    TaskStarted,
    /// A stage reported progress for one problem.
    #[serde(rename = "task.progress")]
    TaskProgress,
    /// One problem reached a terminal state.
    #[serde(rename = "task.problem_completed")]
    TaskProblemCompleted,
    /// Every problem of a task completed successfully.
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// A task finished with at least one failed problem.
    #[serde(rename = "task.failed")]
    TaskFailed,
}

impl EventKind {
    /// Dotted wire form, e.g. `task.progress`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task.created",
            Self::TaskStarted => "task.started",
            Self::TaskProgress => "task.progress",
            Self::TaskProblemCompleted => "task.problem_completed",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
        }
    }
}

/// One progress event. Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// What happened.
    pub kind: EventKind,
    /// The owning task.
    pub task_id: String,
    /// The problem involved, when the event is problem-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem_id: Option<i64>,
    /// The stage involved, when the event is stage-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Short status word (`running`, `completed`, `failed_gen`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Coarse progress percentage, when meaningful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<u8>,
    /// Free-form detail payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// RFC 3339 emission timestamp.
    pub ts: String,
}

impl ProgressEvent {
    /// Build an event stamped with the current time.
    pub fn now(kind: EventKind, task_id: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            problem_id: None,
            stage: None,
            status: None,
            progress_pct: None,
            payload: None,
            ts: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Attach a problem id.
    pub fn problem(mut self, problem_id: i64) -> Self {
        self.problem_id = Some(problem_id);
        self
    }

    /// Attach a stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Attach a status word.
    pub fn status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    /// Attach a detail payload.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// The process-wide progress topic.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Create a bus with the default backlog.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BACKLOG);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) {
        tracing::trace!(kind = event.kind.as_str(), task_id = %event.task_id, "progress event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to the topic. The receiver reports `Lagged` when it
    /// falls more than [`EVENT_BACKLOG`] events behind.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
