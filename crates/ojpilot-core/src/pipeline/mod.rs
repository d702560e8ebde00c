//! The per-problem pipeline: stage taxonomy, error classification, the
//! executor context, and the runner driving the state machine.
//!
//! Stages are four functions over a [`ProblemCtx`]; the runner owns skip
//! and retry policy, so executors stay free of control flow concerns.

pub mod exec;
pub mod runner;
pub mod stages;

#[cfg(test)]
pub(crate) mod e2e_tests;

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{AdapterError, GateError, LlmError, StorageError, WorkspaceError};
use crate::events::{EventBus, EventKind, ProgressEvent};
use crate::gate::GateSet;
use crate::judge::pid::NormalizedPid;
use crate::judge::{AdapterCtx, CredentialSource, JudgeAdapter};
use crate::llm::pool::LlmPool;
use crate::storage::DbPool;
use crate::workspace::Workspace;

// ── Stages ───────────────────────────────────────────────────────────

/// One of the four pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    #[serde(rename = "gen")]
    Generate,
    Upload,
    Solve,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Fetch, Stage::Generate, Stage::Upload, Stage::Solve];

    /// Short stable form used in states, retry requests, and log names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Generate => "gen",
            Self::Upload => "upload",
            Self::Solve => "solve",
        }
    }

    /// Parse the short form; `generate` is accepted as an alias of `gen`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(Self::Fetch),
            "gen" | "generate" => Some(Self::Generate),
            "upload" => Some(Self::Upload),
            "solve" => Some(Self::Solve),
            _ => None,
        }
    }

    /// The concurrency gate guarding this stage's executor.
    pub fn gate_name(self) -> &'static str {
        match self {
            Self::Fetch => crate::gate::STAGE_FETCH,
            Self::Generate => crate::gate::STAGE_GENERATE,
            Self::Upload => crate::gate::STAGE_UPLOAD,
            Self::Solve => crate::gate::STAGE_SOLVE,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enabled-stage subset with the upload-implies-solve rule applied at
/// parse time by the task service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageSet {
    bits: u8,
}

impl StageSet {
    /// The empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// All four stages.
    pub fn all() -> Self {
        let mut set = Self::empty();
        for stage in Stage::ALL {
            set.insert(stage);
        }
        set
    }

    fn bit(stage: Stage) -> u8 {
        match stage {
            Stage::Fetch => 1,
            Stage::Generate => 2,
            Stage::Upload => 4,
            Stage::Solve => 8,
        }
    }

    /// Add a stage.
    pub fn insert(&mut self, stage: Stage) {
        self.bits |= Self::bit(stage);
    }

    /// Remove a stage.
    pub fn remove(&mut self, stage: Stage) {
        self.bits &= !Self::bit(stage);
    }

    /// Membership test.
    pub fn contains(self, stage: Stage) -> bool {
        self.bits & Self::bit(stage) != 0
    }

    /// Whether no stage is enabled.
    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Iterate enabled stages in pipeline order.
    pub fn iter(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| self.contains(*s))
    }

    /// Parse a comma-separated stage list.
    pub fn parse_csv(csv: &str) -> Option<Self> {
        let mut set = Self::empty();
        for part in csv.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            set.insert(Stage::parse(part)?);
        }
        Some(set)
    }

    /// Serialize as a comma-separated stage list.
    pub fn to_csv(self) -> String {
        self.iter()
            .map(Stage::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ── Problem states ───────────────────────────────────────────────────

/// The per-problem state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemState {
    Pending,
    Fetching,
    Generating,
    Uploading,
    Solving,
    Completed,
    Failed(Stage),
    Cancelled,
}

impl ProblemState {
    /// The running state for a stage.
    pub fn running(stage: Stage) -> Self {
        match stage {
            Stage::Fetch => Self::Fetching,
            Stage::Generate => Self::Generating,
            Stage::Upload => Self::Uploading,
            Stage::Solve => Self::Solving,
        }
    }

    /// Stable string form persisted in the problems table.
    pub fn as_str(self) -> String {
        match self {
            Self::Pending => "pending".to_string(),
            Self::Fetching => "fetching".to_string(),
            Self::Generating => "generating".to_string(),
            Self::Uploading => "uploading".to_string(),
            Self::Solving => "solving".to_string(),
            Self::Completed => "completed".to_string(),
            Self::Failed(stage) => format!("failed_{}", stage.as_str()),
            Self::Cancelled => "cancelled".to_string(),
        }
    }

    /// Whether this state ends the pipeline.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

// ── Error taxonomy ───────────────────────────────────────────────────

/// What the engine distinguishes about a failure. The retryable kinds
/// drive the runner's backoff; everything else surfaces immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Retryable.
    TransientNetwork,
    RateLimited,
    Timeout,
    ServerError,
    // Input-ish, non-retryable.
    Auth,
    NotFound,
    Parse,
    BadData,
    Forbidden,
    // Semantic terminal.
    Duplicate,
    GenInsufficient,
    SolveWrongAnswer,
    SolveRuntime,
    SolveCompile,
    UploadNoId,
    StageExhausted(Stage),
    // Infrastructure.
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether the runner may retry this kind automatically.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientNetwork | Self::RateLimited | Self::Timeout | Self::ServerError
        )
    }

    /// Stable code persisted in `last_error_kind`.
    pub fn code(self) -> String {
        match self {
            Self::TransientNetwork => "transient_network".to_string(),
            Self::RateLimited => "rate_limited".to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::ServerError => "5xx".to_string(),
            Self::Auth => "auth".to_string(),
            Self::NotFound => "not_found".to_string(),
            Self::Parse => "parse".to_string(),
            Self::BadData => "bad_data".to_string(),
            Self::Forbidden => "forbidden".to_string(),
            Self::Duplicate => "duplicate".to_string(),
            Self::GenInsufficient => "gen_insufficient".to_string(),
            Self::SolveWrongAnswer => "solve_wrong_answer".to_string(),
            Self::SolveRuntime => "solve_runtime".to_string(),
            Self::SolveCompile => "solve_compile".to_string(),
            Self::UploadNoId => "upload_no_id".to_string(),
            Self::StageExhausted(stage) => format!("stage_exhausted({})", stage.as_str()),
            Self::Cancelled => "cancelled".to_string(),
            Self::Internal => "internal".to_string(),
        }
    }
}

/// A typed stage failure: classification plus a human-readable message.
#[derive(Debug, Clone)]
pub struct StageError {
    /// Classification driving retry policy.
    pub kind: ErrorKind,
    /// Stable reason string, preserved on the problem row.
    pub message: String,
}

impl StageError {
    /// Build an error from kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for StageError {}

impl From<AdapterError> for StageError {
    fn from(error: AdapterError) -> Self {
        let kind = match &error {
            AdapterError::Auth { .. } => ErrorKind::Auth,
            AdapterError::NotFound { .. } => ErrorKind::NotFound,
            AdapterError::Parse { .. } => ErrorKind::Parse,
            AdapterError::Forbidden { .. } => ErrorKind::Forbidden,
            AdapterError::Duplicate { .. } => ErrorKind::Duplicate,
            AdapterError::BadData { .. } => ErrorKind::BadData,
            AdapterError::RateLimited { .. } => ErrorKind::RateLimited,
            AdapterError::Network { .. } => ErrorKind::TransientNetwork,
            AdapterError::Api { status, .. } => match status {
                401 => ErrorKind::Auth,
                403 => ErrorKind::Forbidden,
                404 => ErrorKind::NotFound,
                429 => ErrorKind::RateLimited,
                s if *s >= 500 => ErrorKind::ServerError,
                _ => ErrorKind::BadData,
            },
            AdapterError::Unsupported { .. } => ErrorKind::Internal,
        };
        Self::new(kind, error.to_string())
    }
}

impl From<LlmError> for StageError {
    fn from(error: LlmError) -> Self {
        let kind = match &error {
            LlmError::Request(e) if e.is_timeout() => ErrorKind::Timeout,
            LlmError::Request(_) => ErrorKind::TransientNetwork,
            LlmError::Api { status, .. } => match status {
                401 | 403 => ErrorKind::Auth,
                429 => ErrorKind::RateLimited,
                s if *s >= 500 => ErrorKind::ServerError,
                _ => ErrorKind::BadData,
            },
            LlmError::RateLimited { .. } => ErrorKind::RateLimited,
            LlmError::Parse(_) => ErrorKind::Parse,
            LlmError::NotConfigured { .. } | LlmError::Credentials { .. } => ErrorKind::Auth,
            LlmError::Timeout { .. } => ErrorKind::Timeout,
            LlmError::Cancelled => ErrorKind::Cancelled,
        };
        Self::new(kind, error.to_string())
    }
}

impl From<WorkspaceError> for StageError {
    fn from(error: WorkspaceError) -> Self {
        Self::new(ErrorKind::Internal, error.to_string())
    }
}

impl From<StorageError> for StageError {
    fn from(error: StorageError) -> Self {
        Self::new(ErrorKind::Internal, error.to_string())
    }
}

impl From<GateError> for StageError {
    fn from(error: GateError) -> Self {
        let kind = match &error {
            GateError::Cancelled { .. } => ErrorKind::Cancelled,
            GateError::UnknownGate { .. } => ErrorKind::Internal,
        };
        Self::new(kind, error.to_string())
    }
}

// ── Executor context ─────────────────────────────────────────────────

/// Everything a stage executor needs for one problem.
#[derive(Clone)]
pub struct ProblemCtx {
    /// Owning user.
    pub user_id: i64,
    /// Owning task.
    pub task_id: String,
    /// Problem row id.
    pub problem_id: i64,
    /// Normalized problem reference.
    pub pid: NormalizedPid,
    /// Source judge adapter (fetch side).
    pub source: Arc<dyn JudgeAdapter>,
    /// Target judge adapter (upload/solve side).
    pub target: Arc<dyn JudgeAdapter>,
    /// The per-problem workspace.
    pub workspace: Workspace,
    /// Pooled LLM access.
    pub llm: Arc<LlmPool>,
    /// Per-task LLM provider override for generation and solving.
    pub llm_provider: Option<String>,
    /// The concurrency gates.
    pub gates: Arc<GateSet>,
    /// Persistence handle.
    pub db: DbPool,
    /// Fresh credential lookup for adapter calls.
    pub credentials: Arc<dyn CredentialSource>,
    /// Cooperative cancellation.
    pub cancel: CancellationToken,
    /// Progress fan-out.
    pub bus: EventBus,
    /// Engine configuration.
    pub config: Arc<Config>,
}

impl ProblemCtx {
    /// Build the per-call adapter context.
    pub fn adapter_ctx(&self) -> AdapterCtx {
        AdapterCtx {
            user_id: self.user_id,
            credentials: Arc::clone(&self.credentials),
            cancel: self.cancel.clone(),
        }
    }

    /// Error out if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::new(ErrorKind::Cancelled, "cancelled"))
        } else {
            Ok(())
        }
    }

    /// Emit a stage-scoped progress event.
    pub fn emit_progress(&self, stage: Stage, status: &str, detail: &str) {
        self.bus.publish(
            ProgressEvent::now(EventKind::TaskProgress, &self.task_id)
                .problem(self.problem_id)
                .stage(stage)
                .status(status)
                .payload(serde_json::json!({ "detail": detail })),
        );
    }

    /// Append to the workspace stage log and the tracing stream.
    pub fn log(&self, stage: Stage, line: &str) {
        tracing::debug!(
            task_id = %self.task_id,
            problem_id = self.problem_id,
            stage = stage.as_str(),
            "{line}",
        );
        self.workspace.append_stage_log(stage.as_str(), line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("generate"), Some(Stage::Generate));
        assert_eq!(Stage::parse("nope"), None);
    }

    #[test]
    fn stage_set_csv_round_trip() {
        let set = StageSet::parse_csv("fetch, gen,upload").expect("parse");
        assert!(set.contains(Stage::Fetch));
        assert!(set.contains(Stage::Generate));
        assert!(set.contains(Stage::Upload));
        assert!(!set.contains(Stage::Solve));
        assert_eq!(set.to_csv(), "fetch,gen,upload");
        assert!(StageSet::parse_csv("fetch,bogus").is_none());
    }

    #[test]
    fn stage_set_iterates_in_pipeline_order() {
        let set = StageSet::parse_csv("solve,fetch").expect("parse");
        let ordered: Vec<Stage> = set.iter().collect();
        assert_eq!(ordered, vec![Stage::Fetch, Stage::Solve]);
    }

    #[test]
    fn state_strings() {
        assert_eq!(ProblemState::Pending.as_str(), "pending");
        assert_eq!(ProblemState::Failed(Stage::Generate).as_str(), "failed_gen");
        assert_eq!(ProblemState::running(Stage::Upload).as_str(), "uploading");
        assert!(ProblemState::Cancelled.is_terminal());
        assert!(!ProblemState::Solving.is_terminal());
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::TransientNetwork.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::GenInsufficient.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn stage_exhausted_code_names_stage() {
        assert_eq!(
            ErrorKind::StageExhausted(Stage::Fetch).code(),
            "stage_exhausted(fetch)"
        );
        assert_eq!(ErrorKind::ServerError.code(), "5xx");
    }

    #[test]
    fn adapter_error_classification() {
        let e = StageError::from(AdapterError::Api {
            status: 503,
            message: "down".to_string(),
        });
        assert_eq!(e.kind, ErrorKind::ServerError);
        assert!(e.is_retryable());

        let e = StageError::from(AdapterError::NotFound {
            pid: "1001".to_string(),
        });
        assert_eq!(e.kind, ErrorKind::NotFound);
        assert!(!e.is_retryable());

        let e = StageError::from(AdapterError::Api {
            status: 401,
            message: "no".to_string(),
        });
        assert_eq!(e.kind, ErrorKind::Auth);
    }

    #[test]
    fn llm_error_classification() {
        let e = StageError::from(LlmError::RateLimited {
            retry_after_secs: 5,
        });
        assert_eq!(e.kind, ErrorKind::RateLimited);

        let e = StageError::from(LlmError::Parse("garbage".to_string()));
        assert_eq!(e.kind, ErrorKind::Parse);

        let e = StageError::from(LlmError::Timeout { seconds: 300 });
        assert_eq!(e.kind, ErrorKind::Timeout);

        let e = StageError::from(LlmError::Cancelled);
        assert_eq!(e.kind, ErrorKind::Cancelled);
    }
}
