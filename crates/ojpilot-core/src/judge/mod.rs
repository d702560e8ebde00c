//! Judge adapter abstraction: capabilities, canonical problem data, and
//! the dispatch contract every adapter honors.
//!
//! Adapters are shared, stateless singletons. Every call carries an
//! [`AdapterCtx`] with the caller's user id; credentials are read fresh
//! from persistence inside the call, never cached on the adapter. There
//! is deliberately no "configure" entry point on the trait.

pub mod pid;
pub mod registry;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AdapterError, StorageError};
use crate::workspace::Workspace;

// ── Capabilities ─────────────────────────────────────────────────────

/// A named operation an adapter may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Fetch a problem statement and samples.
    Fetch,
    /// Create a problem with generated data on the judge.
    Upload,
    /// Submit solution code for judging.
    Submit,
    /// Poll the verdict of a submission.
    JudgeStatus,
    /// Fetch many problems in one call.
    BatchFetch,
    /// Enumerate training problem ids by tag or range.
    ListTraining,
    /// Provide a known reference solution for a problem.
    ProvideSolution,
}

impl Capability {
    /// Stable string form, matching the serialized representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Upload => "upload",
            Self::Submit => "submit",
            Self::JudgeStatus => "judge-status",
            Self::BatchFetch => "batch-fetch",
            Self::ListTraining => "list-training",
            Self::ProvideSolution => "provide-solution",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Canonical problem data ───────────────────────────────────────────

/// One sample input/output pair from the source judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Sample input.
    pub input: String,
    /// Expected sample output.
    pub output: String,
}

/// Resource limits declared by the source judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Time limit in milliseconds.
    pub time_ms: u64,
    /// Memory limit in megabytes.
    pub memory_mb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_ms: 1000,
            memory_mb: 256,
        }
    }
}

/// An image referenced by a statement body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementImage {
    /// Where the image lives.
    pub url: String,
    /// Text alternative, when the source provides one.
    #[serde(default)]
    pub alt: Option<String>,
}

/// A canonical, judge-independent problem statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Problem title.
    pub title: String,
    /// Statement body (markdown-ish free text).
    pub body: String,
    /// Description of the input format.
    #[serde(default)]
    pub input_format: String,
    /// Description of the output format.
    #[serde(default)]
    pub output_format: String,
    /// Sample input/output pairs.
    #[serde(default)]
    pub samples: Vec<Sample>,
    /// Declared resource limits.
    #[serde(default)]
    pub limits: Limits,
    /// Topic tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form notes or hints.
    #[serde(default)]
    pub notes: Option<String>,
    /// Images embedded in the statement.
    #[serde(default)]
    pub images: Vec<StatementImage>,
}

impl Statement {
    /// Whether any image lacks a text alternative, requiring OCR before
    /// the statement can feed an LLM prompt.
    pub fn needs_ocr(&self) -> bool {
        self.images.iter().any(|img| img.alt.is_none())
    }
}

/// Collapse whitespace runs to single spaces and trim, for exact-title
/// comparison against a target judge. Comparison stays case-sensitive.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Upload / submission types ────────────────────────────────────────

/// Raw result of an upload call, before real-id resolution.
#[derive(Debug, Clone, Default)]
pub struct UploadResponse {
    /// The id the target judge assigned, when the response carried one.
    pub real_id: Option<String>,
    /// Adapter-specific response metadata.
    pub extra: serde_json::Value,
}

/// Proof-of-upload artifact binding a workspace to a target judge id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Target adapter name.
    pub adapter: String,
    /// The id the target judge assigned.
    pub real_id: String,
    /// Public URL of the uploaded problem.
    pub url: String,
    /// RFC 3339 upload timestamp.
    pub uploaded_at: String,
}

/// Opaque handle to a submission awaiting judgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionHandle {
    /// Adapter-scoped submission id.
    pub id: String,
}

/// Terminal and non-terminal verdicts a judge can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Still judging.
    Pending,
    /// All cases passed.
    Accepted,
    /// Output mismatch on some case.
    WrongAnswer,
    /// Crash or nonzero exit.
    RuntimeError,
    /// Exceeded the time limit.
    TimeLimit,
    /// Exceeded the memory limit.
    MemoryLimit,
    /// Compilation failed.
    CompileError,
}

impl Verdict {
    /// Whether this verdict ends the judging process.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A verdict with optional judge logs.
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    /// Current verdict.
    pub verdict: Verdict,
    /// Compiler or checker logs, when available.
    pub logs: Option<String>,
}

/// Selector for [`JudgeAdapter::list_training_ids`].
#[derive(Debug, Clone)]
pub enum TrainingSelector {
    /// Problems carrying a tag.
    Tag(String),
    /// A contiguous id range, inclusive.
    Range(u64, u64),
}

// ── Config schema ────────────────────────────────────────────────────

/// Field kinds a transport can render for adapter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Password,
    Number,
    Bool,
}

/// One entry in an adapter's ordered configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    /// Field name, also the key in the stored credential bag.
    pub field: String,
    /// Widget kind for rendering.
    pub kind: FieldKind,
    /// Whether the adapter requires this field.
    pub required: bool,
    /// Help text shown next to the field.
    pub help: String,
}

impl ConfigField {
    /// Convenience constructor.
    pub fn new(field: &str, kind: FieldKind, required: bool, help: &str) -> Self {
        Self {
            field: field.to_string(),
            kind,
            required,
            help: help.to_string(),
        }
    }
}

// ── Per-call context ─────────────────────────────────────────────────

/// Source of per-user adapter credentials, implemented by the storage
/// layer. Adapters resolve configuration through this on every call.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch the decrypted credential bag for `(user_id, adapter)`.
    /// Returns an empty map when the user has not configured the adapter.
    async fn adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
    ) -> Result<HashMap<String, String>, StorageError>;
}

/// Per-call context handed to every adapter operation.
///
/// Carries the caller's identity and a handle for fetching credentials
/// fresh. Holding tenant state on the adapter itself is the defect this
/// design removes.
#[derive(Clone)]
pub struct AdapterCtx {
    /// The calling user.
    pub user_id: i64,
    /// Fresh credential lookup, keyed by the caller's user id.
    pub credentials: Arc<dyn CredentialSource>,
    /// Cooperative cancellation for in-flight calls.
    pub cancel: CancellationToken,
}

impl AdapterCtx {
    /// Resolve the caller's credential bag for `adapter`.
    pub async fn config(&self, adapter: &str) -> Result<HashMap<String, String>, AdapterError> {
        self.credentials
            .adapter_config(self.user_id, adapter)
            .await
            .map_err(|e| AdapterError::Auth {
                message: format!("credential lookup failed: {e}"),
            })
    }
}

// ── The adapter contract ─────────────────────────────────────────────

/// The dispatch contract for one external judge.
///
/// Adapters implement the methods matching their declared capability set
/// and leave the rest on the default bodies, which report
/// [`AdapterError::Unsupported`].
#[async_trait::async_trait]
pub trait JudgeAdapter: Send + Sync {
    /// Short machine name (registry key), e.g. `shsoj`.
    fn name(&self) -> &str;

    /// Human-readable name for transport surfaces.
    fn display_name(&self) -> &str;

    /// Adapter version string.
    fn version(&self) -> &str {
        "0.1.0"
    }

    /// The capability subset this adapter implements.
    fn capabilities(&self) -> &[Capability];

    /// Ordered configuration schema for transport rendering.
    fn config_schema(&self) -> Vec<ConfigField>;

    /// Public problem URL template. The default follows the common
    /// `{base_url}/d/{domain}/p/{real_id}` shape; adapters with other
    /// layouts override this.
    fn problem_url(&self, base_url: &str, domain: &str, real_id: &str) -> String {
        format!(
            "{}/d/{domain}/p/{real_id}",
            base_url.trim_end_matches('/')
        )
    }

    /// Fetch and normalize a problem statement.
    async fn fetch_problem(
        &self,
        _ctx: &AdapterCtx,
        _pid: &str,
    ) -> Result<Statement, AdapterError> {
        Err(self.unsupported(Capability::Fetch))
    }

    /// Create a problem on the judge from the workspace's statement and
    /// generated data.
    async fn upload_data(
        &self,
        _ctx: &AdapterCtx,
        _workspace: &Workspace,
    ) -> Result<UploadResponse, AdapterError> {
        Err(self.unsupported(Capability::Upload))
    }

    /// Find a problem by exact (whitespace-normalized) title.
    async fn search_by_title(
        &self,
        _ctx: &AdapterCtx,
        _title: &str,
    ) -> Result<Option<String>, AdapterError> {
        Err(self.unsupported(Capability::Upload))
    }

    /// Submit solution code for judging.
    async fn submit_solution(
        &self,
        _ctx: &AdapterCtx,
        _real_id: &str,
        _code: &str,
        _lang: &str,
    ) -> Result<SubmissionHandle, AdapterError> {
        Err(self.unsupported(Capability::Submit))
    }

    /// Poll the verdict of a prior submission.
    async fn judge_status(
        &self,
        _ctx: &AdapterCtx,
        _handle: &SubmissionHandle,
    ) -> Result<JudgeOutcome, AdapterError> {
        Err(self.unsupported(Capability::JudgeStatus))
    }

    /// Enumerate training problem ids.
    async fn list_training_ids(
        &self,
        _ctx: &AdapterCtx,
        _selector: &TrainingSelector,
    ) -> Result<Vec<String>, AdapterError> {
        Err(self.unsupported(Capability::ListTraining))
    }

    /// Provide a known reference solution, when the judge has one.
    async fn provide_solution(
        &self,
        _ctx: &AdapterCtx,
        _pid: &str,
    ) -> Result<Option<String>, AdapterError> {
        Err(self.unsupported(Capability::ProvideSolution))
    }
}

/// Helper for default bodies; not part of the dispatch contract.
trait UnsupportedExt {
    fn unsupported(&self, capability: Capability) -> AdapterError;
}

impl<T: JudgeAdapter + ?Sized> UnsupportedExt for T {
    fn unsupported(&self, capability: Capability) -> AdapterError {
        AdapterError::Unsupported {
            adapter: self.name().to_string(),
            capability: capability.as_str().to_string(),
        }
    }
}
