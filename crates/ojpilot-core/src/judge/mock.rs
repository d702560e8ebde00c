//! In-memory judge adapter for tests.
//!
//! Behaves like a tiny hosted judge: fetch serves a canned statement,
//! upload assigns incrementing real ids keyed by normalized title, and
//! judge status replays a scripted verdict sequence. Call counters let
//! tests assert the idempotent-skip and duplicate-detection properties.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::AdapterError;
use crate::workspace::Workspace;

use super::{
    normalize_title, AdapterCtx, Capability, ConfigField, FieldKind, JudgeAdapter, JudgeOutcome,
    Limits, Sample, Statement, SubmissionHandle, TrainingSelector, UploadResponse, Verdict,
};

const ALL_CAPABILITIES: &[Capability] = &[
    Capability::Fetch,
    Capability::Upload,
    Capability::Submit,
    Capability::JudgeStatus,
    Capability::BatchFetch,
    Capability::ListTraining,
    Capability::ProvideSolution,
];

/// A scriptable in-memory judge.
pub struct MockJudge {
    name: String,
    statement: Mutex<Option<Statement>>,
    uploaded: Mutex<HashMap<String, String>>,
    fetch_failures: Mutex<VecDeque<AdapterError>>,
    verdict_script: Mutex<VecDeque<Verdict>>,
    provided_solution: Mutex<Option<String>>,
    upload_returns_id: AtomicBool,
    next_real_id: AtomicU64,
    fetch_calls: AtomicU32,
    upload_calls: AtomicU32,
    search_calls: AtomicU32,
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
}

impl MockJudge {
    /// Create a mock judge with the given registry name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            statement: Mutex::new(None),
            uploaded: Mutex::new(HashMap::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            verdict_script: Mutex::new(VecDeque::new()),
            provided_solution: Mutex::new(None),
            upload_returns_id: AtomicBool::new(true),
            next_real_id: AtomicU64::new(100),
            fetch_calls: AtomicU32::new(0),
            upload_calls: AtomicU32::new(0),
            search_calls: AtomicU32::new(0),
            submit_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
        }
    }

    /// A minimal well-formed statement for tests.
    pub fn sample_statement(title: &str) -> Statement {
        Statement {
            title: title.to_string(),
            body: "Given two integers a and b, print a+b.".to_string(),
            input_format: "Two integers a and b.".to_string(),
            output_format: "One integer.".to_string(),
            samples: vec![Sample {
                input: "1 2\n".to_string(),
                output: "3\n".to_string(),
            }],
            limits: Limits::default(),
            tags: vec!["math".to_string()],
            notes: None,
            images: vec![],
        }
    }

    /// Serve this statement from `fetch_problem` instead of the default.
    pub fn set_statement(&self, statement: Statement) {
        *self.statement.lock().unwrap() = Some(statement);
    }

    /// Queue an error returned by the next `fetch_problem` call.
    pub fn push_fetch_failure(&self, error: AdapterError) {
        self.fetch_failures.lock().unwrap().push_back(error);
    }

    /// Script the verdict sequence replayed by `judge_status`. When the
    /// script runs dry, `Accepted` is reported.
    pub fn script_verdicts(&self, verdicts: impl IntoIterator<Item = Verdict>) {
        self.verdict_script.lock().unwrap().extend(verdicts);
    }

    /// Have `provide_solution` return this code.
    pub fn set_provided_solution(&self, code: &str) {
        *self.provided_solution.lock().unwrap() = Some(code.to_string());
    }

    /// Make `upload_data` respond without a real id (some judges answer
    /// 200 with a non-JSON body).
    pub fn withhold_upload_id(&self) {
        self.upload_returns_id.store(false, Ordering::SeqCst);
    }

    /// Pre-seed an already-uploaded problem by normalized title.
    pub fn seed_uploaded(&self, title: &str, real_id: &str) {
        self.uploaded
            .lock()
            .unwrap()
            .insert(normalize_title(title), real_id.to_string());
    }

    /// Number of `fetch_problem` calls so far.
    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `upload_data` calls so far.
    pub fn upload_calls(&self) -> u32 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Number of `search_by_title` calls so far.
    pub fn search_calls(&self) -> u32 {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Number of `submit_solution` calls so far.
    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl JudgeAdapter for MockJudge {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        "Mock Judge"
    }

    fn capabilities(&self) -> &[Capability] {
        ALL_CAPABILITIES
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("base_url", FieldKind::Text, true, "Judge base URL"),
            ConfigField::new("domain", FieldKind::Text, true, "Target domain"),
            ConfigField::new("username", FieldKind::Text, true, "Login name"),
            ConfigField::new("password", FieldKind::Password, true, "Login password"),
        ]
    }

    async fn fetch_problem(&self, ctx: &AdapterCtx, pid: &str) -> Result<Statement, AdapterError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        // Touch credentials the way a real adapter would.
        let _config = ctx.config(&self.name).await?;
        if let Some(error) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self
            .statement
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Self::sample_statement(&format!("Problem {pid}"))))
    }

    async fn upload_data(
        &self,
        ctx: &AdapterCtx,
        workspace: &Workspace,
    ) -> Result<UploadResponse, AdapterError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let _config = ctx.config(&self.name).await?;
        let statement = workspace
            .read_statement()
            .map_err(|e| AdapterError::BadData {
                message: format!("workspace has no statement: {e}"),
            })?;
        let real_id = self
            .next_real_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        self.uploaded
            .lock()
            .unwrap()
            .insert(normalize_title(&statement.title), real_id.clone());
        if self.upload_returns_id.load(Ordering::SeqCst) {
            Ok(UploadResponse {
                real_id: Some(real_id),
                extra: serde_json::json!({"status": "created"}),
            })
        } else {
            Ok(UploadResponse {
                real_id: None,
                extra: serde_json::Value::Null,
            })
        }
    }

    async fn search_by_title(
        &self,
        ctx: &AdapterCtx,
        title: &str,
    ) -> Result<Option<String>, AdapterError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let _config = ctx.config(&self.name).await?;
        Ok(self.uploaded.lock().unwrap().get(title).cloned())
    }

    async fn submit_solution(
        &self,
        ctx: &AdapterCtx,
        real_id: &str,
        _code: &str,
        _lang: &str,
    ) -> Result<SubmissionHandle, AdapterError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let _config = ctx.config(&self.name).await?;
        Ok(SubmissionHandle {
            id: format!("sub-{real_id}"),
        })
    }

    async fn judge_status(
        &self,
        _ctx: &AdapterCtx,
        _handle: &SubmissionHandle,
    ) -> Result<JudgeOutcome, AdapterError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let verdict = self
            .verdict_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Verdict::Accepted);
        Ok(JudgeOutcome {
            verdict,
            logs: None,
        })
    }

    async fn list_training_ids(
        &self,
        _ctx: &AdapterCtx,
        selector: &TrainingSelector,
    ) -> Result<Vec<String>, AdapterError> {
        Ok(match selector {
            TrainingSelector::Tag(tag) => vec![format!("{tag}-1"), format!("{tag}-2")],
            TrainingSelector::Range(lo, hi) => (*lo..=*hi).map(|n| n.to_string()).collect(),
        })
    }

    async fn provide_solution(
        &self,
        _ctx: &AdapterCtx,
        _pid: &str,
    ) -> Result<Option<String>, AdapterError> {
        Ok(self.provided_solution.lock().unwrap().clone())
    }
}
