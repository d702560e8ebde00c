//! Task service: batch intake, admission, aggregation, and the
//! operations a transport binds to its REST surface.
//!
//! The service validates a batch spec, persists the task envelope and
//! per-problem rows, spawns one runner per problem under the gates, and
//! is the only writer of task-level aggregate status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConcurrencyConfig;
use crate::error::{StorageError, WorkspaceError};
use crate::events::{EventKind, ProgressEvent};
use crate::judge::pid::{normalize, NormalizedPid, ProblemRef};
use crate::judge::registry::AdapterSummary;
use crate::judge::Capability;
use crate::llm::pool::TestReport;
use crate::llm::providers::{self, ProviderSpec};
use crate::pipeline::runner::{self, RunnerDeps};
use crate::pipeline::{Stage, StageSet};
use crate::storage::crypto::SecretKey;
use crate::storage::problems::ProblemRecord;
use crate::storage::tasks::TaskRecord;
use crate::storage::{activity_log, adapter_configs, problems, tasks, users};

// ── Errors ───────────────────────────────────────────────────────────

/// Errors from task service operations.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The batch spec is malformed.
    #[error("invalid task spec: {0}")]
    Validation(String),

    /// A referenced adapter is not registered.
    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),

    /// The task does not exist or belongs to another user.
    #[error("task not found")]
    NotFound,

    /// The caller lacks the required privilege.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The engine is draining and accepts no new work.
    #[error("engine is shutting down")]
    Draining,

    /// Database error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Workspace error.
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

// ── Spec and views ───────────────────────────────────────────────────

/// A user-submitted batch specification.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Raw problem references.
    pub problems: Vec<ProblemRef>,
    /// Enabled stages; empty means all four.
    pub stages: StageSet,
    /// Explicitly clear the upload-implies-solve rule.
    pub disable_solve: bool,
    /// Target adapter for Upload and Solve.
    pub target_adapter: String,
    /// LLM provider override for Generate and Solve.
    pub llm_provider: Option<String>,
}

impl TaskSpec {
    /// The effective stage set: enabling Upload implies Solve unless the
    /// caller explicitly cleared it.
    pub fn normalized_stages(&self) -> StageSet {
        let mut stages = if self.stages.is_empty() {
            StageSet::all()
        } else {
            self.stages
        };
        if stages.contains(Stage::Upload) && !stages.contains(Stage::Solve) && !self.disable_solve
        {
            stages.insert(Stage::Solve);
        }
        if self.disable_solve {
            stages.remove(Stage::Solve);
        }
        stages
    }
}

/// A task with its problem rows, as transports render it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskDetail {
    /// The task envelope.
    pub task: TaskRecord,
    /// Per-problem status rows.
    pub problems: Vec<ProblemRecord>,
}

/// Queue statistics across all problems.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// System-wide statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStats {
    pub tasks: TaskStats,
    pub users: UserStats,
}

/// Task status counts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub success: i64,
    pub running: i64,
    pub failed: i64,
    pub pending: i64,
}

/// User counts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserStats {
    pub total: i64,
    pub active: i64,
}

/// Merged provider view: the static spec plus runtime-editable row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderSummary {
    pub id: String,
    pub display_name: String,
    pub kind: String,
    pub api_url: String,
    pub model: String,
    pub user_selectable: bool,
    pub has_credentials: bool,
    /// Field names the transport renders, from the spec registry.
    pub credential_fields: Vec<String>,
}

struct TaskHandle {
    cancel: CancellationToken,
    /// Set right after the aggregator is spawned; `None` only in the
    /// brief window before that.
    aggregator: Option<JoinHandle<()>>,
}

// ── The service ──────────────────────────────────────────────────────

/// The batch intake and lifecycle facade.
pub struct TaskService {
    deps: RunnerDeps,
    key: SecretKey,
    shutdown: CancellationToken,
    draining: AtomicBool,
    running: Arc<Mutex<HashMap<String, TaskHandle>>>,
}

impl TaskService {
    /// Create the service over shared runner dependencies.
    pub fn new(deps: RunnerDeps, key: SecretKey) -> Self {
        Self {
            deps,
            key,
            shutdown: CancellationToken::new(),
            draining: AtomicBool::new(false),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ── Task lifecycle ───────────────────────────────────────────────

    /// Validate a batch spec, persist it, and admit every problem to the
    /// runner. Returns the new task id.
    pub async fn create_task(&self, user_id: i64, spec: TaskSpec) -> Result<String, TaskError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(TaskError::Draining);
        }
        if spec.problems.is_empty() {
            return Err(TaskError::Validation("no problems in batch".to_string()));
        }
        let stages = spec.normalized_stages();
        if stages.is_empty() {
            return Err(TaskError::Validation("no stages enabled".to_string()));
        }

        let target = self
            .deps
            .registry
            .get(&spec.target_adapter)
            .ok_or_else(|| TaskError::UnknownAdapter(spec.target_adapter.clone()))?;
        if stages.contains(Stage::Upload) && !target.capabilities().contains(&Capability::Upload) {
            return Err(TaskError::Validation(format!(
                "adapter '{}' cannot upload",
                spec.target_adapter
            )));
        }

        let mut pids: Vec<(String, NormalizedPid)> = Vec::with_capacity(spec.problems.len());
        for problem_ref in &spec.problems {
            let pid = normalize(problem_ref).ok_or_else(|| {
                TaskError::Validation(format!("unrecognized problem ref '{}'", problem_ref.raw))
            })?;
            if stages.contains(Stage::Fetch) && self.deps.registry.get(&pid.source_adapter).is_none()
            {
                return Err(TaskError::UnknownAdapter(pid.source_adapter));
            }
            pids.push((problem_ref.raw.clone(), pid));
        }

        let task_id = format!("t{:016x}", rand::thread_rng().gen::<u64>());
        tasks::insert(
            &self.deps.db,
            &task_id,
            user_id,
            &spec.target_adapter,
            spec.llm_provider.as_deref(),
            &stages.to_csv(),
        )
        .await?;
        let mut problem_ids = Vec::with_capacity(pids.len());
        for (raw, pid) in &pids {
            let id = problems::insert(
                &self.deps.db,
                &task_id,
                user_id,
                raw,
                &pid.source_adapter,
                &pid.short_id,
                &spec.target_adapter,
            )
            .await?;
            problem_ids.push(id);
        }

        let _ = activity_log::record(
            &self.deps.db,
            user_id,
            "task.created",
            &serde_json::json!({ "task_id": task_id, "problems": problem_ids.len() }),
        )
        .await;
        self.deps
            .bus
            .publish(ProgressEvent::now(EventKind::TaskCreated, &task_id));

        let task = tasks::get(&self.deps.db, user_id, &task_id)
            .await?
            .ok_or(TaskError::NotFound)?;
        self.spawn_runners(task, problem_ids).await;
        Ok(task_id)
    }

    /// Spawn one runner per problem plus an aggregator that settles the
    /// task-level status once every runner returns.
    async fn spawn_runners(&self, task: TaskRecord, problem_ids: Vec<i64>) {
        let cancel = self.shutdown.child_token();
        let mut handles = Vec::with_capacity(problem_ids.len());
        for problem_id in problem_ids {
            let deps = self.deps.clone();
            let task_clone = task.clone();
            let cancel_clone = cancel.clone();
            handles.push(tokio::spawn(async move {
                runner::run_problem(&deps, &task_clone, problem_id, cancel_clone).await;
            }));
        }

        let _ = tasks::update_status(&self.deps.db, &task.id, "running").await;
        self.deps
            .bus
            .publish(ProgressEvent::now(EventKind::TaskStarted, &task.id));

        // Register before spawning the aggregator so its removal always
        // finds the entry.
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                task.id.clone(),
                TaskHandle {
                    cancel,
                    aggregator: None,
                },
            );

        let deps = self.deps.clone();
        let running = Arc::clone(&self.running);
        let task_id = task.id.clone();
        let aggregator = tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            settle_task(&deps, &task_id).await;
            running
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&task_id);
        });

        let mut running = self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = running.get_mut(&task.id) {
            entry.aggregator = Some(aggregator);
        }
        // A missing entry means the aggregator already settled; the
        // finished handle needs no tracking.
    }

    /// Fetch one task with its problems.
    pub async fn get_task(&self, user_id: i64, task_id: &str) -> Result<TaskDetail, TaskError> {
        let task = tasks::get(&self.deps.db, user_id, task_id)
            .await?
            .ok_or(TaskError::NotFound)?;
        let problems = problems::list_by_task(&self.deps.db, task_id).await?;
        Ok(TaskDetail { task, problems })
    }

    /// List the user's tasks, newest first.
    pub async fn list_tasks(
        &self,
        user_id: i64,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(tasks::list(&self.deps.db, user_id, status, limit, offset).await?)
    }

    /// Cancel a running task. All its problems receive the signal.
    pub async fn cancel(&self, user_id: i64, task_id: &str) -> Result<(), TaskError> {
        tasks::get(&self.deps.db, user_id, task_id)
            .await?
            .ok_or(TaskError::NotFound)?;
        let handle = self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(task_id)
            .map(|h| h.cancel.clone());
        if let Some(cancel) = handle {
            cancel.cancel();
        }
        let _ = activity_log::record(
            &self.deps.db,
            user_id,
            "task.cancelled",
            &serde_json::json!({ "task_id": task_id }),
        )
        .await;
        Ok(())
    }

    /// Re-enter failed or cancelled problems at `stage` (`None` retries
    /// from Fetch). Workspace markers from the target stage forward are
    /// cleared; upload receipts are preserved except on an explicit
    /// Upload retry, and the idempotent title search reconciles them.
    pub async fn retry(
        &self,
        user_id: i64,
        task_id: &str,
        stage: Option<Stage>,
    ) -> Result<usize, TaskError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(TaskError::Draining);
        }
        let task = tasks::get(&self.deps.db, user_id, task_id)
            .await?
            .ok_or(TaskError::NotFound)?;

        let rows = problems::list_by_task(&self.deps.db, task_id).await?;
        let terminal_failed: Vec<&ProblemRecord> = rows
            .iter()
            .filter(|r| r.state.starts_with("failed_") || r.state == "cancelled")
            .collect();
        for record in &terminal_failed {
            let pid = NormalizedPid {
                source_adapter: record.source_adapter.clone(),
                short_id: record.short_id.clone(),
            };
            let workspace = self
                .deps
                .store
                .open_or_create(record.user_id, &pid.workspace_key());
            match stage {
                None | Some(Stage::Fetch) => {
                    workspace.clear_statement()?;
                    workspace.clear_generated()?;
                    workspace.clear_solve_marker()?;
                }
                Some(Stage::Generate) => {
                    workspace.clear_generated()?;
                    workspace.clear_solve_marker()?;
                }
                Some(Stage::Upload) => {
                    workspace.clear_upload_receipt()?;
                    workspace.clear_solve_marker()?;
                }
                Some(Stage::Solve) => {
                    workspace.clear_solve_marker()?;
                }
            }
        }

        let reset_ids = problems::reset_for_retry(&self.deps.db, task_id).await?;
        if reset_ids.is_empty() {
            return Ok(0);
        }
        let _ = activity_log::record(
            &self.deps.db,
            user_id,
            "task.retried",
            &serde_json::json!({
                "task_id": task_id,
                "stage": stage.map(Stage::as_str),
                "problems": reset_ids.len(),
            }),
        )
        .await;
        let count = reset_ids.len();
        self.spawn_runners(task, reset_ids).await;
        Ok(count)
    }

    /// Delete a task and its problem rows. Workspaces stay on disk;
    /// removing them is a separate, explicit user action.
    pub async fn delete(&self, user_id: i64, task_id: &str) -> Result<(), TaskError> {
        let _ = self.cancel(user_id, task_id).await;
        if !tasks::delete(&self.deps.db, user_id, task_id).await? {
            return Err(TaskError::NotFound);
        }
        let _ = activity_log::record(
            &self.deps.db,
            user_id,
            "task.deleted",
            &serde_json::json!({ "task_id": task_id }),
        )
        .await;
        Ok(())
    }

    /// Zip every workspace of the task into one archive, each problem
    /// under its short-id directory.
    pub async fn download_workspace(
        &self,
        user_id: i64,
        task_id: &str,
    ) -> Result<Vec<u8>, TaskError> {
        let detail = self.get_task(user_id, task_id).await?;

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .unix_permissions(0o644);
            for record in &detail.problems {
                let pid = NormalizedPid {
                    source_adapter: record.source_adapter.clone(),
                    short_id: record.short_id.clone(),
                };
                let workspace = self
                    .deps
                    .store
                    .open_or_create(record.user_id, &pid.workspace_key());
                for rel in workspace.file_manifest() {
                    let name = format!("{}/{}", pid.workspace_key(), rel.to_string_lossy())
                        .replace('\\', "/");
                    writer
                        .start_file(name, options)
                        .map_err(|e| WorkspaceError::Archive {
                            message: e.to_string(),
                        })?;
                    let bytes = workspace.read_file(&rel)?;
                    std::io::Write::write_all(&mut writer, &bytes).map_err(|e| {
                        WorkspaceError::Archive {
                            message: e.to_string(),
                        }
                    })?;
                }
            }
            writer.finish().map_err(|e| WorkspaceError::Archive {
                message: e.to_string(),
            })?;
        }
        Ok(cursor.into_inner())
    }

    // ── Adapter and provider surfaces ────────────────────────────────

    /// Registered adapter summaries, including config schemas.
    pub fn list_adapters(&self) -> Vec<AdapterSummary> {
        self.deps.registry.summaries()
    }

    /// Save a user's adapter credential bag.
    pub async fn save_adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), TaskError> {
        self.deps
            .registry
            .get(adapter)
            .ok_or_else(|| TaskError::UnknownAdapter(adapter.to_string()))?;
        adapter_configs::save_config(&self.deps.db, &self.key, user_id, adapter, fields).await?;
        let _ = activity_log::record(
            &self.deps.db,
            user_id,
            "adapter.configured",
            &serde_json::json!({ "adapter": adapter }),
        )
        .await;
        Ok(())
    }

    /// Provider rows merged with their spec-declared credential fields.
    pub async fn list_providers(&self) -> Result<Vec<ProviderSummary>, TaskError> {
        let rows = crate::storage::providers::list(&self.deps.db).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let fields = providers::spec(&row.id)
                    .map(|s: &ProviderSpec| {
                        s.credential_fields.iter().map(|f| (*f).to_string()).collect()
                    })
                    .unwrap_or_default();
                ProviderSummary {
                    id: row.id,
                    display_name: row.display_name,
                    kind: row.kind,
                    api_url: row.api_url,
                    model: row.model,
                    user_selectable: row.user_selectable,
                    has_credentials: row.has_credentials,
                    credential_fields: fields,
                }
            })
            .collect())
    }

    /// Update a provider (admin only) and invalidate its cached client.
    pub async fn save_provider(
        &self,
        user_id: i64,
        provider_id: &str,
        api_url: Option<&str>,
        model: Option<&str>,
        credentials: Option<&HashMap<String, String>>,
    ) -> Result<(), TaskError> {
        let user = users::find_by_id(&self.deps.db, user_id)
            .await?
            .ok_or(TaskError::NotFound)?;
        if !user.is_admin {
            return Err(TaskError::Forbidden(
                "provider editing requires admin".to_string(),
            ));
        }
        crate::storage::providers::save(
            &self.deps.db,
            &self.key,
            provider_id,
            api_url,
            model,
            credentials,
        )
        .await?;
        self.deps.llm.invalidate(provider_id).await;
        let _ = activity_log::record(
            &self.deps.db,
            user_id,
            "provider.updated",
            &serde_json::json!({ "provider": provider_id }),
        )
        .await;
        Ok(())
    }

    /// Health-check a provider; see [`crate::llm::pool::LlmPool::test`].
    pub async fn test_provider(&self, provider_id: &str, full: bool) -> TestReport {
        self.deps.llm.test(provider_id, full).await
    }

    // ── Concurrency surface ──────────────────────────────────────────

    /// Current gate limits.
    pub fn concurrency_get(&self) -> ConcurrencyConfig {
        let mut snapshot = self.deps.gates.snapshot();
        snapshot.task_timeout_secs = self.deps.config.concurrency.task_timeout_secs;
        snapshot
    }

    /// Rebase every gate from a new configuration.
    pub fn concurrency_set(&self, config: &ConcurrencyConfig) {
        self.deps.gates.apply(config);
    }

    /// Apply a named preset (`conservative`, `default`, `aggressive`).
    pub fn apply_preset(&self, name: &str) -> Result<(), TaskError> {
        let config = ConcurrencyConfig::preset(name)
            .ok_or_else(|| TaskError::Validation(format!("unknown preset '{name}'")))?;
        self.deps.gates.apply(&config);
        Ok(())
    }

    /// Queue statistics across all problems.
    pub async fn queue_stats(&self) -> Result<QueueStats, TaskError> {
        let (pending, running, completed, failed) =
            problems::queue_counts(&self.deps.db).await?;
        Ok(QueueStats {
            pending,
            running,
            completed,
            failed,
            total: pending + running + completed + failed,
        })
    }

    /// System-wide statistics.
    pub async fn system_stats(&self) -> Result<SystemStats, TaskError> {
        let (total, success, running, failed, pending) =
            tasks::status_counts(&self.deps.db).await?;
        let (user_total, user_active) = users::counts(&self.deps.db).await?;
        Ok(SystemStats {
            tasks: TaskStats {
                total,
                success,
                running,
                failed,
                pending,
            },
            users: UserStats {
                total: user_total,
                active: user_active,
            },
        })
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Graceful drain: no new admissions, cancel in-flight problems, and
    /// wait for runners to persist their state.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating graceful drain");
        self.draining.store(true, Ordering::SeqCst);
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut running = self
                .running
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            running.drain().filter_map(|(_, h)| h.aggregator).collect()
        };
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
            tracing::warn!("Drain timeout exceeded (30s), some runners may still be live");
        } else {
            tracing::info!("Graceful drain complete");
        }
    }
}

/// Recompute the aggregate status once all runners have returned.
async fn settle_task(deps: &RunnerDeps, task_id: &str) {
    let Ok(rows) = problems::list_by_task(&deps.db, task_id).await else {
        return;
    };
    let any_nonterminal = rows.iter().any(|r| !r.is_terminal());
    if any_nonterminal {
        // Runners persisted a non-terminal state on the way out (e.g. a
        // rejected claim); leave the task running for a later retry.
        return;
    }
    let all_completed = rows.iter().all(|r| r.state == "completed");
    let any_completed = rows.iter().any(|r| r.state == "completed");
    let any_cancelled = rows.iter().any(|r| r.state == "cancelled");

    let status = if all_completed {
        "completed"
    } else if any_cancelled && !any_completed {
        "cancelled"
    } else {
        "failed"
    };
    let _ = tasks::update_status(&deps.db, task_id, status).await;
    let kind = if status == "completed" {
        EventKind::TaskCompleted
    } else {
        EventKind::TaskFailed
    };
    deps.bus.publish(
        ProgressEvent::now(kind, task_id)
            .status(status)
            .payload(serde_json::json!({ "problems": rows.len() })),
    );
}

#[cfg(test)]
mod tests;
