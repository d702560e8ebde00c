//! Per-problem pipeline runner.
//!
//! Drives one problem through `pending → fetching → generating →
//! uploading → solving → completed`, applying the skip oracle before
//! each stage, bounded retries with jittered backoff for retryable
//! errors, the per-problem wall-clock budget, and cooperative
//! cancellation. Gates are acquired in the fixed order queue → global →
//! per-user → stage, with LLM gates nested inside the pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryConfig};
use crate::error::GateError;
use crate::events::{EventBus, EventKind, ProgressEvent};
use crate::gate::{GateSet, GLOBAL_TASKS, QUEUE};
use crate::judge::pid::NormalizedPid;
use crate::judge::registry::AdapterRegistry;
use crate::judge::CredentialSource;
use crate::llm::pool::LlmPool;
use crate::storage::tasks::TaskRecord;
use crate::storage::{problems, DbPool};
use crate::workspace::WorkspaceStore;

use super::stages::{fetch, generate, solve, upload};
use super::{ErrorKind, ProblemCtx, ProblemState, Stage, StageError, StageSet};

/// Shared dependencies for problem runners.
#[derive(Clone)]
pub struct RunnerDeps {
    /// Persistence handle.
    pub db: DbPool,
    /// Engine configuration.
    pub config: Arc<Config>,
    /// The concurrency gates.
    pub gates: Arc<GateSet>,
    /// Pooled LLM access.
    pub llm: Arc<LlmPool>,
    /// Registered judge adapters.
    pub registry: Arc<AdapterRegistry>,
    /// The workspace store.
    pub store: WorkspaceStore,
    /// Progress fan-out.
    pub bus: EventBus,
    /// Fresh credential lookup for adapter calls.
    pub credentials: Arc<dyn CredentialSource>,
}

/// Run one problem to a terminal state and return it.
pub async fn run_problem(
    deps: &RunnerDeps,
    task: &TaskRecord,
    problem_id: i64,
    cancel: CancellationToken,
) -> ProblemState {
    let worker = format!("w-{problem_id}-{:08x}", rand::thread_rng().gen::<u32>());

    let Ok(Some(problem)) = problems::get(&deps.db, problem_id).await else {
        tracing::warn!(problem_id, "problem row vanished before admission");
        return ProblemState::Cancelled;
    };
    match problems::claim(&deps.db, problem_id, &worker).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(problem_id, "problem already owned by another runner");
            return ProblemState::Pending;
        }
        Err(e) => {
            tracing::error!(problem_id, error = %e, "claim failed");
            return ProblemState::Pending;
        }
    }

    // Admission: hold a queue slot while waiting for global and per-user
    // capacity, then let it go.
    let admitted = async {
        let queue_permit = deps.gates.acquire(QUEUE, &cancel).await?;
        let global_permit = deps.gates.acquire(GLOBAL_TASKS, &cancel).await?;
        let user_permit = deps.gates.acquire_user(problem.user_id, &cancel).await?;
        drop(queue_permit);
        Ok::<_, GateError>((global_permit, user_permit))
    }
    .await;
    let (_global_permit, _user_permit) = match admitted {
        Ok(permits) => permits,
        Err(GateError::Cancelled { .. }) => {
            return finish_cancelled(deps, &problem, &worker).await;
        }
        Err(e) => {
            tracing::error!(problem_id, error = %e, "admission failed");
            return fail_terminal(
                deps,
                &problem,
                &worker,
                Stage::Fetch,
                &StageError::new(ErrorKind::Internal, e.to_string()),
            )
            .await;
        }
    };

    let enabled = StageSet::parse_csv(&task.stages).unwrap_or_else(StageSet::all);
    let pid = NormalizedPid {
        source_adapter: problem.source_adapter.clone(),
        short_id: problem.short_id.clone(),
    };
    let first_enabled = enabled.iter().next().unwrap_or(Stage::Fetch);

    let (source, target) = match (
        deps.registry.get(&problem.source_adapter),
        deps.registry.get(&problem.target_adapter),
    ) {
        (Some(source), Some(target)) => (source, target),
        _ => {
            let error = StageError::new(
                ErrorKind::Internal,
                format!(
                    "unknown adapter: source '{}' or target '{}'",
                    problem.source_adapter, problem.target_adapter
                ),
            );
            return fail_terminal(deps, &problem, &worker, first_enabled, &error).await;
        }
    };

    let workspace = deps
        .store
        .open_or_create(problem.user_id, &pid.workspace_key());
    let ctx = ProblemCtx {
        user_id: problem.user_id,
        task_id: task.id.clone(),
        problem_id,
        pid,
        source,
        target,
        workspace,
        llm: Arc::clone(&deps.llm),
        llm_provider: task.llm_provider.clone(),
        gates: Arc::clone(&deps.gates),
        db: deps.db.clone(),
        credentials: Arc::clone(&deps.credentials),
        cancel: cancel.clone(),
        bus: deps.bus.clone(),
        config: Arc::clone(&deps.config),
    };

    let deadline =
        Instant::now() + Duration::from_secs(deps.config.concurrency.task_timeout_secs);
    let mut real_id = problem.real_id.clone();

    for stage in enabled.iter() {
        // Skip oracle, evaluated fresh from disk before each stage.
        match stage_skip(&ctx, stage, &mut real_id).await {
            Ok(true) => {
                ctx.log(stage, "skipped: workspace already satisfied");
                ctx.emit_progress(stage, "skipped", "cached");
                if stage == Stage::Upload {
                    persist_upload(deps, &ctx, &worker, real_id.as_deref()).await;
                }
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                return fail_terminal(deps, &problem, &worker, stage, &e).await;
            }
        }

        if !persist_state(deps, problem_id, &worker, ProblemState::running(stage)).await {
            return ProblemState::Pending;
        }
        ctx.emit_progress(stage, "running", "started");

        match execute_with_retries(deps, &ctx, &worker, stage, deadline, &mut real_id).await {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::Cancelled => {
                return finish_cancelled(deps, &problem, &worker).await;
            }
            Err(e) => {
                return fail_terminal(deps, &problem, &worker, stage, &e).await;
            }
        }
    }

    if !persist_state(deps, problem_id, &worker, ProblemState::Completed).await {
        return ProblemState::Pending;
    }
    deps.bus.publish(
        ProgressEvent::now(EventKind::TaskProblemCompleted, &task.id)
            .problem(problem_id)
            .status("completed"),
    );
    let _ = problems::release(&deps.db, problem_id, &worker).await;
    ProblemState::Completed
}

/// Evaluate the skip oracle for one stage. For Upload, a matching
/// receipt also resolves the real id.
async fn stage_skip(
    ctx: &ProblemCtx,
    stage: Stage,
    real_id: &mut Option<String>,
) -> Result<bool, StageError> {
    match stage {
        Stage::Fetch => Ok(ctx.workspace.has_statement()),
        Stage::Generate => Ok(ctx.workspace.has_generated_data()),
        Stage::Upload => {
            if let Some(receipt) = ctx.workspace.get_upload_receipt(ctx.target.name())? {
                *real_id = Some(receipt.real_id);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Stage::Solve => Ok(ctx.workspace.has_accepted_solve(ctx.target.name())),
    }
}

/// Execute one stage with the bounded retry policy.
async fn execute_with_retries(
    deps: &RunnerDeps,
    ctx: &ProblemCtx,
    worker: &str,
    stage: Stage,
    deadline: Instant,
    real_id: &mut Option<String>,
) -> Result<(), StageError> {
    let retry = &deps.config.retry;
    let mut attempt = 1u32;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StageError::new(
                ErrorKind::Timeout,
                "per-problem wall-clock budget exhausted",
            ));
        }

        // The stage permit is held only for the execution itself, never
        // across the backoff sleep.
        let result = {
            let _stage_permit = deps.gates.acquire(stage.gate_name(), &ctx.cancel).await?;
            tokio::time::timeout(remaining, run_stage(ctx, worker, deps, stage, real_id))
                .await
                .unwrap_or_else(|_| {
                    Err(StageError::new(
                        ErrorKind::Timeout,
                        "per-problem wall-clock budget exhausted",
                    ))
                })
        };

        let error = match result {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        if error.kind == ErrorKind::Cancelled {
            return Err(error);
        }
        let _ = problems::set_retry_count(&deps.db, ctx.problem_id, stage.as_str(), attempt).await;

        if !error.is_retryable() {
            return Err(error);
        }
        if attempt >= retry.max_attempts {
            return Err(StageError::new(
                ErrorKind::StageExhausted(stage),
                format!("{} attempts exhausted, last: {}", retry.max_attempts, error.message),
            ));
        }

        let delay = backoff_delay(retry, attempt);
        ctx.log(
            stage,
            &format!("attempt {attempt} failed ({error}), retrying in {delay:?}"),
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.cancel.cancelled() => {
                return Err(StageError::new(ErrorKind::Cancelled, "cancelled"));
            }
        }
        attempt += 1;
    }
}

/// Dispatch to the stage executor.
async fn run_stage(
    ctx: &ProblemCtx,
    worker: &str,
    deps: &RunnerDeps,
    stage: Stage,
    real_id: &mut Option<String>,
) -> Result<(), StageError> {
    match stage {
        Stage::Fetch => fetch::run(ctx).await,
        Stage::Generate => {
            let outcome = generate::run(ctx).await?;
            if let Some(warning) = outcome.warning {
                ctx.emit_progress(stage, "warning", &warning);
            }
            Ok(())
        }
        Stage::Upload => {
            let outcome = upload::run(ctx).await?;
            *real_id = Some(outcome.real_id);
            persist_upload(deps, ctx, worker, real_id.as_deref()).await;
            Ok(())
        }
        Stage::Solve => {
            let id = match real_id {
                Some(id) => id.clone(),
                None => ctx
                    .workspace
                    .get_upload_receipt(ctx.target.name())?
                    .map(|receipt| receipt.real_id)
                    .ok_or_else(|| {
                        StageError::new(
                            ErrorKind::Internal,
                            "solve requires a known target problem id",
                        )
                    })?,
            };
            solve::run(ctx, &id).await.map(|_| ())
        }
    }
}

/// Persist the upload result on the problem row. The workspace receipt
/// is already on disk, so the row may trail but never lead it.
async fn persist_upload(deps: &RunnerDeps, ctx: &ProblemCtx, worker: &str, real_id: Option<&str>) {
    let Some(real_id) = real_id else { return };
    let Ok(Some(receipt)) = ctx.workspace.get_upload_receipt(ctx.target.name()) else {
        return;
    };
    if let Err(e) =
        problems::set_upload_result(&deps.db, ctx.problem_id, worker, real_id, &receipt.url).await
    {
        tracing::warn!(problem_id = ctx.problem_id, error = %e, "failed to persist upload result");
    }
}

async fn persist_state(
    deps: &RunnerDeps,
    problem_id: i64,
    worker: &str,
    state: ProblemState,
) -> bool {
    match problems::update_state(&deps.db, problem_id, worker, &state.as_str()).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(problem_id, error = %e, "state update rejected");
            false
        }
    }
}

async fn finish_cancelled(
    deps: &RunnerDeps,
    problem: &problems::ProblemRecord,
    worker: &str,
) -> ProblemState {
    let _ = problems::set_error(
        &deps.db,
        problem.id,
        worker,
        &ProblemState::Cancelled.as_str(),
        &ErrorKind::Cancelled.code(),
        "cancelled",
    )
    .await;
    deps.bus.publish(
        ProgressEvent::now(EventKind::TaskProblemCompleted, &problem.task_id)
            .problem(problem.id)
            .status("cancelled"),
    );
    let _ = problems::release(&deps.db, problem.id, worker).await;
    ProblemState::Cancelled
}

async fn fail_terminal(
    deps: &RunnerDeps,
    problem: &problems::ProblemRecord,
    worker: &str,
    stage: Stage,
    error: &StageError,
) -> ProblemState {
    let state = ProblemState::Failed(stage);
    tracing::warn!(
        problem_id = problem.id,
        stage = stage.as_str(),
        kind = %error.kind.code(),
        "problem failed: {}",
        error.message,
    );
    let _ = problems::set_error(
        &deps.db,
        problem.id,
        worker,
        &state.as_str(),
        &error.kind.code(),
        &error.message,
    )
    .await;
    deps.bus.publish(
        ProgressEvent::now(EventKind::TaskProblemCompleted, &problem.task_id)
            .problem(problem.id)
            .status(&state.as_str())
            .payload(serde_json::json!({
                "kind": error.kind.code(),
                "message": error.message,
            })),
    );
    let _ = problems::release(&deps.db, problem.id, worker).await;
    state
}

/// Exponential backoff with jitter: `base * 2^(attempt-1) ± 250ms`,
/// capped by the configured maximum.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry
        .base_delay_ms
        .saturating_mul(1u64 << (attempt - 1).min(16));
    let capped = exp.min(retry.max_delay_ms);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(capped.saturating_add(jitter))
}
