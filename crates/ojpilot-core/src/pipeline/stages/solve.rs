//! Solve stage: obtain a reference solution, submit it to the target
//! judge, and poll for a verdict.
//!
//! Solution sources are tried in order, short-circuiting on the first
//! hit: the workspace, the adapter's own solution store, then the LLM
//! solution endpoint.

use std::time::Duration;

use super::extract_code_block;
use crate::judge::{Capability, Verdict};
use crate::llm::pool::LlmEndpoint;
use crate::llm::GenerationParams;
use crate::pipeline::{ErrorKind, ProblemCtx, Stage, StageError};
use crate::workspace::SolveMarker;

const SOLUTION_SYSTEM: &str = "You write correct, efficient C++17 solutions for \
competitive programming problems. Reply with a single code block containing the \
complete program.";

/// Result of a completed Solve stage.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// The terminal verdict (always `Accepted` on success).
    pub verdict: Verdict,
    /// The submission id on the target judge.
    pub submission_id: String,
}

/// Run the Solve stage against a known target `real_id`.
pub async fn run(ctx: &ProblemCtx, real_id: &str) -> Result<SolveOutcome, StageError> {
    ctx.check_cancelled()?;
    let (code, lang) = obtain_solution(ctx).await?;

    ctx.log(
        Stage::Solve,
        &format!("submitting {lang} solution to {} problem {real_id}", ctx.target.name()),
    );
    let adapter_ctx = ctx.adapter_ctx();
    let handle = ctx
        .target
        .submit_solution(&adapter_ctx, real_id, &code, &lang)
        .await?;

    // Poll with bounded backoff until a terminal verdict or the stage
    // budget runs out.
    let deadline =
        std::time::Instant::now() + Duration::from_secs(ctx.config.solve.judge_poll_timeout_secs);
    let mut delay = Duration::from_secs(1);
    loop {
        ctx.check_cancelled()?;
        let outcome = ctx.target.judge_status(&adapter_ctx, &handle).await?;
        if outcome.verdict.is_terminal() {
            ctx.workspace.put_solve_marker(&SolveMarker {
                adapter: ctx.target.name().to_string(),
                real_id: real_id.to_string(),
                submission_id: handle.id.clone(),
                verdict: outcome.verdict,
                checked_at: chrono::Utc::now().to_rfc3339(),
            })?;
            return finish(ctx, outcome.verdict, handle.id, outcome.logs);
        }

        if std::time::Instant::now() + delay > deadline {
            return Err(StageError::new(
                ErrorKind::Timeout,
                format!(
                    "no terminal verdict within {}s",
                    ctx.config.solve.judge_poll_timeout_secs
                ),
            ));
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.cancel.cancelled() => {
                return Err(StageError::new(ErrorKind::Cancelled, "cancelled"));
            }
        }
        delay = (delay * 2).min(Duration::from_secs(10));
    }
}

/// Resolve the reference solution code and language tag.
async fn obtain_solution(ctx: &ProblemCtx) -> Result<(String, String), StageError> {
    // (i) Already in the workspace.
    if let Some((code, ext)) = ctx.workspace.read_solution()? {
        ctx.log(Stage::Solve, "using workspace solution");
        return Ok((code, lang_for_ext(&ext, ctx)));
    }

    // (ii) The adapter can provide one.
    if ctx
        .source
        .capabilities()
        .contains(&Capability::ProvideSolution)
    {
        let adapter_ctx = ctx.adapter_ctx();
        if let Some(code) = ctx
            .source
            .provide_solution(&adapter_ctx, ctx.pid.display())
            .await?
        {
            ctx.log(Stage::Solve, "using adapter-provided solution");
            ctx.workspace.put_solution(&code, "cpp")?;
            return Ok((code, ctx.config.solve.language.clone()));
        }
    }

    // (iii) Ask the solution endpoint.
    ctx.check_cancelled()?;
    let statement = ctx.workspace.read_statement().map_err(|e| {
        StageError::new(
            ErrorKind::Internal,
            format!("solve requires a fetched statement: {e}"),
        )
    })?;
    let prompt = format!(
        "Problem: {}\n\n{}\n\nInput format:\n{}\n\nOutput format:\n{}\n\nWrite the solution now.",
        statement.title, statement.body, statement.input_format, statement.output_format
    );
    let outcome = ctx
        .llm
        .call(
            LlmEndpoint::Solution,
            ctx.llm_provider.as_deref(),
            SOLUTION_SYSTEM,
            &prompt,
            &GenerationParams::default(),
            &ctx.cancel,
        )
        .await?;
    let code = extract_code_block(&outcome.text);
    if code.is_empty() {
        return Err(StageError::new(
            ErrorKind::Parse,
            "solution endpoint returned no code",
        ));
    }
    ctx.log(
        Stage::Solve,
        &format!("solution produced by {} in {}ms", outcome.provider, outcome.latency_ms),
    );
    ctx.workspace.put_solution(&code, "cpp")?;
    Ok((code, ctx.config.solve.language.clone()))
}

fn lang_for_ext(ext: &str, ctx: &ProblemCtx) -> String {
    match ext {
        "py" => "python".to_string(),
        "cpp" | "cc" | "cxx" => ctx.config.solve.language.clone(),
        other => other.to_string(),
    }
}

/// Map the terminal verdict to the stage result, preserving the verdict
/// in the error payload for non-accepted outcomes.
fn finish(
    ctx: &ProblemCtx,
    verdict: Verdict,
    submission_id: String,
    logs: Option<String>,
) -> Result<SolveOutcome, StageError> {
    let log_tail = logs.unwrap_or_default();
    match verdict {
        Verdict::Accepted => {
            ctx.log(Stage::Solve, &format!("accepted as submission {submission_id}"));
            ctx.emit_progress(Stage::Solve, "done", "accepted");
            Ok(SolveOutcome {
                verdict,
                submission_id,
            })
        }
        Verdict::WrongAnswer => Err(StageError::new(
            ErrorKind::SolveWrongAnswer,
            format!("wrong answer on submission {submission_id} {log_tail}").trim().to_string(),
        )),
        Verdict::RuntimeError | Verdict::TimeLimit | Verdict::MemoryLimit => {
            Err(StageError::new(
                ErrorKind::SolveRuntime,
                format!("{verdict:?} on submission {submission_id} {log_tail}")
                    .trim()
                    .to_string(),
            ))
        }
        Verdict::CompileError => Err(StageError::new(
            ErrorKind::SolveCompile,
            format!("compile error on submission {submission_id} {log_tail}")
                .trim()
                .to_string(),
        )),
        Verdict::Pending => Err(StageError::new(
            ErrorKind::Internal,
            "judge reported pending as terminal",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::e2e_tests::harness::TestHarness;

    #[tokio::test]
    async fn workspace_solution_short_circuits() {
        let harness = TestHarness::new().await;
        let ctx = harness.ctx("1001").await;
        harness.seed_statement(&ctx);
        ctx.workspace.put_solution("int main() {}", "cpp").expect("solution");

        let outcome = super::run(&ctx, "100").await.expect("solve");
        assert_eq!(outcome.verdict, Verdict::Accepted);
        assert!(ctx.workspace.has_accepted_solve("mock"));
        assert_eq!(harness.judge.submit_calls(), 1);
    }

    #[tokio::test]
    async fn adapter_provided_solution_is_stored() {
        let harness = TestHarness::new().await;
        let ctx = harness.ctx("1001").await;
        harness.seed_statement(&ctx);
        harness.judge.set_provided_solution("int main() { return 0; }");

        super::run(&ctx, "100").await.expect("solve");
        let (code, ext) = ctx.workspace.read_solution().expect("read").expect("some");
        assert!(code.contains("int main"));
        assert_eq!(ext, "cpp");
    }

    #[tokio::test]
    async fn llm_fallback_produces_solution() {
        let harness = TestHarness::new().await;
        let ctx = harness.ctx("1001").await;
        harness.seed_statement(&ctx);
        harness
            .respond_solution("```cpp\n#include <iostream>\nint main() { return 0; }\n```")
            .await;

        super::run(&ctx, "100").await.expect("solve");
        let (code, _) = ctx.workspace.read_solution().expect("read").expect("some");
        assert!(code.contains("#include <iostream>"));
    }

    #[tokio::test]
    async fn wrong_answer_fails_with_verdict_kind() {
        let harness = TestHarness::new().await;
        let ctx = harness.ctx("1001").await;
        harness.seed_statement(&ctx);
        ctx.workspace.put_solution("int main() {}", "cpp").expect("solution");
        harness.judge.script_verdicts([Verdict::WrongAnswer]);

        let err = super::run(&ctx, "100").await.unwrap_err();
        assert_eq!(err.kind, crate::pipeline::ErrorKind::SolveWrongAnswer);
        // The marker records the non-accepted verdict, so the skip
        // oracle stays unsatisfied.
        assert!(!ctx.workspace.has_accepted_solve("mock"));
    }

    #[tokio::test]
    async fn pending_then_accepted_polls_through() {
        let harness = TestHarness::new().await;
        let ctx = harness.ctx("1001").await;
        harness.seed_statement(&ctx);
        ctx.workspace.put_solution("int main() {}", "cpp").expect("solution");
        harness.judge.script_verdicts([Verdict::Pending, Verdict::Accepted]);

        tokio::time::pause();
        let outcome = super::run(&ctx, "100").await.expect("solve");
        assert_eq!(outcome.verdict, Verdict::Accepted);
    }
}
