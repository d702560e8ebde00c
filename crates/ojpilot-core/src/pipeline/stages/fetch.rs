//! Fetch stage: pull the statement from the source judge and persist it.

use crate::pipeline::{ProblemCtx, Stage, StageError};

/// Fetch the problem from the source adapter, write the samples, then
/// the canonical statement. The statement file lands last so the skip
/// oracle never observes a half-fetched workspace.
pub async fn run(ctx: &ProblemCtx) -> Result<(), StageError> {
    ctx.check_cancelled()?;
    ctx.log(Stage::Fetch, &format!("fetching {} from {}", ctx.pid, ctx.source.name()));

    let adapter_ctx = ctx.adapter_ctx();
    let statement = ctx
        .source
        .fetch_problem(&adapter_ctx, ctx.pid.display())
        .await?;
    ctx.check_cancelled()?;

    for (index, sample) in statement.samples.iter().enumerate() {
        ctx.workspace
            .write_sample(index + 1, &sample.input, &sample.output)?;
    }
    ctx.workspace.write_statement(&statement)?;

    ctx.log(
        Stage::Fetch,
        &format!(
            "fetched '{}' ({} samples)",
            statement.title,
            statement.samples.len()
        ),
    );
    ctx.emit_progress(Stage::Fetch, "done", &statement.title);
    Ok(())
}
