//! Upload stage: create the problem on the target judge, guarded by an
//! idempotent exact-title search.
//!
//! Before any write reaches the target, the stage searches by the
//! whitespace-normalized title; a hit completes the stage with the
//! existing id and no new problem is created. When the upload response
//! carries no id (some judges answer 200 with a non-JSON body), the
//! stage falls back to a second title search, then to any prior receipt
//! for the same workspace and adapter.

use crate::judge::{normalize_title, UploadReceipt};
use crate::pipeline::{ErrorKind, ProblemCtx, Stage, StageError};

/// Result of a completed Upload stage.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// The id the target judge knows the problem by.
    pub real_id: String,
    /// Public URL of the problem.
    pub url: String,
    /// True when the title search satisfied the stage without an upload.
    pub deduplicated: bool,
}

/// Run the Upload stage.
pub async fn run(ctx: &ProblemCtx) -> Result<UploadOutcome, StageError> {
    ctx.check_cancelled()?;
    let statement = ctx.workspace.read_statement().map_err(|e| {
        StageError::new(
            ErrorKind::Internal,
            format!("upload requires a fetched statement: {e}"),
        )
    })?;
    let title = normalize_title(&statement.title);
    let adapter_ctx = ctx.adapter_ctx();

    // Idempotent guard: never create a second problem for the same title.
    if let Some(real_id) = ctx.target.search_by_title(&adapter_ctx, &title).await? {
        ctx.log(
            Stage::Upload,
            &format!("title already on {} as {real_id}, skipping upload", ctx.target.name()),
        );
        let outcome = persist_receipt(ctx, real_id, true).await?;
        return Ok(outcome);
    }

    ctx.check_cancelled()?;
    ctx.log(Stage::Upload, &format!("uploading to {}", ctx.target.name()));
    let response = match ctx.target.upload_data(&adapter_ctx, &ctx.workspace).await {
        Ok(response) => response,
        Err(crate::error::AdapterError::Duplicate { title }) => {
            // Collision detected after-the-fact: recover the existing id.
            ctx.log(Stage::Upload, "duplicate reported by judge, resolving by title");
            let found = ctx.target.search_by_title(&adapter_ctx, &title).await?;
            return match found {
                Some(real_id) => Ok(persist_receipt(ctx, real_id, true).await?),
                None => Err(StageError::new(
                    ErrorKind::Duplicate,
                    format!("duplicate title '{title}' but no id found"),
                )),
            };
        }
        Err(e) => return Err(e.into()),
    };

    // Resolve the real id: response, then a second search, then any
    // prior receipt for this workspace and adapter.
    let real_id = match response.real_id {
        Some(real_id) => real_id,
        None => {
            ctx.log(Stage::Upload, "upload response carried no id, searching by title");
            match ctx.target.search_by_title(&adapter_ctx, &title).await? {
                Some(real_id) => real_id,
                None => ctx
                    .workspace
                    .get_upload_receipt(ctx.target.name())?
                    .map(|receipt| receipt.real_id)
                    .ok_or_else(|| {
                        StageError::new(
                            ErrorKind::UploadNoId,
                            "upload succeeded but no real id could be resolved",
                        )
                    })?,
            }
        }
    };

    persist_receipt(ctx, real_id, false).await
}

/// Build the public URL, write the workspace receipt, and return the
/// outcome. The receipt lands before the caller advances any status.
async fn persist_receipt(
    ctx: &ProblemCtx,
    real_id: String,
    deduplicated: bool,
) -> Result<UploadOutcome, StageError> {
    let bag = ctx
        .credentials
        .adapter_config(ctx.user_id, ctx.target.name())
        .await?;
    let base_url = bag.get("base_url").map(String::as_str).unwrap_or_default();
    let domain = bag.get("domain").map(String::as_str).unwrap_or("system");
    let url = ctx.target.problem_url(base_url, domain, &real_id);

    let receipt = UploadReceipt {
        adapter: ctx.target.name().to_string(),
        real_id: real_id.clone(),
        url: url.clone(),
        uploaded_at: chrono::Utc::now().to_rfc3339(),
    };
    ctx.workspace.put_upload_receipt(&receipt)?;
    ctx.log(Stage::Upload, &format!("receipt written for {real_id} at {url}"));
    ctx.emit_progress(Stage::Upload, "done", &url);

    Ok(UploadOutcome {
        real_id,
        url,
        deduplicated,
    })
}
