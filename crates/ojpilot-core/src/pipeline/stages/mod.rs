//! The four stage executors: Fetch, Generate, Upload, Solve.
//!
//! Executors are pure-ish functions over a [`super::ProblemCtx`]: they
//! read and write the workspace, talk to adapters and the LLM pool, and
//! return a typed result. Skip decisions, gating, and retries belong to
//! the runner, never here.

pub mod fetch;
pub mod generate;
pub mod solve;
pub mod upload;

/// Pull the first fenced code block out of an LLM completion, ignoring
/// the language tag. Falls back to the whole text when no fence is
/// present, since smaller models often answer with bare code.
pub(crate) fn extract_code_block(text: &str) -> String {
    if let Some(open) = text.find("```") {
        let after_fence = &text[open + 3..];
        // Skip the info string (e.g. "python") up to the first newline.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        if let Some(close) = body.find("```") {
            return body[..close].trim_end().to_string();
        }
        return body.trim_end().to_string();
    }
    text.trim().to_string()
}
