//! Generate stage: produce a data generator with the LLM, execute it
//! under a bounded subprocess, and pair every input with an expected
//! output.
//!
//! Expected outputs come from the reference solution when one is in the
//! workspace (compiled and run locally), otherwise from a per-input LLM
//! call. OCR runs only when the statement carries images without text
//! alternatives; the OCR client is built lazily inside the pool, so OCR
//! credentials are not required for text-only problems.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;

use super::extract_code_block;
use crate::judge::Statement;
use crate::llm::pool::LlmEndpoint;
use crate::llm::GenerationParams;
use crate::pipeline::exec::{self, ExecError};
use crate::pipeline::{ErrorKind, ProblemCtx, Stage, StageError};

const GENERATOR_SYSTEM: &str = "You write Python test-data generators for competitive \
programming problems. The script receives the case index as its only argument and prints \
one test input to stdout. Vary case size with the index: small indices produce edge cases, \
large indices produce stress cases. Reply with a single Python code block.";

const ANSWER_SYSTEM: &str = "You are the reference solution for a competitive programming \
problem. Given the problem statement and one test input, reply with the exact expected \
output and nothing else.";

/// Result of a completed Generate stage.
#[derive(Debug)]
pub struct GenerateOutcome {
    /// Complete case pairs written.
    pub cases_written: u32,
    /// Present when fewer than the requested cases succeeded.
    pub warning: Option<String>,
}

/// How expected outputs are produced for generated inputs.
enum AnswerSource {
    /// Run a compiled binary with the input on stdin.
    Binary(PathBuf),
    /// Run an interpreted solution with the input on stdin.
    Script { interpreter: String, path: PathBuf },
    /// Ask the solution LLM endpoint per input.
    Llm,
}

/// Run the Generate stage.
pub async fn run(ctx: &ProblemCtx) -> Result<GenerateOutcome, StageError> {
    ctx.check_cancelled()?;
    let statement = ctx.workspace.read_statement().map_err(|e| {
        StageError::new(
            ErrorKind::Internal,
            format!("generate requires a fetched statement: {e}"),
        )
    })?;

    let ocr_text = transcribe_images(ctx, &statement).await?;
    let script_path = produce_generator(ctx, &statement, &ocr_text).await?;
    let answers = prepare_answer_source(ctx).await;

    let requested = ctx.config.gen.cases;
    let budget = Duration::from_millis(ctx.config.gen.generator_timeout_ms);
    let mut written = 0u32;

    for index in 1..=requested {
        ctx.check_cancelled()?;

        let mut command = Command::new(&ctx.config.gen.python_cmd);
        command
            .arg(&script_path)
            .arg(index.to_string())
            .current_dir(ctx.workspace.dir());
        let output = match exec::run_bounded(command, None, budget, &ctx.cancel).await {
            Ok(output) => output,
            Err(ExecError::Cancelled) => return Err(ExecError::Cancelled.into()),
            Err(e) => {
                ctx.log(Stage::Generate, &format!("case {index}: generator failed: {e}"));
                continue;
            }
        };
        if !output.success() {
            ctx.log(
                Stage::Generate,
                &format!(
                    "case {index}: generator exited {:?}: {}",
                    output.exit_code,
                    output.stderr_text().trim()
                ),
            );
            continue;
        }
        let input = output.stdout_text();
        if input.trim().is_empty() {
            ctx.log(Stage::Generate, &format!("case {index}: generator printed nothing"));
            continue;
        }

        let expected = match compute_expected(ctx, &statement, &answers, &input).await {
            Ok(expected) => expected,
            Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
            Err(e) => {
                ctx.log(Stage::Generate, &format!("case {index}: no expected output: {e}"));
                continue;
            }
        };

        ctx.workspace.put_generated_case(index, &input, &expected)?;
        written += 1;
        ctx.emit_progress(
            Stage::Generate,
            "running",
            &format!("case {written}/{requested}"),
        );
    }

    let floor = ctx.config.gen.case_floor;
    if written < floor {
        return Err(StageError::new(
            ErrorKind::GenInsufficient,
            format!("only {written} of {requested} cases succeeded (floor {floor})"),
        ));
    }
    let warning = (written < requested).then(|| {
        format!("generated {written} of {requested} requested cases")
    });
    if let Some(w) = &warning {
        ctx.log(Stage::Generate, w);
    }
    ctx.log(Stage::Generate, &format!("wrote {written} case pairs"));
    Ok(GenerateOutcome {
        cases_written: written,
        warning,
    })
}

/// OCR every image that lacks a text alternative. Returns the combined
/// transcriptions, empty when no OCR was needed.
async fn transcribe_images(
    ctx: &ProblemCtx,
    statement: &Statement,
) -> Result<String, StageError> {
    if !statement.needs_ocr() {
        return Ok(String::new());
    }
    let mut transcriptions = String::new();
    for image in statement.images.iter().filter(|img| img.alt.is_none()) {
        ctx.check_cancelled()?;
        ctx.log(Stage::Generate, &format!("transcribing image {}", image.url));
        let outcome = ctx
            .llm
            .call(
                LlmEndpoint::Ocr,
                None,
                "Transcribe all text visible in the referenced image, preserving layout.",
                &format!("Image URL: {}", image.url),
                &GenerationParams::default(),
                &ctx.cancel,
            )
            .await?;
        transcriptions.push_str(&outcome.text);
        transcriptions.push('\n');
    }
    Ok(transcriptions)
}

/// Ask the generation endpoint for a generator script and store it.
async fn produce_generator(
    ctx: &ProblemCtx,
    statement: &Statement,
    ocr_text: &str,
) -> Result<PathBuf, StageError> {
    let prompt = generator_prompt(statement, ocr_text);
    let outcome = ctx
        .llm
        .call(
            LlmEndpoint::Generation,
            ctx.llm_provider.as_deref(),
            GENERATOR_SYSTEM,
            &prompt,
            &GenerationParams::default(),
            &ctx.cancel,
        )
        .await?;
    let script = extract_code_block(&outcome.text);
    if script.is_empty() {
        return Err(StageError::new(
            ErrorKind::Parse,
            "generation endpoint returned no code",
        ));
    }
    ctx.log(
        Stage::Generate,
        &format!(
            "generator produced by {} in {}ms",
            outcome.provider, outcome.latency_ms
        ),
    );
    Ok(ctx.workspace.put_generator_script(&script)?)
}

/// Decide how expected outputs will be computed. A broken reference
/// solution demotes to the LLM fallback instead of failing the stage.
async fn prepare_answer_source(ctx: &ProblemCtx) -> AnswerSource {
    let Some((path, ext)) = ctx.workspace.find_solution() else {
        return AnswerSource::Llm;
    };
    if ext == "py" {
        return AnswerSource::Script {
            interpreter: ctx.config.gen.python_cmd.clone(),
            path,
        };
    }

    let binary = ctx.workspace.dir().join("sol/solution.bin");
    let Some(command) = exec::compile_command(
        &ctx.config.solve.compile_cmd,
        &path.to_string_lossy(),
        &binary.to_string_lossy(),
    ) else {
        return AnswerSource::Llm;
    };
    match exec::run_bounded(command, None, Duration::from_secs(60), &ctx.cancel).await {
        Ok(output) if output.success() => AnswerSource::Binary(binary),
        Ok(output) => {
            ctx.log(
                Stage::Generate,
                &format!(
                    "reference solution failed to compile, using LLM answers: {}",
                    output.stderr_text().trim()
                ),
            );
            AnswerSource::Llm
        }
        Err(e) => {
            ctx.log(
                Stage::Generate,
                &format!("reference compile aborted, using LLM answers: {e}"),
            );
            AnswerSource::Llm
        }
    }
}

/// Compute the expected output for one generated input.
async fn compute_expected(
    ctx: &ProblemCtx,
    statement: &Statement,
    answers: &AnswerSource,
    input: &str,
) -> Result<String, StageError> {
    let budget = Duration::from_millis(ctx.config.solve.run_timeout_ms);
    match answers {
        AnswerSource::Binary(path) => {
            let command = Command::new(path);
            let output =
                exec::run_bounded(command, Some(input.as_bytes()), budget, &ctx.cancel).await?;
            if !output.success() {
                return Err(StageError::new(
                    ErrorKind::BadData,
                    format!("reference solution exited {:?}", output.exit_code),
                ));
            }
            Ok(output.stdout_text())
        }
        AnswerSource::Script { interpreter, path } => {
            let mut command = Command::new(interpreter);
            command.arg(path);
            let output =
                exec::run_bounded(command, Some(input.as_bytes()), budget, &ctx.cancel).await?;
            if !output.success() {
                return Err(StageError::new(
                    ErrorKind::BadData,
                    format!("reference solution exited {:?}", output.exit_code),
                ));
            }
            Ok(output.stdout_text())
        }
        AnswerSource::Llm => {
            let outcome = ctx
                .llm
                .call(
                    LlmEndpoint::Solution,
                    ctx.llm_provider.as_deref(),
                    ANSWER_SYSTEM,
                    &answer_prompt(statement, input),
                    &GenerationParams::default(),
                    &ctx.cancel,
                )
                .await?;
            let text = outcome.text.trim().to_string();
            if text.is_empty() {
                return Err(StageError::new(
                    ErrorKind::Parse,
                    "solution endpoint returned no output",
                ));
            }
            Ok(ensure_trailing_newline(text))
        }
    }
}

fn generator_prompt(statement: &Statement, ocr_text: &str) -> String {
    let mut prompt = format!(
        "Problem: {}\n\n{}\n\nInput format:\n{}\n\nOutput format:\n{}\n",
        statement.title, statement.body, statement.input_format, statement.output_format
    );
    if !ocr_text.is_empty() {
        prompt.push_str("\nText transcribed from statement images:\n");
        prompt.push_str(ocr_text);
    }
    if let Some(sample) = statement.samples.first() {
        prompt.push_str(&format!("\nSample input:\n{}", sample.input));
    }
    prompt.push_str("\nWrite the generator script now.");
    prompt
}

fn answer_prompt(statement: &Statement, input: &str) -> String {
    format!(
        "Problem: {}\n\n{}\n\nOutput format:\n{}\n\nTest input:\n{}\n",
        statement.title, statement.body, statement.output_format, input
    )
}

fn ensure_trailing_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
