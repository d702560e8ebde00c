//! Bounded subprocess execution for generators and reference solutions.
//!
//! Every child runs with piped stdio, a wall-clock budget, and
//! `kill_on_drop`, so a timeout or cancellation reliably reaps the
//! process at the next suspension point.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ErrorKind, StageError};

/// Captured output of a finished child.
#[derive(Debug)]
pub struct ExecOutput {
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Exit code, when the child exited normally.
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// Whether the child exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout as lossy UTF-8.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as lossy UTF-8.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Errors from bounded subprocess execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The child could not be spawned.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// The program that failed to start.
        command: String,
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the child's stdin failed.
    #[error("failed to write child stdin: {source}")]
    Stdin {
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// The child exceeded its wall-clock budget and was killed.
    #[error("subprocess exceeded {ms}ms budget")]
    Timeout {
        /// The budget that was exceeded.
        ms: u64,
    },

    /// Cancellation fired; the child was killed.
    #[error("subprocess cancelled")]
    Cancelled,

    /// Waiting on the child failed.
    #[error("failed waiting on subprocess: {source}")]
    Wait {
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ExecError> for StageError {
    fn from(error: ExecError) -> Self {
        let kind = match &error {
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        };
        StageError::new(kind, error.to_string())
    }
}

/// Run a command with optional stdin, a wall-clock budget, and
/// cooperative cancellation. The child is killed when either fires.
pub async fn run_bounded(
    mut command: Command,
    stdin: Option<&[u8]>,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<ExecOutput, ExecError> {
    let program = format!("{:?}", command.as_std().get_program());
    command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        command: program,
        source,
    })?;

    if let Some(bytes) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            handle
                .write_all(bytes)
                .await
                .map_err(|source| ExecError::Stdin { source })?;
            // Dropping the handle closes the pipe so the child sees EOF.
        }
    } else {
        drop(child.stdin.take());
    }

    let wait = child.wait_with_output();
    tokio::select! {
        result = tokio::time::timeout(budget, wait) => match result {
            Ok(Ok(output)) => Ok(ExecOutput {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.status.code(),
            }),
            Ok(Err(source)) => Err(ExecError::Wait { source }),
            // Dropping the wait future kills the child.
            Err(_) => Err(ExecError::Timeout {
                ms: budget.as_millis() as u64,
            }),
        },
        () = cancel.cancelled() => Err(ExecError::Cancelled),
    }
}

/// Split a compile command template into program and arguments, with
/// `{src}` and `{out}` substituted.
pub fn compile_command(template: &str, src: &str, out: &str) -> Option<Command> {
    let rendered = template.replace("{src}", src).replace("{out}", out);
    let mut parts = rendered.split_whitespace();
    let program = parts.next()?;
    let mut command = Command::new(program);
    command.args(parts);
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo hello; exit 0"]);
        let output = run_bounded(
            command,
            None,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout_text(), "hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo oops >&2; exit 3"]);
        let output = run_bounded(
            command,
            None,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .expect("run");
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr_text(), "oops\n");
    }

    #[tokio::test]
    async fn stdin_is_piped() {
        let mut command = Command::new("sh");
        command.args(["-c", "cat"]);
        let output = run_bounded(
            command,
            Some(b"1 2\n"),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .expect("run");
        assert_eq!(output.stdout_text(), "1 2\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let started = std::time::Instant::now();
        let err = run_bounded(
            command,
            None,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { ms: 100 }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let started = std::time::Instant::now();
        let err = run_bounded(command, None, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let command = Command::new("definitely-not-a-real-binary");
        let err = run_bounded(
            command,
            None,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn compile_command_substitutes_placeholders() {
        let command = compile_command(
            "g++ -O2 -std=c++17 -o {out} {src}",
            "sol/solution.cpp",
            "sol/solution.bin",
        )
        .expect("command");
        let std_command = command.as_std();
        assert_eq!(std_command.get_program(), "g++");
        let args: Vec<&std::ffi::OsStr> = std_command.get_args().collect();
        assert!(args.contains(&std::ffi::OsStr::new("sol/solution.bin")));
        assert!(args.contains(&std::ffi::OsStr::new("sol/solution.cpp")));
    }

    #[test]
    fn exec_error_maps_to_stage_error_kinds() {
        let e: StageError = ExecError::Timeout { ms: 10 }.into();
        assert_eq!(e.kind, ErrorKind::Timeout);
        let e: StageError = ExecError::Cancelled.into();
        assert_eq!(e.kind, ErrorKind::Cancelled);
    }
}
