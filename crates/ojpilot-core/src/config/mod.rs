//! Configuration management for the ojpilot engine.
//!
//! Supports three-layer configuration loading:
//! 1. Built-in defaults
//! 2. TOML config file (`~/.ojpilot/config.toml`)
//! 3. Environment variable overrides (`OJPILOT_` prefix)
//!
//! Transport binaries apply flag overrides after loading.

mod defaults;
mod env_overrides;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the ojpilot engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Per-problem workspace storage settings.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// SQLite database settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Concurrency gate limits.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Stage retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Test-data generation settings.
    #[serde(default)]
    pub gen: GenConfig,

    /// Reference-solution settings.
    #[serde(default)]
    pub solve: SolveConfig,

    /// LLM endpoint bindings and timeouts.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Session authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Per-problem workspace storage settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root directory under which `<user_id>/<pid>/` workspaces live.
    pub root: String,
}

/// SQLite database settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub db_path: String,
}

/// Named counting-gate limits.
///
/// These are the single source of truth for admission control; the
/// [`crate::gate::GateSet`] is built from and hot-reconfigured by this
/// struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Problems in any stage simultaneously, across all users.
    pub global_tasks: usize,
    /// Problems per user id.
    pub per_user: usize,
    /// Concurrent Fetch executions.
    pub stage_fetch: usize,
    /// Concurrent Generate executions.
    pub stage_generate: usize,
    /// Concurrent Upload executions.
    pub stage_upload: usize,
    /// Concurrent Solve executions (includes compile and run).
    pub stage_solve: usize,
    /// Concurrent LLM calls across all providers.
    pub llm_total: usize,
    /// Per-provider LLM calls.
    pub llm_per_provider: usize,
    /// Pending admissions allowed to queue.
    pub queue: usize,
    /// Wall-clock budget per problem, in seconds.
    pub task_timeout_secs: u64,
}

/// Stage retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Bounded attempts per stage, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap applied to the backoff delay, in milliseconds.
    pub max_delay_ms: u64,
}

/// Test-data generation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GenConfig {
    /// Number of cases the generator is asked to produce.
    pub cases: u32,
    /// Minimum successful cases for the stage to pass.
    pub case_floor: u32,
    /// Interpreter used to run the generator script.
    pub python_cmd: String,
    /// Wall-clock budget per generator invocation, in milliseconds.
    pub generator_timeout_ms: u64,
}

/// Reference-solution compile/run settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SolveConfig {
    /// Compile command template. `{src}` and `{out}` are substituted.
    pub compile_cmd: String,
    /// Wall-clock budget per reference-solution run, in milliseconds.
    pub run_timeout_ms: u64,
    /// Language tag sent with submissions.
    pub language: String,
    /// Overall budget for polling a submission verdict, in seconds.
    pub judge_poll_timeout_secs: u64,
}

/// LLM endpoint bindings and call timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Wall-clock budget per LLM call, in seconds.
    pub request_timeout_secs: u64,
    /// Default provider id for the generation endpoint.
    pub generation_provider: String,
    /// Default provider id for the solution endpoint.
    pub solution_provider: String,
    /// Default provider id for the OCR endpoint.
    pub ocr_provider: String,
    /// Default provider id for the summary endpoint.
    pub summary_provider: String,
}

/// Session authentication settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Session lifetime, in seconds.
    pub session_ttl_secs: u64,
}

impl Config {
    /// Load configuration from the default path (`~/.ojpilot/config.toml`).
    ///
    /// A missing file is not an error: defaults plus environment overrides
    /// apply. An unreadable or unparsable file is.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from an explicit path, then apply environment
    /// overrides and validate.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|_| ConfigError::FileNotFound {
                path: path.display().to_string(),
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::ParseError { source })?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// The default config file location.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ojpilot")
            .join("config.toml")
    }

    /// Validate the configuration, returning the first error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.global_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency.global_tasks".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.concurrency.per_user == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency.per_user".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.gen.cases == 0 {
            return Err(ConfigError::InvalidValue {
                field: "gen.cases".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.gen.case_floor > self.gen.cases {
            return Err(ConfigError::InvalidValue {
                field: "gen.case_floor".to_string(),
                message: "must not exceed gen.cases".to_string(),
            });
        }
        if !self.solve.compile_cmd.contains("{src}") || !self.solve.compile_cmd.contains("{out}") {
            return Err(ConfigError::InvalidValue {
                field: "solve.compile_cmd".to_string(),
                message: "must contain {src} and {out} placeholders".to_string(),
            });
        }
        Ok(())
    }
}

impl ConcurrencyConfig {
    /// A preset by name: `conservative`, `default`, or `aggressive`.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "conservative" => Some(Self {
                global_tasks: 10,
                per_user: 3,
                stage_fetch: 3,
                stage_generate: 2,
                stage_upload: 2,
                stage_solve: 2,
                llm_total: 2,
                llm_per_provider: 1,
                queue: 100,
                task_timeout_secs: 600,
            }),
            "default" => Some(Self::default()),
            "aggressive" => Some(Self {
                global_tasks: 200,
                per_user: 50,
                stage_fetch: 30,
                stage_generate: 20,
                stage_upload: 15,
                stage_solve: 15,
                llm_total: 24,
                llm_per_provider: 12,
                queue: 2000,
                task_timeout_secs: 900,
            }),
            _ => None,
        }
    }
}
