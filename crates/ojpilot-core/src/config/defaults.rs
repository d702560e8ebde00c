//! Default values for all configuration sections.
//!
//! Users only need to supply judge credentials and provider keys; every
//! engine knob has a working default.

use super::{
    AuthConfig, ConcurrencyConfig, GenConfig, LlmConfig, RetryConfig, SolveConfig, StorageConfig,
    WorkspaceConfig,
};

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: "~/.ojpilot/workspaces".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.ojpilot/ojpilot.db".to_string(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_tasks: 50,
            per_user: 10,
            stage_fetch: 10,
            stage_generate: 8,
            stage_upload: 5,
            stage_solve: 5,
            llm_total: 8,
            llm_per_provider: 4,
            queue: 500,
            task_timeout_secs: 600,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            cases: 10,
            case_floor: 5,
            python_cmd: "python3".to_string(),
            generator_timeout_ms: 10_000,
        }
    }
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            compile_cmd: "g++ -O2 -std=c++17 -o {out} {src}".to_string(),
            run_timeout_ms: 1000,
            language: "cpp".to_string(),
            judge_poll_timeout_secs: 120,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            generation_provider: "openai".to_string(),
            solution_provider: "openai".to_string(),
            ocr_provider: "openai".to_string(),
            summary_provider: "openai".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 7 * 24 * 3600,
        }
    }
}
