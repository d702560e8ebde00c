//! Environment variable overrides for configuration.

use super::Config;
use crate::error::ConfigError;
use std::env;

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables use the `OJPILOT_` prefix with double
    /// underscores separating nested keys (e.g., `OJPILOT_GEN__CASES`).
    pub(super) fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        // Paths
        if let Ok(val) = env::var("OJPILOT_WORKSPACE__ROOT") {
            self.workspace.root = val;
        }
        if let Ok(val) = env::var("OJPILOT_STORAGE__DB_PATH") {
            self.storage.db_path = val;
        }

        // Concurrency
        if let Ok(val) = env::var("OJPILOT_CONCURRENCY__GLOBAL_TASKS") {
            self.concurrency.global_tasks =
                parse_env_usize("OJPILOT_CONCURRENCY__GLOBAL_TASKS", &val)?;
        }
        if let Ok(val) = env::var("OJPILOT_CONCURRENCY__PER_USER") {
            self.concurrency.per_user = parse_env_usize("OJPILOT_CONCURRENCY__PER_USER", &val)?;
        }
        if let Ok(val) = env::var("OJPILOT_CONCURRENCY__LLM_TOTAL") {
            self.concurrency.llm_total = parse_env_usize("OJPILOT_CONCURRENCY__LLM_TOTAL", &val)?;
        }
        if let Ok(val) = env::var("OJPILOT_CONCURRENCY__TASK_TIMEOUT_SECS") {
            self.concurrency.task_timeout_secs =
                parse_env_u64("OJPILOT_CONCURRENCY__TASK_TIMEOUT_SECS", &val)?;
        }

        // Generation
        if let Ok(val) = env::var("OJPILOT_GEN__CASES") {
            self.gen.cases = parse_env_u32("OJPILOT_GEN__CASES", &val)?;
        }
        if let Ok(val) = env::var("OJPILOT_GEN__CASE_FLOOR") {
            self.gen.case_floor = parse_env_u32("OJPILOT_GEN__CASE_FLOOR", &val)?;
        }
        if let Ok(val) = env::var("OJPILOT_GEN__PYTHON_CMD") {
            self.gen.python_cmd = val;
        }

        // Solve toolchain
        if let Ok(val) = env::var("OJPILOT_SOLVE__COMPILE_CMD") {
            self.solve.compile_cmd = val;
        }
        if let Ok(val) = env::var("OJPILOT_SOLVE__RUN_TIMEOUT_MS") {
            self.solve.run_timeout_ms = parse_env_u64("OJPILOT_SOLVE__RUN_TIMEOUT_MS", &val)?;
        }

        // LLM
        if let Ok(val) = env::var("OJPILOT_LLM__REQUEST_TIMEOUT_SECS") {
            self.llm.request_timeout_secs =
                parse_env_u64("OJPILOT_LLM__REQUEST_TIMEOUT_SECS", &val)?;
        }
        if let Ok(val) = env::var("OJPILOT_LLM__GENERATION_PROVIDER") {
            self.llm.generation_provider = val;
        }
        if let Ok(val) = env::var("OJPILOT_LLM__SOLUTION_PROVIDER") {
            self.llm.solution_provider = val;
        }
        if let Ok(val) = env::var("OJPILOT_LLM__OCR_PROVIDER") {
            self.llm.ocr_provider = val;
        }

        Ok(())
    }
}

fn parse_env_usize(name: &str, val: &str) -> Result<usize, ConfigError> {
    val.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        message: format!("'{val}' is not a valid non-negative integer"),
    })
}

fn parse_env_u32(name: &str, val: &str) -> Result<u32, ConfigError> {
    val.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        message: format!("'{val}' is not a valid non-negative integer"),
    })
}

fn parse_env_u64(name: &str, val: &str) -> Result<u64, ConfigError> {
    val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        message: format!("'{val}' is not a valid non-negative integer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interference under the parallel test runner.
    #[test]
    fn overrides_apply_and_reject_garbage() {
        env::set_var("OJPILOT_GEN__CASES", "25");
        env::set_var("OJPILOT_LLM__GENERATION_PROVIDER", "anthropic");
        let mut config = Config::default();
        config.apply_env_overrides().expect("apply");
        assert_eq!(config.gen.cases, 25);
        assert_eq!(config.llm.generation_provider, "anthropic");
        env::remove_var("OJPILOT_GEN__CASES");
        env::remove_var("OJPILOT_LLM__GENERATION_PROVIDER");

        env::set_var("OJPILOT_CONCURRENCY__GLOBAL_TASKS", "not-a-number");
        let mut config = Config::default();
        assert!(config.apply_env_overrides().is_err());
        env::remove_var("OJPILOT_CONCURRENCY__GLOBAL_TASKS");
    }
}
