//! Pooled LLM access for stage executors.
//!
//! The pool binds typed endpoints (generation, solution, OCR, summary)
//! to providers, shares one HTTP transport across all clients, bounds
//! parallelism under the `llm.total` and `llm.<provider>` gates, and
//! applies the configured per-request timeout. Clients are built lazily
//! on first use, so OCR credentials are only required when a statement
//! actually needs OCR.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::providers::{self, ProviderKind};
use super::{GenerationParams, LlmProvider, TokenUsage};
use crate::config::LlmConfig;
use crate::error::{GateError, LlmError};
use crate::gate::{GateSet, LLM_TOTAL};
use crate::storage::crypto::SecretKey;
use crate::storage::{self, DbPool};

/// Typed endpoints the pipeline calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmEndpoint {
    /// Test-data generator production.
    Generation,
    /// Reference-solution production.
    Solution,
    /// Statement image transcription.
    Ocr,
    /// Statement summarization.
    Summary,
}

impl LlmEndpoint {
    /// Stable string form used in usage accounting.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Solution => "solution",
            Self::Ocr => "ocr",
            Self::Summary => "summary",
        }
    }
}

impl std::fmt::Display for LlmEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one pooled LLM call.
#[derive(Debug, Clone)]
pub struct LlmCallOutcome {
    /// The generated text.
    pub text: String,
    /// Token usage for the call.
    pub usage: TokenUsage,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// The model that answered.
    pub model: String,
    /// The provider that answered.
    pub provider: String,
}

/// Result of a provider health check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TestReport {
    /// Whether the check passed.
    pub ok: bool,
    /// Human-readable detail.
    pub message: String,
}

/// Shared pool of typed LLM clients.
pub struct LlmPool {
    db: DbPool,
    key: SecretKey,
    gates: Arc<GateSet>,
    http: reqwest::Client,
    config: LlmConfig,
    built: tokio::sync::Mutex<HashMap<String, Arc<dyn LlmProvider>>>,
}

impl LlmPool {
    /// Create a pool over the given database, process key, and gates.
    pub fn new(db: DbPool, key: SecretKey, gates: Arc<GateSet>, config: LlmConfig) -> Self {
        Self {
            db,
            key,
            gates,
            http: reqwest::Client::new(),
            config,
            built: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The default provider id bound to an endpoint.
    fn default_provider(&self, endpoint: LlmEndpoint) -> &str {
        match endpoint {
            LlmEndpoint::Generation => &self.config.generation_provider,
            LlmEndpoint::Solution => &self.config.solution_provider,
            LlmEndpoint::Ocr => &self.config.ocr_provider,
            LlmEndpoint::Summary => &self.config.summary_provider,
        }
    }

    /// Resolve (and lazily build) the client for an endpoint, honoring a
    /// per-task provider override.
    async fn provider_for(
        &self,
        endpoint: LlmEndpoint,
        provider_override: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let id = provider_override
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.default_provider(endpoint));
        if id.is_empty() {
            return Err(LlmError::NotConfigured {
                endpoint: endpoint.as_str().to_string(),
            });
        }

        let mut built = self.built.lock().await;
        if let Some(provider) = built.get(id) {
            return Ok(Arc::clone(provider));
        }

        let row = storage::providers::get(&self.db, id)
            .await
            .map_err(|e| LlmError::Credentials {
                provider: id.to_string(),
                message: format!("provider lookup failed: {e}"),
            })?
            .ok_or_else(|| LlmError::NotConfigured {
                endpoint: endpoint.as_str().to_string(),
            })?;
        let kind = ProviderKind::parse(&row.kind).ok_or_else(|| LlmError::Credentials {
            provider: id.to_string(),
            message: format!("unknown provider kind '{}'", row.kind),
        })?;
        let credentials = storage::providers::load_credentials(&self.db, &self.key, id)
            .await
            .map_err(|e| LlmError::Credentials {
                provider: id.to_string(),
                message: format!("credential load failed: {e}"),
            })?;
        if let Some(spec) = providers::spec(id) {
            providers::validate_credentials(spec, &credentials)?;
        }

        let provider: Arc<dyn LlmProvider> = Arc::from(providers::build_provider(
            self.http.clone(),
            id,
            kind,
            &row.api_url,
            &row.model,
            &credentials,
        ));
        built.insert(id.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Drop the cached client for a provider so the next call rebuilds it
    /// with fresh row values and credentials.
    pub async fn invalidate(&self, provider_id: &str) {
        self.built.lock().await.remove(provider_id);
    }

    /// Make one completion call through the gates with the configured
    /// timeout, recording usage on success.
    pub async fn call(
        &self,
        endpoint: LlmEndpoint,
        provider_override: Option<&str>,
        system: &str,
        prompt: &str,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<LlmCallOutcome, LlmError> {
        let provider = self.provider_for(endpoint, provider_override).await?;
        let provider_name = provider.name().to_string();

        // Fixed order: llm.total before llm.<provider>.
        let _total = self
            .gates
            .acquire(LLM_TOTAL, cancel)
            .await
            .map_err(map_gate_error)?;
        let _per_provider = self
            .gates
            .acquire_llm_provider(&provider_name, cancel)
            .await
            .map_err(map_gate_error)?;

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let started = Instant::now();
        let response = tokio::select! {
            result = tokio::time::timeout(timeout, provider.complete(system, prompt, params)) => {
                match result {
                    Ok(inner) => inner?,
                    Err(_) => {
                        return Err(LlmError::Timeout {
                            seconds: timeout.as_secs(),
                        });
                    }
                }
            }
            () = cancel.cancelled() => return Err(LlmError::Cancelled),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = storage::llm_usage::record(
            &self.db,
            &provider_name,
            endpoint.as_str(),
            response.usage.input_tokens,
            response.usage.output_tokens,
            latency_ms,
        )
        .await
        {
            tracing::warn!(provider = %provider_name, error = %e, "failed to record LLM usage");
        }

        Ok(LlmCallOutcome {
            text: response.text,
            usage: response.usage,
            latency_ms,
            model: response.model,
            provider: provider_name,
        })
    }

    /// Health-check a provider. With `full = false` only the credential
    /// shape is validated; `full = true` sends a minimal real prompt.
    pub async fn test(&self, provider_id: &str, full: bool) -> TestReport {
        let row = match storage::providers::get(&self.db, provider_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return TestReport {
                    ok: false,
                    message: format!("unknown provider '{provider_id}'"),
                }
            }
            Err(e) => {
                return TestReport {
                    ok: false,
                    message: format!("provider lookup failed: {e}"),
                }
            }
        };

        let credentials =
            match storage::providers::load_credentials(&self.db, &self.key, provider_id).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    return TestReport {
                        ok: false,
                        message: format!("credential load failed: {e}"),
                    }
                }
            };
        if let Some(spec) = providers::spec(provider_id) {
            if let Err(e) = providers::validate_credentials(spec, &credentials) {
                return TestReport {
                    ok: false,
                    message: e.to_string(),
                };
            }
        }
        if !full {
            return TestReport {
                ok: true,
                message: "credentials look valid".to_string(),
            };
        }

        let Some(kind) = ProviderKind::parse(&row.kind) else {
            return TestReport {
                ok: false,
                message: format!("unknown provider kind '{}'", row.kind),
            };
        };
        let provider = providers::build_provider(
            self.http.clone(),
            provider_id,
            kind,
            &row.api_url,
            &row.model,
            &credentials,
        );
        match provider.health_check().await {
            Ok(()) => TestReport {
                ok: true,
                message: "provider responded".to_string(),
            },
            Err(e) => TestReport {
                ok: false,
                message: e.to_string(),
            },
        }
    }
}

fn map_gate_error(error: GateError) -> LlmError {
    match error {
        GateError::Cancelled { .. } => LlmError::Cancelled,
        GateError::UnknownGate { name } => LlmError::Credentials {
            provider: name,
            message: "gate missing".to_string(),
        },
    }
}
