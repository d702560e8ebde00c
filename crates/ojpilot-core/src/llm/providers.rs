//! Provider spec registry: the single source of truth for LLM providers.
//!
//! The registry drives both client construction (which wire protocol,
//! which credential fields) and transport rendering (`providers.list()`
//! serializes these specs). There is deliberately no second definition
//! anywhere else to drift from.

use std::collections::HashMap;

use serde::Serialize;

use super::anthropic::AnthropicProvider;
use super::openai_compat::OpenAiCompatProvider;
use super::LlmProvider;
use crate::error::LlmError;
use crate::storage::{self, DbPool};

/// Wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenAI chat completions format.
    OpenAiCompat,
    /// Anthropic Messages API.
    Anthropic,
}

impl ProviderKind {
    /// Stable string form, stored in the providers table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAiCompat => "openai-compat",
            Self::Anthropic => "anthropic",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai-compat" => Some(Self::OpenAiCompat),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }
}

/// System-wide record for one LLM provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSpec {
    /// Stable id, also the gate and usage-accounting key.
    pub id: &'static str,
    /// Human-readable name.
    pub display_name: &'static str,
    /// Wire protocol.
    pub kind: ProviderKind,
    /// Default API base URL.
    pub api_url: &'static str,
    /// Default model.
    pub default_model: &'static str,
    /// Credential field names a transport renders and construction reads.
    pub credential_fields: &'static [&'static str],
    /// Whether non-admin users may pick this provider for their tasks.
    pub user_selectable: bool,
}

/// The built-in provider seed.
pub fn builtin_specs() -> &'static [ProviderSpec] {
    const SPECS: &[ProviderSpec] = &[
        ProviderSpec {
            id: "openai",
            display_name: "OpenAI",
            kind: ProviderKind::OpenAiCompat,
            api_url: "https://api.openai.com/v1",
            default_model: "gpt-4o-mini",
            credential_fields: &["api_key"],
            user_selectable: true,
        },
        ProviderSpec {
            id: "anthropic",
            display_name: "Anthropic",
            kind: ProviderKind::Anthropic,
            api_url: "https://api.anthropic.com/v1",
            default_model: "claude-sonnet-4-5",
            credential_fields: &["api_key"],
            user_selectable: true,
        },
        ProviderSpec {
            id: "deepseek",
            display_name: "DeepSeek",
            kind: ProviderKind::OpenAiCompat,
            api_url: "https://api.deepseek.com/v1",
            default_model: "deepseek-chat",
            credential_fields: &["api_key"],
            user_selectable: true,
        },
        ProviderSpec {
            id: "ollama",
            display_name: "Ollama (local)",
            kind: ProviderKind::OpenAiCompat,
            api_url: "http://localhost:11434/v1",
            default_model: "llama3.1",
            credential_fields: &[],
            user_selectable: true,
        },
    ];
    SPECS
}

/// Look up a built-in spec by id.
pub fn spec(id: &str) -> Option<&'static ProviderSpec> {
    builtin_specs().iter().find(|s| s.id == id)
}

/// Seed the providers table from the built-in specs. Existing rows are
/// left untouched so runtime edits survive restarts.
pub async fn seed_providers(pool: &DbPool) -> Result<(), crate::error::StorageError> {
    for s in builtin_specs() {
        storage::providers::seed(
            pool,
            s.id,
            s.display_name,
            s.kind.as_str(),
            s.api_url,
            s.default_model,
            s.user_selectable,
        )
        .await?;
    }
    Ok(())
}

/// Validate that a credential bag has every field the spec requires.
pub fn validate_credentials(
    spec: &ProviderSpec,
    credentials: &HashMap<String, String>,
) -> Result<(), LlmError> {
    for field in spec.credential_fields {
        match credentials.get(*field) {
            Some(value) if !value.is_empty() => {}
            _ => {
                return Err(LlmError::Credentials {
                    provider: spec.id.to_string(),
                    message: format!("missing credential field '{field}'"),
                });
            }
        }
    }
    Ok(())
}

/// Construct a client for a provider from its row values and credentials.
///
/// `kind`, `api_url`, and `model` come from the providers table (seeded
/// from the spec, runtime-editable); `credentials` is the decrypted bag.
pub fn build_provider(
    http: reqwest::Client,
    provider_id: &str,
    kind: ProviderKind,
    api_url: &str,
    model: &str,
    credentials: &HashMap<String, String>,
) -> Box<dyn LlmProvider> {
    let api_key = credentials.get("api_key").cloned().unwrap_or_default();
    match kind {
        ProviderKind::OpenAiCompat => Box::new(OpenAiCompatProvider::new(
            http,
            provider_id.to_string(),
            api_url.to_string(),
            api_key,
            model.to_string(),
        )),
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(
            http,
            provider_id.to_string(),
            api_url.to_string(),
            api_key,
            model.to_string(),
        )),
    }
}
