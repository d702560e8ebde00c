//! LLM provider abstraction, the provider spec registry, and the pooled
//! client used by stage executors.
//!
//! Providers expose one trait; the [`providers`] registry is the single
//! source of truth for how clients are constructed and which credential
//! fields a transport renders. The [`pool`] wires providers to typed
//! endpoints (generation, solution, OCR, summary) under the LLM gates.

pub mod anthropic;
pub mod openai_compat;
pub mod pool;
pub mod providers;

use crate::error::LlmError;

/// Token usage information from an LLM completion.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the input/prompt.
    pub input_tokens: u32,
    /// Number of tokens in the output/completion.
    pub output_tokens: u32,
}

/// Response from an LLM completion request.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,
    /// Token usage for this completion.
    pub usage: TokenUsage,
    /// The model that produced this response.
    pub model: String,
}

/// Parameters controlling LLM generation behavior.
///
/// Defaults favor long, low-temperature completions: the engine asks for
/// code (generator scripts, reference solutions), not prose.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

/// Trait abstracting all LLM provider operations.
///
/// Implementations include [`openai_compat::OpenAiCompatProvider`] (for
/// OpenAI, Ollama, and any compatible endpoint) and
/// [`anthropic::AnthropicProvider`]. Object-safe for `Arc<dyn LlmProvider>`.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the provider id this client was built from.
    fn name(&self) -> &str;

    /// Send a completion request to the LLM.
    async fn complete(
        &self,
        system: &str,
        user_message: &str,
        params: &GenerationParams,
    ) -> Result<LlmResponse, LlmError>;

    /// Check if the provider is reachable and configured correctly.
    async fn health_check(&self) -> Result<(), LlmError>;
}
