mod ollama;
mod openai;

use async_trait::async_trait;
use std::time::Duration;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Response parsing failed: {0}")]
    ParseError(String),
}

/// Request to generate text
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Instructions describing the game context
    pub system: String,
    /// The user prompt
    pub prompt: String,
    /// Maximum response length in tokens (provider-dependent)
    pub max_tokens: Option<u32>,
    /// Timeout for the request
    pub timeout: Duration,
}

/// Response from an LLM provider
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// The generated text
    pub text: String,
    /// Provider-specific metadata (model used, latency)
    pub metadata: ResponseMetadata,
}

/// Metadata about the LLM response
#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    /// Name of the provider (e.g., "openai", "ollama")
    pub provider: String,
    /// Model name used
    pub model: String,
    /// Latency in milliseconds
    pub latency_ms: u64,
}

/// Trait that all LLM providers must implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate text for the given request
    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse>;

    /// Get the name of this provider
    fn name(&self) -> &str;
}

/// Port used by the game core to obtain round statements
#[async_trait]
pub trait PromptGenerator: Send + Sync {
    /// Produce `count` statements about `topic`
    async fn generate_prompts(&self, count: u32, topic: &str) -> LlmResult<Vec<String>>;
}

/// System prompt describing the game to the model
const STATEMENT_SYSTEM_PROMPT: &str = "You are playing a GIF reaction game where users search \
    for a GIF that best describes a statement. Answer with a numbered list, one short statement \
    per line, and nothing else.";

/// Manager for multiple LLM providers
pub struct LlmManager {
    pub providers: Vec<Box<dyn LlmProvider>>,
    timeout: Duration,
    max_tokens: u32,
}

impl LlmManager {
    /// Create a new LLM manager with the given providers
    pub fn new(providers: Vec<Box<dyn LlmProvider>>, timeout: Duration, max_tokens: u32) -> Self {
        Self {
            providers,
            timeout,
            max_tokens,
        }
    }
}

#[async_trait]
impl PromptGenerator for LlmManager {
    /// Providers are tried in order; the first one that yields statements wins
    async fn generate_prompts(&self, count: u32, topic: &str) -> LlmResult<Vec<String>> {
        let request = GenerateRequest {
            system: STATEMENT_SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Give me {} statements about {} for a GIF reaction game.",
                count, topic
            ),
            max_tokens: Some(self.max_tokens.max(count * 40)),
            timeout: self.timeout,
        };

        let mut last_error = LlmError::ConfigError("No LLM providers configured".to_string());
        for provider in &self.providers {
            match provider.generate(request.clone()).await {
                Ok(response) => {
                    let statements = split_statements(&response.text);
                    if statements.is_empty() {
                        tracing::warn!("Provider {} returned no statements", provider.name());
                        last_error = LlmError::ParseError("no statements in response".to_string());
                        continue;
                    }
                    tracing::info!(
                        "Generated {} statements with {}:{} in {}ms",
                        statements.len(),
                        response.metadata.provider,
                        response.metadata.model,
                        response.metadata.latency_ms
                    );
                    return Ok(statements);
                }
                Err(e) => {
                    tracing::error!("Provider {} failed: {}", provider.name(), e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Split a model reply into statements, one per numbered or bulleted line
pub fn split_statements(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            strip_list_marker(line.trim())
                .trim()
                .trim_matches(|c: char| c == '"' || c == '.' || c.is_whitespace())
                .to_string()
        })
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Drop a leading `1.`, `2)`, `-` or `*` marker. Digits that are not
/// followed by `.` or `)` and a space belong to the statement.
fn strip_list_marker(line: &str) -> &str {
    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() == line.len() {
        return line.strip_prefix(['-', '*']).unwrap_or(line);
    }
    match rest.strip_prefix(['.', ')']) {
        Some(after) if after.is_empty() || after.starts_with(char::is_whitespace) => after,
        _ => line,
    }
}

/// Configuration for LLM providers
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI API key
    pub openai_api_key: Option<String>,
    /// OpenAI model to use
    pub openai_model: String,
    /// Ollama base URL
    pub ollama_base_url: Option<String>,
    /// Ollama model to use
    pub ollama_model: String,
    /// Default timeout for LLM requests
    pub default_timeout: Duration,
    /// Default max tokens for responses
    pub default_max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            ollama_base_url: Some("http://localhost:11434".to_string()),
            ollama_model: "llama3.2".to_string(),
            default_timeout: Duration::from_secs(30),
            default_max_tokens: 400,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

impl LlmConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ollama_base_url = match std::env::var("OLLAMA_BASE_URL") {
            Ok(url) => {
                let trimmed = url.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => defaults.ollama_base_url,
        };

        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_model: non_empty_env("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            ollama_base_url,
            ollama_model: non_empty_env("OLLAMA_MODEL").unwrap_or(defaults.ollama_model),
            default_timeout: std::env::var("LLM_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            default_max_tokens: std::env::var("LLM_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_max_tokens),
        }
    }

    /// Build an LlmManager with all configured providers
    pub fn build_manager(&self) -> LlmResult<LlmManager> {
        let mut providers: Vec<Box<dyn LlmProvider>> = Vec::new();

        // Add OpenAI if API key is available
        if let Some(api_key) = &self.openai_api_key {
            providers.push(Box::new(OpenAiProvider::new(
                api_key.clone(),
                self.openai_model.clone(),
            )));
        }

        // Add Ollama if base URL is available
        if let Some(base_url) = &self.ollama_base_url {
            providers.push(Box::new(OllamaProvider::new(
                base_url.clone(),
                self.ollama_model.clone(),
            )?));
        }

        if providers.is_empty() {
            return Err(LlmError::ConfigError(
                "No LLM providers configured. Set OPENAI_API_KEY or OLLAMA_BASE_URL".to_string(),
            ));
        }

        Ok(LlmManager::new(
            providers,
            self.default_timeout,
            self.default_max_tokens,
        ))
    }
}
