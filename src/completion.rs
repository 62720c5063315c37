//! Completion provider seam and the HTTP client behind it.

use async_trait::async_trait;
use std::time::Duration;

use crate::conversation::{Message, Role};
use crate::error::CompletionError;
use crate::providers::{
    AnthropicMessage, AnthropicRequest, AnthropicResponse, OpenAIChatMessage, OpenAIChatRequest,
    OpenAIChatResponse, Provider,
};

/// Reply substituted whenever the provider cannot produce one.
pub const APOLOGY_REPLY: &str = "Sorry, I couldn't generate a response right now.";

/// Fixed sampling parameters for every turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound for one provider call, connect to last byte.
    pub timeout: Duration,
}

impl CompletionParams {
    /// Low randomness, short replies, 30 s budget.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.2,
            max_tokens: 150,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Whether a provider can be called at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Ready,
    Disabled(String),
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn status(&self) -> ProviderStatus;

    /// Generate one reply for `messages` (system instruction first).
    async fn complete(&self, messages: &[Message]) -> Result<String, CompletionError>;
}

/// Calls the OpenAI chat completions or Anthropic messages endpoint.
pub struct HttpCompletionClient {
    provider: Provider,
    api_key: Option<String>,
    base_url: String,
    params: CompletionParams,
    client: reqwest::Client,
}

impl HttpCompletionClient {
    /// A missing or blank `api_key` yields a client whose status is
    /// [`ProviderStatus::Disabled`]; every call then fails fast.
    pub fn new(provider: Provider, api_key: Option<String>, params: CompletionParams) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(params.timeout)
            .build()
            .unwrap_or_default();
        Self {
            provider,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: provider.default_base_url().to_string(),
            params,
            client,
        }
    }

    /// Point the client at a different host (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn params(&self) -> &CompletionParams {
        &self.params
    }

    fn transport(&self, e: reqwest::Error) -> CompletionError {
        CompletionError::Transport {
            provider: self.provider.to_string(),
            detail: e.to_string(),
        }
    }

    async fn check_status(&self, resp: reqwest::Response) -> Result<reqwest::Response, CompletionError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(CompletionError::Status {
            provider: self.provider.to_string(),
            status,
            body,
        })
    }

    async fn complete_openai(&self, key: &str, messages: &[Message]) -> Result<String, CompletionError> {
        let request = OpenAIChatRequest {
            model: self.params.model.clone(),
            messages: messages
                .iter()
                .map(|m| OpenAIChatMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: self.params.temperature,
            max_tokens: self.params.max_tokens,
        };

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let resp = self.check_status(resp).await?;

        let parsed: OpenAIChatResponse = resp.json().await.map_err(|e| CompletionError::Decode {
            provider: self.provider.to_string(),
            detail: e.to_string(),
        })?;
        parsed
            .first_text()
            .ok_or_else(|| CompletionError::Empty(self.provider.to_string()))
    }

    async fn complete_anthropic(&self, key: &str, messages: &[Message]) -> Result<String, CompletionError> {
        // System instructions travel in their own field; the message list may
        // only hold user and assistant turns.
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let request = AnthropicRequest {
            model: self.params.model.clone(),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: self.params.max_tokens,
            temperature: self.params.temperature,
        };

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let resp = self.check_status(resp).await?;

        let parsed: AnthropicResponse = resp.json().await.map_err(|e| CompletionError::Decode {
            provider: self.provider.to_string(),
            detail: e.to_string(),
        })?;
        parsed
            .text()
            .ok_or_else(|| CompletionError::Empty(self.provider.to_string()))
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionClient {
    fn status(&self) -> ProviderStatus {
        match self.api_key {
            Some(_) => ProviderStatus::Ready,
            None => ProviderStatus::Disabled(format!("{} not set", self.provider.api_key_var())),
        }
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, CompletionError> {
        let key = match &self.api_key {
            Some(k) => k.as_str(),
            None => {
                return Err(CompletionError::Disabled(format!(
                    "{} not set",
                    self.provider.api_key_var()
                )))
            }
        };
        match self.provider {
            Provider::Openai => self.complete_openai(key, messages).await,
            Provider::Anthropic => self.complete_anthropic(key, messages).await,
        }
    }
}
