//! OpenAI-compatible chat-completion client.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ChatMessage, CompletionRequest, GatewayError, ModelGateway};
use crate::backoff::{BackoffPolicy, Step};
use crate::{BoxFuture, CoreError};

/// Hosted providers speaking the OpenAI chat-completions protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Alibaba Cloud Model Studio (Qwen), compatible mode.
    #[default]
    Aliyun,
    Zenmux,
    Openai,
    Deepseek,
    Moonshot,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Aliyun,
        Provider::Zenmux,
        Provider::Openai,
        Provider::Deepseek,
        Provider::Moonshot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Provider::Aliyun => "aliyun",
            Provider::Zenmux => "zenmux",
            Provider::Openai => "openai",
            Provider::Deepseek => "deepseek",
            Provider::Moonshot => "moonshot",
        }
    }

    /// Base URL; `/chat/completions` is appended per request.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::Aliyun => "https://dashscope.aliyuncs.com/compatible-mode/v1",
            Provider::Zenmux => "https://zenmux.ai/v1",
            Provider::Openai => "https://api.openai.com/v1",
            Provider::Deepseek => "https://api.deepseek.com/v1",
            Provider::Moonshot => "https://api.moonshot.cn/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Aliyun => "qwen-plus",
            Provider::Zenmux => "gemini-3-pro-preview-free",
            Provider::Openai => "gpt-4o-mini",
            Provider::Deepseek => "deepseek-chat",
            Provider::Moonshot => "moonshot-v1-8k",
        }
    }

    /// Environment variable holding the provider's API key.
    pub fn api_key_env(self) -> &'static str {
        match self {
            Provider::Aliyun => "ALIYUN_API_KEY",
            Provider::Zenmux => "ZENMUX_API_KEY",
            Provider::Openai => "OPENAI_API_KEY",
            Provider::Deepseek => "DEEPSEEK_API_KEY",
            Provider::Moonshot => "MOONSHOT_API_KEY",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.name() == lower)
            .ok_or_else(|| {
                let known: Vec<_> = Provider::ALL.iter().map(|p| p.name()).collect();
                format!("unknown LLM provider '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Model gateway settings.
#[derive(Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: Provider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl LlmConfig {
    /// Defaults for `provider`, without an API key.
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            provider,
            api_key: None,
            base_url: provider.default_base_url().to_string(),
            model: provider.default_model().to_string(),
            timeout_secs: 30,
            max_retries: 3,
            temperature: 0.2,
            max_tokens: None,
        }
    }

    /// Switch to `provider`'s endpoint and model, keeping tuning values.
    /// The API key is dropped when the provider actually changes.
    pub fn switch_provider(&mut self, provider: Provider) {
        if provider == self.provider {
            return;
        }
        self.provider = provider;
        self.api_key = None;
        self.base_url = provider.default_base_url().to_string();
        self.model = provider.default_model().to_string();
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::for_provider(Provider::default())
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Pull the first assistant message out of a chat-completions body.
pub fn extract_content(body: &str) -> Result<String, GatewayError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| GatewayError::decode(e.to_string(), body))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| GatewayError::decode("reply has no message content", body))
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::RequestFailure(e.to_string())
    }
}

pub struct OpenAiCompatibleGateway {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: String,
    backoff: BackoffPolicy,
}

impl OpenAiCompatibleGateway {
    /// Fails when no API key is configured.
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Result<Self, CoreError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "no API key for LLM provider '{}' (set {})",
                    config.provider,
                    config.provider.api_key_env()
                ))
            })?;
        let backoff = BackoffPolicy::new(config.max_retries, Duration::from_secs(1));
        Ok(Self {
            client,
            config,
            api_key,
            backoff,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn attempt(&self, url: &str, body: &ChatBody<'_>) -> Step<String, GatewayError> {
        let resp = match self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Step::retry(transport_error(e)),
        };

        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => return Step::retry(transport_error(e)),
        };

        if !status.is_success() {
            let preview: String = text.chars().take(200).collect();
            return Step::retry(GatewayError::RequestFailure(format!(
                "HTTP {status}: {preview}"
            )));
        }

        Step::Done(extract_content(&text))
    }
}

impl ModelGateway for OpenAiCompatibleGateway {
    fn model(&self) -> &str {
        &self.config.model
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<String, GatewayError>> {
        Box::pin(async move {
            let url = self.endpoint();
            let body = ChatBody {
                model: &self.config.model,
                messages: &request.messages,
                temperature: request.temperature.unwrap_or(self.config.temperature),
                max_tokens: request.max_tokens.or(self.config.max_tokens),
                response_format: request.want_json.then_some(ResponseFormat {
                    kind: "json_object",
                }),
            };
            tracing::debug!(
                model = %self.config.model,
                messages = request.messages.len(),
                json = request.want_json,
                "model request"
            );
            self.backoff
                .run("model gateway", |_| self.attempt(&url, &body))
                .await
        })
    }
}
