//! Chat-completion gateway used for disambiguation and repository scoring.

pub mod mock;
pub mod openai;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BoxFuture;

pub use openai::{OpenAiCompatibleGateway, Provider};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("model request timed out")]
    Timeout,
    #[error("model request failed: {0}")]
    RequestFailure(String),
    /// The reply arrived but could not be decoded. `raw` keeps the original
    /// text for diagnostics.
    #[error("could not decode model reply: {reason}")]
    DecodeFailure { reason: String, raw: String },
}

impl GatewayError {
    pub fn decode(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        GatewayError::DecodeFailure {
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// `None` uses the gateway's configured temperature.
    pub temperature: Option<f32>,
    /// Ask for `response_format = json_object`.
    pub want_json: bool,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn json(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            messages,
            temperature: Some(temperature),
            want_json: true,
            max_tokens: None,
        }
    }
}

/// An OpenAI-style chat-completion endpoint.
///
/// Implementations are stateless beyond their configuration and safe to call
/// from many tasks at once.
pub trait ModelGateway: Send + Sync {
    /// Model identifier, for logs.
    fn model(&self) -> &str;

    /// Send one chat-completion request and return the assistant message.
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<String, GatewayError>>;
}

/// Remove a Markdown code fence wrapped around a reply.
///
/// Handles a leading ```` ```json ```` or ```` ``` ```` and a trailing
/// ```` ``` ````; anything else is returned trimmed.
pub fn strip_code_fences(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```json") {
        body = rest;
    } else if let Some(rest) = body.strip_prefix("```JSON") {
        body = rest;
    } else if let Some(rest) = body.strip_prefix("```") {
        body = rest;
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }
    body.trim()
}

/// Parse a (possibly fenced) model reply into `T`.
///
/// Missing required fields and malformed JSON both surface as
/// [`GatewayError::DecodeFailure`] carrying the raw reply.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, GatewayError> {
    serde_json::from_str(strip_code_fences(raw)).map_err(|e| GatewayError::decode(e.to_string(), raw))
}

/// JSON-mode completion decoded into an untyped value.
pub async fn complete_json(
    gateway: &dyn ModelGateway,
    messages: Vec<ChatMessage>,
    temperature: f32,
) -> Result<serde_json::Value, GatewayError> {
    complete_typed(gateway, messages, temperature).await
}

/// JSON-mode completion decoded into an explicit result type.
pub async fn complete_typed<T: DeserializeOwned>(
    gateway: &dyn ModelGateway,
    messages: Vec<ChatMessage>,
    temperature: f32,
) -> Result<T, GatewayError> {
    let request = CompletionRequest::json(messages, temperature);
    let raw = gateway.complete(&request).await?;
    let decoded = decode_json(&raw);
    if let Err(GatewayError::DecodeFailure { reason, .. }) = &decoded {
        let preview: String = raw.chars().take(200).collect();
        tracing::warn!(model = gateway.model(), %reason, raw = %preview, "model reply did not decode");
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pick {
        selected: Option<String>,
        #[serde(default)]
        reason: String,
    }

    #[test]
    fn fences_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn fenced_null_selection_decodes() {
        let pick: Pick = decode_json("```json\n{\"selected\":null}\n```").unwrap();
        assert_eq!(
            pick,
            Pick {
                selected: None,
                reason: String::new()
            }
        );
    }

    #[test]
    fn malformed_reply_keeps_raw() {
        let err = decode_json::<Pick>("not json at all").unwrap_err();
        match err {
            GatewayError::DecodeFailure { raw, .. } => assert_eq!(raw, "not json at all"),
            other => panic!("expected DecodeFailure, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_decode_failure() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Strict {
            overall_score: f64,
        }
        let err = decode_json::<Strict>("{\"reasons\": []}").unwrap_err();
        assert!(matches!(err, GatewayError::DecodeFailure { .. }));
    }

    #[tokio::test]
    async fn complete_typed_requests_json_mode() {
        let gateway = MockGateway::new(Ok("{\"selected\": \"2\", \"reason\": \"r\"}".into()));
        let pick: Pick = complete_typed(&gateway, vec![ChatMessage::user("hi")], 0.1)
            .await
            .unwrap();
        assert_eq!(pick.selected.as_deref(), Some("2"));
        let requests = gateway.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].want_json);
        assert_eq!(requests[0].temperature, Some(0.1));
    }

    #[tokio::test]
    async fn complete_json_propagates_transport_error() {
        let gateway = MockGateway::new(Err(GatewayError::Timeout));
        let err = complete_json(&gateway, vec![ChatMessage::user("hi")], 0.1)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout);
    }
}
