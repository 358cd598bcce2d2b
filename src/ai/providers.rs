//! LLM provider clients.
//!
//! One [`CompletionClient`] interface over four wire formats: OpenAI-style
//! chat completions (also used by Groq), Gemini `generateContent`, and
//! Anthropic messages. All calls go through the retrying HTTP client, which
//! handles the 3-attempt backoff and the 4xx/5xx split.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::http::{HttpError, HttpRequest, RetryingClient};

/// Supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Openai,
    Gemini,
    Anthropic,
    Groq,
}

impl Provider {
    /// Parse a configured provider name; unrecognized values fall back to
    /// OpenAI.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "gemini" | "google" => Provider::Gemini,
            "anthropic" | "claude" => Provider::Anthropic,
            "groq" => Provider::Groq,
            _ => Provider::Openai,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Gemini => "gemini",
            Provider::Anthropic => "anthropic",
            Provider::Groq => "groq",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Provider::Openai => "gpt-4o-mini",
            Provider::Gemini => "gemini-1.5-flash",
            Provider::Anthropic => "claude-3-5-haiku-latest",
            Provider::Groq => "llama-3.1-8b-instant",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who said a history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// One prior conversation turn passed as context.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Everything needed for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub history: Vec<ChatTurn>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(provider: Provider, user_prompt: impl Into<String>) -> Self {
        Self {
            provider,
            model: provider.default_model().to_string(),
            api_key: String::new(),
            system_prompt: None,
            user_prompt: user_prompt.into(),
            history: Vec::new(),
            temperature: 0.7,
            max_tokens: 1024,
            base_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Failures of one completion call.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider returned an empty completion")]
    Empty,
}

/// The single seam the engine and the automation processor call through.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError>;
}

/// HTTP-backed client speaking each provider's wire format.
pub struct HttpCompletionClient {
    http: Arc<RetryingClient>,
}

impl HttpCompletionClient {
    pub fn new(http: Arc<RetryingClient>) -> Self {
        Self { http }
    }

    fn build_request(&self, request: &CompletionRequest) -> HttpRequest {
        match request.provider {
            Provider::Openai => Self::openai_style(request, "https://api.openai.com/v1"),
            Provider::Groq => Self::openai_style(request, "https://api.groq.com/openai/v1"),
            Provider::Anthropic => Self::anthropic(request),
            Provider::Gemini => Self::gemini(request),
        }
    }

    /// OpenAI chat-completions shape, shared verbatim by Groq.
    fn openai_style(request: &CompletionRequest, default_base: &str) -> HttpRequest {
        let base = request.base_url.as_deref().unwrap_or(default_base);
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for turn in &request.history {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": turn.content}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.user_prompt}));

        HttpRequest::post(format!("{}/chat/completions", base))
            .with_header("Authorization", format!("Bearer {}", request.api_key))
            .with_header("Content-Type", "application/json")
            .with_json(serde_json::json!({
                "model": request.model,
                "messages": messages,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }))
            .with_timeout(request.timeout)
    }

    fn anthropic(request: &CompletionRequest) -> HttpRequest {
        let base = request
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com/v1");
        let mut messages = Vec::new();
        for turn in &request.history {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": turn.content}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.user_prompt}));

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = serde_json::Value::String(system.clone());
        }

        HttpRequest::post(format!("{}/messages", base))
            .with_header("x-api-key", request.api_key.clone())
            .with_header("anthropic-version", "2023-06-01")
            .with_header("Content-Type", "application/json")
            .with_json(body)
            .with_timeout(request.timeout)
    }

    fn gemini(request: &CompletionRequest) -> HttpRequest {
        let base = request
            .base_url
            .as_deref()
            .unwrap_or("https://generativelanguage.googleapis.com/v1beta");
        let mut contents = Vec::new();
        for turn in &request.history {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            contents.push(serde_json::json!({
                "role": role,
                "parts": [{"text": turn.content}],
            }));
        }
        contents.push(serde_json::json!({
            "role": "user",
            "parts": [{"text": request.user_prompt}],
        }));

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        });
        if let Some(system) = &request.system_prompt {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
        }

        HttpRequest::post(format!(
            "{}/models/{}:generateContent?key={}",
            base, request.model, request.api_key
        ))
        .with_header("Content-Type", "application/json")
        .with_json(body)
        .with_timeout(request.timeout)
    }

    fn extract_text(provider: Provider, body: &str) -> Result<String, AiError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| AiError::Malformed(format!("invalid JSON: {}", e)))?;

        let text = match provider {
            Provider::Openai | Provider::Groq => value
                .pointer("/choices/0/message/content")
                .and_then(|v| v.as_str()),
            Provider::Anthropic => value.pointer("/content/0/text").and_then(|v| v.as_str()),
            Provider::Gemini => value
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(|v| v.as_str()),
        }
        .ok_or_else(|| AiError::Malformed("completion text missing from response".to_string()))?;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AiError::Empty);
        }
        Ok(trimmed.to_string())
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        let response = self.http.execute(self.build_request(request)).await?;
        Self::extract_text(request.provider, &response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_to_openai() {
        assert_eq!(Provider::parse("gemini"), Provider::Gemini);
        assert_eq!(Provider::parse("Anthropic"), Provider::Anthropic);
        assert_eq!(Provider::parse("groq"), Provider::Groq);
        assert_eq!(Provider::parse("openai"), Provider::Openai);
        assert_eq!(Provider::parse("mystery-llm"), Provider::Openai);
        assert_eq!(Provider::parse(""), Provider::Openai);
    }

    fn request(provider: Provider) -> CompletionRequest {
        let mut req = CompletionRequest::new(provider, "Olá");
        req.api_key = "sk-test".to_string();
        req.system_prompt = Some("Você é um atendente.".to_string());
        req.history = vec![
            ChatTurn { role: Role::User, content: "oi".to_string() },
            ChatTurn { role: Role::Assistant, content: "olá!".to_string() },
        ];
        req
    }

    #[test]
    fn openai_request_shape() {
        let http = HttpCompletionClient::new(Arc::new(RetryingClient::with_defaults()));
        let built = http.build_request(&request(Provider::Openai));
        assert!(built.url.ends_with("/chat/completions"));
        let body = built.body.unwrap();
        let messages = body["messages"].as_array().unwrap();
        // system + 2 history turns + prompt
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[3]["content"], "Olá");
    }

    #[test]
    fn groq_uses_openai_shape_on_groq_host() {
        let http = HttpCompletionClient::new(Arc::new(RetryingClient::with_defaults()));
        let built = http.build_request(&request(Provider::Groq));
        assert!(built.url.starts_with("https://api.groq.com/openai/v1"));
    }

    #[test]
    fn anthropic_request_shape() {
        let http = HttpCompletionClient::new(Arc::new(RetryingClient::with_defaults()));
        let built = http.build_request(&request(Provider::Anthropic));
        assert!(built.url.ends_with("/messages"));
        assert!(built
            .headers
            .iter()
            .any(|(k, v)| k == "anthropic-version" && v == "2023-06-01"));
        let body = built.body.unwrap();
        assert_eq!(body["system"], "Você é um atendente.");
        // system prompt is not a message for Anthropic
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn gemini_request_shape() {
        let http = HttpCompletionClient::new(Arc::new(RetryingClient::with_defaults()));
        let mut req = request(Provider::Gemini);
        req.model = "gemini-1.5-flash".to_string();
        let built = http.build_request(&req);
        assert!(built.url.contains(":generateContent?key=sk-test"));
        let body = built.body.unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn extract_text_per_provider() {
        let openai = r#"{"choices": [{"message": {"role": "assistant", "content": "oi!"}}]}"#;
        assert_eq!(
            HttpCompletionClient::extract_text(Provider::Openai, openai).unwrap(),
            "oi!"
        );

        let anthropic = r#"{"content": [{"type": "text", "text": "olá"}]}"#;
        assert_eq!(
            HttpCompletionClient::extract_text(Provider::Anthropic, anthropic).unwrap(),
            "olá"
        );

        let gemini = r#"{"candidates": [{"content": {"parts": [{"text": "bom dia"}]}}]}"#;
        assert_eq!(
            HttpCompletionClient::extract_text(Provider::Gemini, gemini).unwrap(),
            "bom dia"
        );
    }

    #[test]
    fn extract_text_rejects_garbage() {
        assert!(matches!(
            HttpCompletionClient::extract_text(Provider::Openai, "not json"),
            Err(AiError::Malformed(_))
        ));
        assert!(matches!(
            HttpCompletionClient::extract_text(Provider::Openai, r#"{"choices": []}"#),
            Err(AiError::Malformed(_))
        ));
        assert!(matches!(
            HttpCompletionClient::extract_text(
                Provider::Openai,
                r#"{"choices": [{"message": {"content": "  "}}]}"#
            ),
            Err(AiError::Empty)
        ));
    }
}
