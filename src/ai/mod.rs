//! AI agent processing.
//!
//! [`AiProcessor`] prepares the call context for an automation's agent —
//! conversation history, variable substitution — and invokes the configured
//! provider. Provider failures never escape this module: the outcome struct
//! carries the error and the caller decides what it means.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::store::{ContactDirectory, SenderKind};
use crate::template;

pub mod providers;

pub use providers::{
    AiError, ChatTurn, CompletionClient, CompletionRequest, HttpCompletionClient, Provider, Role,
};

/// How many history messages are passed to the provider.
const HISTORY_LIMIT: usize = 10;

/// Fallback provider configuration used when an agent or AI node does not
/// carry its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiDefaults {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AiDefaults {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Per-automation agent configuration, stored with the automation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Transient context for one processing call.
#[derive(Debug, Clone, Default)]
pub struct AiContext {
    pub conversation_id: Option<i64>,
    pub variables: HashMap<String, String>,
}

/// What one processing call produced. `success: false` means the provider
/// call failed after retries; the error text is for logs and audit rows,
/// never for the contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiOutcome {
    pub success: bool,
    pub response: Option<String>,
    pub prompt: Option<String>,
    pub provider: String,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Prepares and executes AI calls for automations.
pub struct AiProcessor {
    client: Arc<dyn CompletionClient>,
    directory: Arc<dyn ContactDirectory>,
    defaults: AiDefaults,
}

impl AiProcessor {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        directory: Arc<dyn ContactDirectory>,
        defaults: AiDefaults,
    ) -> Self {
        Self {
            client,
            directory,
            defaults,
        }
    }

    /// Run the agent against one context. Never returns an error; the
    /// outcome records failure instead.
    pub async fn process(&self, agent: &AgentConfig, ctx: &AiContext) -> AiOutcome {
        let provider = Provider::parse(
            agent
                .provider
                .as_deref()
                .unwrap_or(self.defaults.provider.as_str()),
        );

        let started = Instant::now();

        if !agent.enabled {
            debug!("agent disabled, skipping AI processing");
            return AiOutcome {
                success: true,
                response: None,
                prompt: None,
                provider: provider.to_string(),
                error: None,
                execution_time_ms: 0,
            };
        }

        let history = self.load_history(ctx).await;
        let prompt = template::substitute(&agent.prompt, &ctx.variables);

        let mut request = CompletionRequest::new(provider, prompt.clone());
        if let Some(model) = agent.model.as_deref().filter(|m| !m.is_empty()) {
            request.model = model.to_string();
        } else {
            request.model = self.defaults.model.clone();
        }
        request.api_key = agent
            .api_key
            .clone()
            .or_else(|| self.defaults.api_key.clone())
            .unwrap_or_default();
        request.system_prompt = agent
            .system_prompt
            .as_ref()
            .map(|s| template::substitute(s, &ctx.variables));
        request.history = history;
        request.temperature = agent.temperature.unwrap_or(self.defaults.temperature);
        request.max_tokens = agent.max_tokens.unwrap_or(self.defaults.max_tokens);

        match self.client.complete(&request).await {
            Ok(response) => AiOutcome {
                success: true,
                response: Some(response),
                prompt: Some(prompt),
                provider: provider.to_string(),
                error: None,
                execution_time_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => {
                warn!(provider = %provider, error = %e, "AI provider call failed");
                AiOutcome {
                    success: false,
                    response: None,
                    prompt: Some(prompt),
                    provider: provider.to_string(),
                    error: Some(e.to_string()),
                    execution_time_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    /// Last [`HISTORY_LIMIT`] conversation messages, oldest first. A history
    /// read failure degrades to an empty history rather than failing the
    /// call.
    async fn load_history(&self, ctx: &AiContext) -> Vec<ChatTurn> {
        let Some(conversation_id) = ctx.conversation_id else {
            return Vec::new();
        };
        match self
            .directory
            .recent_messages(conversation_id, HISTORY_LIMIT)
            .await
        {
            Ok(messages) => messages
                .into_iter()
                .map(|m| ChatTurn {
                    role: match m.sender {
                        SenderKind::Contact => Role::User,
                        _ => Role::Assistant,
                    },
                    content: m.body,
                })
                .collect(),
            Err(e) => {
                warn!(conversation_id, error = %e, "failed to load conversation history");
                Vec::new()
            }
        }
    }
}
