//! Engine settings.
//!
//! Hosts load this as one section of their application config; every field
//! has a default matching the engine's documented behavior.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ai::AiDefaults;

/// Tunables for the flow engine and action executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Pause between consecutive outbound messages so delivery order matches
    /// graph order from the recipient's point of view.
    pub inter_message_delay_ms: u64,

    /// Upper bound on node executions per inbound event; exceeding it fails
    /// the session instead of looping forever on a cyclic graph.
    pub max_steps_per_event: u32,

    /// Default webhook timeout; per-action values are clamped to [1, 60].
    pub webhook_timeout_seconds: u64,

    /// Timeout for AI provider calls.
    pub ai_timeout_seconds: u64,

    /// Sent to the contact when an AI node fails; provider errors are never
    /// forwarded verbatim.
    pub apology_message: String,

    /// Fallback provider/model/key for AI nodes and agents that do not carry
    /// their own.
    pub ai: AiDefaults,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            inter_message_delay_ms: 500,
            max_steps_per_event: 64,
            webhook_timeout_seconds: 10,
            ai_timeout_seconds: 30,
            apology_message:
                "Sorry, I couldn't process that right now. Please try again in a moment."
                    .to_string(),
            ai: AiDefaults::default(),
        }
    }
}

impl EngineSettings {
    pub fn inter_message_delay(&self) -> Duration {
        Duration::from_millis(self.inter_message_delay_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_seconds)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behavior() {
        let settings = EngineSettings::default();
        assert_eq!(settings.inter_message_delay(), Duration::from_millis(500));
        assert_eq!(settings.max_steps_per_event, 64);
        assert_eq!(settings.webhook_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"inter_message_delay_ms": 250}"#).unwrap();
        assert_eq!(settings.inter_message_delay_ms, 250);
        assert_eq!(settings.max_steps_per_event, 64);
    }
}
