//! Messaging gateway interface.
//!
//! The engine never talks to a WhatsApp transport directly; it goes through
//! this trait. Implementations wrap whatever gateway the deployment uses
//! (Evolution, Cloud API, a test double).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors surfaced by a gateway implementation.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("gateway not connected")]
    NotConnected,

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("rate limited: retry after {0}s")]
    RateLimited(u64),
}

/// Media kinds a flow node can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
        };
        f.write_str(s)
    }
}

/// One outbound media message.
#[derive(Debug, Clone)]
pub struct MediaMessage {
    pub kind: MediaKind,
    pub url: String,
    pub caption: Option<String>,
}

/// Provider acknowledgement for a delivered text.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// Outbound messaging operations the engine needs.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send plain text, returning the provider's message id.
    async fn send_text(&self, phone: &str, text: &str) -> Result<SentMessage, GatewayError>;

    /// Send media by URL with an optional caption.
    async fn send_media(&self, phone: &str, media: &MediaMessage) -> Result<(), GatewayError>;

    /// Send an interactive choice message (buttons or a list).
    async fn send_choices(
        &self,
        phone: &str,
        text: &str,
        options: &[String],
    ) -> Result<(), GatewayError>;
}

/// Render choices as numbered plain text, used when the rich send fails.
pub fn numbered_fallback(text: &str, options: &[String]) -> String {
    let mut out = String::from(text.trim_end());
    for (i, option) in options.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!("{}. {}", i + 1, option));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_fallback_lists_options() {
        let rendered = numbered_fallback(
            "Escolha uma opção:",
            &["Vendas".to_string(), "Suporte".to_string()],
        );
        assert_eq!(rendered, "Escolha uma opção:\n1. Vendas\n2. Suporte");
    }

    #[test]
    fn numbered_fallback_without_options_is_just_text() {
        assert_eq!(numbered_fallback("Oi", &[]), "Oi");
    }
}
