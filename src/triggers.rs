//! Trigger evaluation.
//!
//! Decides whether a configured trigger fires for one inbound message.
//! Every evaluator fails closed: malformed configuration and repository
//! errors produce `false` plus a structured warning, never an error the
//! caller has to handle.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::store::ContactDirectory;

/// Keyword lists are stored either as a JSON array or as one
/// comma-separated string; both shapes are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordList {
    Many(Vec<String>),
    Joined(String),
}

impl KeywordList {
    pub fn values(&self) -> Vec<String> {
        match self {
            KeywordList::Many(items) => items
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            KeywordList::Joined(joined) => joined
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

/// Trigger types and their configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fires when the message contains any configured keyword.
    Keyword { keywords: KeywordList },

    /// Fires on the contact's first inbound message, optionally only
    /// counting messages within a recency window.
    FirstMessage {
        #[serde(default)]
        window_seconds: Option<i64>,
    },

    /// Fires when the message arrives outside business hours.
    OffHours {
        start: String,
        end: String,
        timezone: String,
    },

    /// Fires when nobody has replied for more than `minutes`.
    NoResponse { minutes: i64 },

    /// Fired only by explicit request; never auto-fires.
    Manual,

    /// Trigger type this engine version does not recognize.
    #[serde(other)]
    Other,
}

impl TriggerKind {
    pub fn tag(&self) -> &'static str {
        match self {
            TriggerKind::Keyword { .. } => "keyword",
            TriggerKind::FirstMessage { .. } => "first_message",
            TriggerKind::OffHours { .. } => "off_hours",
            TriggerKind::NoResponse { .. } => "no_response",
            TriggerKind::Manual => "manual",
            TriggerKind::Other => "other",
        }
    }
}

/// Transient evaluation context for one inbound message; never persisted.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub user_id: i64,
    pub conversation_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub phone: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

impl TriggerContext {
    pub fn new(user_id: i64, phone: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id,
            conversation_id: None,
            contact_id: None,
            phone: phone.into(),
            message: message.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_conversation(mut self, id: i64) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.received_at = when;
        self
    }
}

/// Parse `HH:MM` into minute-of-day.
fn parse_hhmm(raw: &str) -> Option<u32> {
    let (h, m) = raw.trim().split_once(':')?;
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

/// Stateless trigger evaluator over a read-only directory.
pub struct TriggerEvaluator {
    directory: Arc<dyn ContactDirectory>,
}

impl TriggerEvaluator {
    pub fn new(directory: Arc<dyn ContactDirectory>) -> Self {
        Self { directory }
    }

    /// Whether `trigger` fires for `ctx`.
    pub async fn evaluate(&self, trigger: &TriggerKind, ctx: &TriggerContext) -> bool {
        match trigger {
            TriggerKind::Keyword { keywords } => self.keyword(keywords, ctx),
            TriggerKind::FirstMessage { window_seconds } => {
                self.first_message(*window_seconds, ctx).await
            }
            TriggerKind::OffHours {
                start,
                end,
                timezone,
            } => self.off_hours(start, end, timezone, ctx.received_at),
            TriggerKind::NoResponse { minutes } => self.no_response(*minutes, ctx).await,
            TriggerKind::Manual => false,
            TriggerKind::Other => {
                warn!("unsupported trigger type, not firing");
                false
            }
        }
    }

    fn keyword(&self, keywords: &KeywordList, ctx: &TriggerContext) -> bool {
        let message = ctx.message.to_lowercase();
        let values = keywords.values();
        if values.is_empty() {
            warn!("keyword trigger with no keywords configured");
            return false;
        }
        values.iter().any(|k| message.contains(&k.to_lowercase()))
    }

    async fn first_message(&self, window_seconds: Option<i64>, ctx: &TriggerContext) -> bool {
        let Some(conversation_id) = ctx.conversation_id else {
            warn!(trigger = "first_message", "no conversation in context");
            return false;
        };
        let since = window_seconds
            .filter(|s| *s > 0)
            .map(|s| ctx.received_at - Duration::seconds(s));
        match self.directory.inbound_count(conversation_id, since).await {
            // Exactly one inbound message: the one being evaluated.
            Ok(count) => count == 1,
            Err(e) => {
                warn!(trigger = "first_message", error = %e, "history query failed");
                false
            }
        }
    }

    /// Within-hours is `t >= start || t < end` for overnight windows
    /// (`start > end`) and `start <= t < end` otherwise; the trigger fires
    /// when the message falls outside.
    fn off_hours(&self, start: &str, end: &str, timezone: &str, at: DateTime<Utc>) -> bool {
        let Ok(tz) = timezone.parse::<chrono_tz::Tz>() else {
            warn!(trigger = "off_hours", timezone, "unknown timezone");
            return false;
        };
        let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
            warn!(trigger = "off_hours", "invalid HH:MM bounds");
            return false;
        };

        let local = at.with_timezone(&tz);
        let minute_of_day = local.hour() * 60 + local.minute();

        let within = if start > end {
            minute_of_day >= start || minute_of_day < end
        } else {
            minute_of_day >= start && minute_of_day < end
        };
        !within
    }

    async fn no_response(&self, minutes: i64, ctx: &TriggerContext) -> bool {
        if minutes <= 0 {
            warn!(trigger = "no_response", minutes, "threshold must be positive");
            return false;
        }
        let Some(conversation_id) = ctx.conversation_id else {
            warn!(trigger = "no_response", "no conversation in context");
            return false;
        };
        match self.directory.last_reply_at(conversation_id).await {
            // Nothing has ever been answered.
            Ok(None) => true,
            Ok(Some(replied_at)) => (ctx.received_at - replied_at).num_minutes() > minutes,
            Err(e) => {
                warn!(trigger = "no_response", error = %e, "history query failed");
                false
            }
        }
    }
}
