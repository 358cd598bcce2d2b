//! Automation actions.
//!
//! The side-effecting operations an automation can run after its trigger
//! fires, plus the per-action audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::http::Method;

pub mod executor;

pub use executor::ActionExecutor;

fn default_webhook_method() -> Method {
    Method::Post
}

/// One configured action. The tag is the action's `type` in the stored
/// automation document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Send a templated text to the contact.
    SendMessage { message: String },

    /// Assign the conversation to a human attendant and close the bot
    /// session.
    AssignAttendant { attendant_id: i64 },

    /// Add a tag to the conversation (no-op if already present).
    AddTag {
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        tag_id: Option<i64>,
    },

    /// Remove a tag from the conversation (no-op if absent).
    RemoveTag {
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        tag_id: Option<i64>,
    },

    /// Create a kanban card for the contact.
    CreateTask {
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        column_id: Option<i64>,
        #[serde(default)]
        labels: Vec<i64>,
    },

    /// Call an external URL with a structured payload.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_method")]
        method: Method,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },

    /// Set or clear one custom field on the contact.
    UpdateField {
        field: String,
        #[serde(default)]
        value: Option<String>,
    },
}

impl Action {
    /// The `type` tag, for results and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Action::SendMessage { .. } => "send_message",
            Action::AssignAttendant { .. } => "assign_attendant",
            Action::AddTag { .. } => "add_tag",
            Action::RemoveTag { .. } => "remove_tag",
            Action::CreateTask { .. } => "create_task",
            Action::Webhook { .. } => "webhook",
            Action::UpdateField { .. } => "update_field",
        }
    }
}

/// Outcome of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
}

/// Audit record for one executed action; written once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(rename = "type")]
    pub action: String,
    pub status: ActionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Type-specific fields: message id, card id, old/new values, …
    #[serde(flatten)]
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl ActionResult {
    pub fn success(action: &str) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Success,
            timestamp: Utc::now(),
            error: None,
            detail: serde_json::Map::new(),
        }
    }

    pub fn failure(action: &str, error: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Failed,
            timestamp: Utc::now(),
            error: Some(error.into()),
            detail: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn ok(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Context one action list executes against: the triggering message plus
/// the substitution variables assembled by the automation engine.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub user_id: i64,
    pub conversation_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub phone: String,
    pub message: String,
    pub variables: HashMap<String, String>,
}

impl ActionContext {
    pub fn new(user_id: i64, phone: impl Into<String>, message: impl Into<String>) -> Self {
        let phone = phone.into();
        let message = message.into();
        let mut variables = HashMap::new();
        variables.insert("phone".to_string(), phone.clone());
        variables.insert("message".to_string(), message.clone());
        Self {
            user_id,
            conversation_id: None,
            contact_id: None,
            phone,
            message,
            variables,
        }
    }

    pub fn with_conversation(mut self, id: i64) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn with_contact(mut self, id: i64) -> Self {
        self.contact_id = Some(id);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_deserializes_from_tagged_json() {
        let action: Action = serde_json::from_str(
            r#"{"type": "webhook", "url": "https://example.com", "timeout_seconds": 5}"#,
        )
        .unwrap();
        match action {
            Action::Webhook { method, timeout_seconds, .. } => {
                assert_eq!(method, Method::Post);
                assert_eq!(timeout_seconds, Some(5));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn result_serializes_detail_inline() {
        let result = ActionResult::success("send_message").with_detail("message_id", "abc");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "send_message");
        assert_eq!(json["status"], "success");
        assert_eq!(json["message_id"], "abc");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn context_seeds_phone_and_message_variables() {
        let ctx = ActionContext::new(1, "5511999990000", "oi");
        assert_eq!(ctx.variables.get("phone").unwrap(), "5511999990000");
        assert_eq!(ctx.variables.get("message").unwrap(), "oi");
    }
}
