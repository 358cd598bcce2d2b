//! Per-contact flow sessions.
//!
//! A session is the persisted cursor of one contact's walk through a flow:
//! which node it is parked on, the variables collected so far, and the
//! lifecycle status. Sessions are terminated, never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::config::FlowDefinition;

/// Session lifecycle. `Active` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one contact's traversal through a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub flow_id: String,
    pub flow_version: u32,
    pub contact_id: Option<i64>,
    pub phone: String,
    pub status: SessionStatus,
    pub current_node: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub last_step_at: DateTime<Utc>,
}

impl Session {
    /// A fresh active session parked on the flow's start node.
    pub fn new(
        flow: &FlowDefinition,
        phone: impl Into<String>,
        contact_id: Option<i64>,
        start_node: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id: flow.id.clone(),
            flow_version: flow.version,
            contact_id,
            phone: phone.into(),
            status: SessionStatus::Active,
            current_node: start_node.into(),
            variables: HashMap::new(),
            last_step_at: Utc::now(),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Refresh the step timestamp.
    pub fn touch(&mut self) {
        self.last_step_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::config::FlowDefinition;

    #[test]
    fn new_session_is_active_on_start_node() {
        let flow = FlowDefinition::new("f1", "welcome");
        let session = Session::new(&flow, "5511999990000", Some(7), "start");
        assert!(session.is_active());
        assert_eq!(session.current_node, "start");
        assert_eq!(session.flow_id, "f1");
        assert_eq!(session.contact_id, Some(7));
        assert!(session.variables.is_empty());
    }

    #[test]
    fn variables_round_trip() {
        let flow = FlowDefinition::new("f1", "welcome");
        let mut session = Session::new(&flow, "5511999990000", None, "start");
        session.set_variable("nome", "Ana");
        assert_eq!(session.variable("nome"), Some("Ana"));
        assert_eq!(session.variable("missing"), None);
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("archived"), None);
    }
}
