//! In-memory store.
//!
//! One struct implementing every repository trait over shared locked state,
//! used by the test suites and by embedded deployments that do not need
//! durability. Because all traits share one lock, multi-step operations
//! like attendant assignment are naturally atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::automation::{AutomationFlow, AutomationStatus, ExecutionLog};
use crate::flow::config::FlowDefinition;
use crate::flow::session::{Session, SessionStatus};

use super::{
    Attendant, AutomationRepository, Board, Card, Column, Contact, ContactDirectory, Conversation,
    ConversationStatus, ExecutionLogSink, FlowRepository, NewCard, SenderKind, SessionStore,
    StoreError, StoredMessage, TaskBoards,
};

#[derive(Default)]
struct State {
    flows: HashMap<String, FlowDefinition>,
    sessions: HashMap<Uuid, Session>,
    conversations: HashMap<i64, Conversation>,
    contacts: HashMap<i64, Contact>,
    messages: Vec<StoredMessage>,
    tags: HashMap<i64, Vec<String>>,
    attendants: HashMap<i64, Attendant>,
    boards: HashMap<i64, Board>,
    columns: HashMap<i64, Column>,
    cards: HashMap<i64, Card>,
    card_labels: HashMap<i64, Vec<i64>>,
    labels: HashSet<i64>,
    automations: Vec<AutomationFlow>,
    logs: Vec<ExecutionLog>,
    handoffs: Vec<String>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of every storage trait.
pub struct MemoryStore {
    inner: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    // Seeding helpers for tests and embedded setup.

    pub fn seed_flow(&self, flow: FlowDefinition) {
        self.inner.lock().flows.insert(flow.id.clone(), flow);
    }

    pub fn seed_conversation(&self, user_id: i64, phone: &str, contact_id: Option<i64>) -> i64 {
        let mut state = self.inner.lock();
        let id = state.next_id();
        state.conversations.insert(
            id,
            Conversation {
                id,
                user_id,
                contact_id,
                phone: phone.to_string(),
                status: ConversationStatus::Open,
                attendant_id: None,
            },
        );
        state.tags.insert(id, Vec::new());
        id
    }

    pub fn seed_contact(&self, user_id: i64, phone: &str, name: Option<&str>) -> i64 {
        let mut state = self.inner.lock();
        let id = state.next_id();
        state.contacts.insert(
            id,
            Contact {
                id,
                user_id,
                phone: phone.to_string(),
                name: name.map(|n| n.to_string()),
                custom_fields: serde_json::Map::new(),
            },
        );
        id
    }

    pub fn seed_custom_field(&self, contact_id: i64, field: &str, value: &str) {
        let mut state = self.inner.lock();
        if let Some(contact) = state.contacts.get_mut(&contact_id) {
            contact
                .custom_fields
                .insert(field.to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    pub fn seed_message(&self, conversation_id: i64, sender: SenderKind, body: &str) -> i64 {
        self.seed_message_at(conversation_id, sender, body, Utc::now())
    }

    pub fn seed_message_at(
        &self,
        conversation_id: i64,
        sender: SenderKind,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> i64 {
        let mut state = self.inner.lock();
        let id = state.next_id();
        state.messages.push(StoredMessage {
            id,
            conversation_id,
            sender,
            body: body.to_string(),
            sent_at,
        });
        id
    }

    pub fn seed_attendant(&self, user_id: i64, name: &str) -> i64 {
        let mut state = self.inner.lock();
        let id = state.next_id();
        state.attendants.insert(
            id,
            Attendant {
                id,
                user_id,
                name: name.to_string(),
            },
        );
        id
    }

    pub fn seed_label(&self, label_id: i64) -> i64 {
        self.inner.lock().labels.insert(label_id);
        label_id
    }

    pub fn seed_automation(&self, automation: AutomationFlow) {
        self.inner.lock().automations.push(automation);
    }

    /// A minimal active session, for tests that need one already parked.
    pub fn seed_active_session(&self, phone: &str, flow_id: &str) -> Uuid {
        let session = Session {
            id: Uuid::new_v4(),
            flow_id: flow_id.to_string(),
            flow_version: 1,
            contact_id: None,
            phone: phone.to_string(),
            status: SessionStatus::Active,
            current_node: "start".to_string(),
            variables: HashMap::new(),
            last_step_at: Utc::now(),
        };
        let id = session.id;
        self.inner.lock().sessions.insert(id, session);
        id
    }

    // Inspection helpers.

    pub fn session_row(&self, id: Uuid) -> Option<Session> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    pub fn active_session_for(&self, phone: &str) -> Option<Session> {
        self.inner
            .lock()
            .sessions
            .values()
            .find(|s| s.phone == phone && s.status == SessionStatus::Active)
            .cloned()
    }

    pub fn active_session_count(&self, phone: &str) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.phone == phone && s.status == SessionStatus::Active)
            .count()
    }

    pub fn conversation_row(&self, id: i64) -> Option<Conversation> {
        self.inner.lock().conversations.get(&id).cloned()
    }

    pub fn tags_of(&self, conversation_id: i64) -> Vec<String> {
        self.inner
            .lock()
            .tags
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn card(&self, id: i64) -> Option<Card> {
        self.inner.lock().cards.get(&id).cloned()
    }

    pub fn custom_field(&self, contact_id: i64, field: &str) -> Option<String> {
        self.inner
            .lock()
            .contacts
            .get(&contact_id)
            .and_then(|c| c.custom_fields.get(field))
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    pub fn execution_logs(&self) -> Vec<ExecutionLog> {
        self.inner.lock().logs.clone()
    }

    pub fn handoffs(&self) -> Vec<String> {
        self.inner.lock().handoffs.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowRepository for MemoryStore {
    async fn published_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>, StoreError> {
        Ok(self.inner.lock().flows.get(flow_id).cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn active_session(&self, phone: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.active_session_for(phone))
    }

    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        match state.sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {}", session.id))),
        }
    }

    async fn set_status(&self, session_id: Uuid, status: SessionStatus) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        match state.sessions.get_mut(&session_id) {
            Some(session) => {
                session.status = status;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {}", session_id))),
        }
    }

    async fn complete_active_for(&self, phone: &str) -> Result<u64, StoreError> {
        let mut state = self.inner.lock();
        let mut closed = 0;
        for session in state.sessions.values_mut() {
            if session.phone == phone && session.status == SessionStatus::Active {
                session.status = SessionStatus::Completed;
                closed += 1;
            }
        }
        Ok(closed)
    }
}

#[async_trait]
impl ContactDirectory for MemoryStore {
    async fn conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.lock().conversations.get(&id).cloned())
    }

    async fn contact(&self, id: i64) -> Result<Option<Contact>, StoreError> {
        Ok(self.inner.lock().contacts.get(&id).cloned())
    }

    async fn contact_by_phone(
        &self,
        user_id: i64,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        Ok(self
            .inner
            .lock()
            .contacts
            .values()
            .find(|c| c.user_id == user_id && c.phone == phone)
            .cloned())
    }

    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let state = self.inner.lock();
        let mut messages: Vec<StoredMessage> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.sent_at, m.id));
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    async fn inbound_count(
        &self,
        conversation_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.sender == SenderKind::Contact
                    && since.is_none_or(|s| m.sent_at >= s)
            })
            .count() as u64)
    }

    async fn last_reply_at(
        &self,
        conversation_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && matches!(m.sender, SenderKind::Attendant | SenderKind::System)
            })
            .map(|m| m.sent_at)
            .max())
    }

    async fn tags(&self, conversation_id: i64) -> Result<Vec<String>, StoreError> {
        let state = self.inner.lock();
        state
            .tags
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))
    }

    async fn set_tags(&self, conversation_id: i64, tags: &[String]) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        match state.tags.get_mut(&conversation_id) {
            Some(stored) => {
                *stored = tags.to_vec();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "conversation {}",
                conversation_id
            ))),
        }
    }

    async fn attendant(&self, id: i64) -> Result<Option<Attendant>, StoreError> {
        Ok(self.inner.lock().attendants.get(&id).cloned())
    }

    async fn assign_attendant(
        &self,
        conversation_id: i64,
        attendant_id: i64,
    ) -> Result<(), StoreError> {
        // All validation happens before any mutation; under the single lock
        // the whole assignment is atomic, matching the transactional
        // contract of the trait.
        let mut state = self.inner.lock();

        let attendant = state
            .attendants
            .get(&attendant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("attendant {}", attendant_id)))?;

        let conversation = state
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;

        if attendant.user_id != conversation.user_id {
            return Err(StoreError::Conflict(format!(
                "attendant {} belongs to another account",
                attendant_id
            )));
        }

        let phone = conversation.phone.clone();
        if let Some(stored) = state.conversations.get_mut(&conversation_id) {
            stored.attendant_id = Some(attendant_id);
            stored.status = ConversationStatus::Attending;
        }
        for session in state.sessions.values_mut() {
            if session.phone == phone && session.status == SessionStatus::Active {
                session.status = SessionStatus::Completed;
            }
        }
        Ok(())
    }

    async fn open_handoff(&self, phone: &str) -> Result<(), StoreError> {
        self.inner.lock().handoffs.push(phone.to_string());
        Ok(())
    }

    async fn set_custom_field(
        &self,
        contact_id: i64,
        field: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.inner.lock();
        let contact = state
            .contacts
            .get_mut(&contact_id)
            .ok_or_else(|| StoreError::NotFound(format!("contact {}", contact_id)))?;

        let old = match value {
            Some(v) => contact
                .custom_fields
                .insert(field.to_string(), serde_json::Value::String(v.to_string())),
            None => contact.custom_fields.remove(field),
        };
        Ok(old.and_then(|v| v.as_str().map(|s| s.to_string())))
    }
}

#[async_trait]
impl TaskBoards for MemoryStore {
    async fn default_board(&self, user_id: i64) -> Result<Board, StoreError> {
        let mut state = self.inner.lock();
        if let Some(board) = state.boards.values().find(|b| b.user_id == user_id) {
            return Ok(board.clone());
        }

        // First use: create the board with its standard columns.
        let board_id = state.next_id();
        let board = Board {
            id: board_id,
            user_id,
            name: "CRM".to_string(),
        };
        state.boards.insert(board_id, board.clone());
        for (position, name) in ["To do", "Doing", "Done"].iter().enumerate() {
            let column_id = state.next_id();
            state.columns.insert(
                column_id,
                Column {
                    id: column_id,
                    board_id,
                    name: name.to_string(),
                    position: position as i32,
                },
            );
        }
        Ok(board)
    }

    async fn column_owned_by(
        &self,
        column_id: i64,
        user_id: i64,
    ) -> Result<Option<Column>, StoreError> {
        let state = self.inner.lock();
        Ok(state.columns.get(&column_id).cloned().filter(|column| {
            state
                .boards
                .get(&column.board_id)
                .is_some_and(|b| b.user_id == user_id)
        }))
    }

    async fn first_column(&self, board_id: i64) -> Result<Option<Column>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .columns
            .values()
            .filter(|c| c.board_id == board_id)
            .min_by_key(|c| c.position)
            .cloned())
    }

    async fn next_position(&self, column_id: i64) -> Result<i32, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .cards
            .values()
            .filter(|c| c.column_id == column_id)
            .map(|c| c.position + 1)
            .max()
            .unwrap_or(0))
    }

    async fn insert_card(&self, card: NewCard) -> Result<i64, StoreError> {
        let mut state = self.inner.lock();
        if !state.columns.contains_key(&card.column_id) {
            return Err(StoreError::NotFound(format!("column {}", card.column_id)));
        }
        let id = state.next_id();
        state.cards.insert(
            id,
            Card {
                id,
                column_id: card.column_id,
                title: card.title,
                description: card.description,
                position: card.position,
                contact_id: card.contact_id,
            },
        );
        Ok(id)
    }

    async fn attach_label(&self, card_id: i64, label_id: i64) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if !state.labels.contains(&label_id) {
            return Err(StoreError::NotFound(format!("label {}", label_id)));
        }
        state.card_labels.entry(card_id).or_default().push(label_id);
        Ok(())
    }
}

#[async_trait]
impl AutomationRepository for MemoryStore {
    async fn automation(&self, id: &str) -> Result<Option<AutomationFlow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .automations
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn active_automations(&self, user_id: i64) -> Result<Vec<AutomationFlow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .automations
            .iter()
            .filter(|a| a.user_id == user_id && a.status == AutomationStatus::Active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionLogSink for MemoryStore {
    async fn append(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        self.inner.lock().logs.push(log.clone());
        Ok(())
    }
}
