//! Storage interfaces.
//!
//! The engine's core logic is storage-agnostic: every persistent concern is
//! reached through one of the traits below. [`memory`] provides fakes for
//! tests and embedded use; [`sqlite`] persists the two stores the engine
//! owns outright (sessions and execution logs).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::{AutomationFlow, ExecutionLog};
use crate::flow::config::FlowDefinition;
use crate::flow::session::{Session, SessionStatus};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors surfaced by any repository implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Conversation lifecycle as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Attending,
    Closed,
}

/// One WhatsApp conversation row.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub user_id: i64,
    pub contact_id: Option<i64>,
    pub phone: String,
    pub status: ConversationStatus,
    pub attendant_id: Option<i64>,
}

/// A stored contact with its free-form custom fields.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: i64,
    pub user_id: i64,
    pub phone: String,
    pub name: Option<String>,
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
}

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// The WhatsApp contact (inbound).
    Contact,
    /// A human attendant.
    Attendant,
    /// The bot itself.
    Bot,
    /// System notices.
    System,
}

/// One message in a conversation's history.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub sender: SenderKind,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// A human attendant available for assignment.
#[derive(Debug, Clone)]
pub struct Attendant {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

/// A kanban board.
#[derive(Debug, Clone)]
pub struct Board {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

/// A column on a board, ordered by `position`.
#[derive(Debug, Clone)]
pub struct Column {
    pub id: i64,
    pub board_id: i64,
    pub name: String,
    pub position: i32,
}

/// Payload for inserting a card.
#[derive(Debug, Clone)]
pub struct NewCard {
    pub column_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub position: i32,
    pub contact_id: Option<i64>,
}

/// A stored kanban card.
#[derive(Debug, Clone)]
pub struct Card {
    pub id: i64,
    pub column_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub position: i32,
    pub contact_id: Option<i64>,
}

/// Read access to published flow graphs. Flows are authored elsewhere; the
/// engine only ever reads them.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn published_flow(&self, flow_id: &str) -> Result<Option<FlowDefinition>, StoreError>;
}

/// Persistence for per-contact bot sessions. Sessions are owned exclusively
/// by the flow engine.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The single active session for a phone, if any.
    async fn active_session(&self, phone: &str) -> Result<Option<Session>, StoreError>;

    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    /// Persist cursor, variables, status and timestamp.
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    async fn set_status(&self, session_id: Uuid, status: SessionStatus) -> Result<(), StoreError>;

    /// Atomically complete every active session for a phone, returning how
    /// many were closed. This is the takeover step that upholds the
    /// one-active-session-per-contact invariant; implementations must make
    /// it a single atomic update, not a read-then-write.
    async fn complete_active_for(&self, phone: &str) -> Result<u64, StoreError>;
}

/// Read/write access to contacts, conversations and their history.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError>;

    async fn contact(&self, id: i64) -> Result<Option<Contact>, StoreError>;

    async fn contact_by_phone(&self, user_id: i64, phone: &str)
        -> Result<Option<Contact>, StoreError>;

    /// The last `limit` messages of a conversation, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Count inbound (contact-sent) messages, optionally only those at or
    /// after `since`.
    async fn inbound_count(
        &self,
        conversation_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError>;

    /// Timestamp of the most recent attendant/system message, if any.
    async fn last_reply_at(
        &self,
        conversation_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn tags(&self, conversation_id: i64) -> Result<Vec<String>, StoreError>;

    async fn set_tags(&self, conversation_id: i64, tags: &[String]) -> Result<(), StoreError>;

    async fn attendant(&self, id: i64) -> Result<Option<Attendant>, StoreError>;

    /// Assign an attendant to a conversation. Implementations must perform
    /// the attendant lookup, the conversation update and the closing of any
    /// active bot session for the conversation's phone as one transaction,
    /// rolling back entirely on failure.
    async fn assign_attendant(
        &self,
        conversation_id: i64,
        attendant_id: i64,
    ) -> Result<(), StoreError>;

    /// Escalate the contact to the human-attendance queue.
    async fn open_handoff(&self, phone: &str) -> Result<(), StoreError>;

    /// Set (`Some`) or delete (`None`) one custom field on a contact,
    /// returning the previous value.
    async fn set_custom_field(
        &self,
        contact_id: i64,
        field: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, StoreError>;
}

/// Kanban storage for the `create_task` action.
#[async_trait]
pub trait TaskBoards: Send + Sync {
    /// The user's default board, created with its standard columns on first
    /// use.
    async fn default_board(&self, user_id: i64) -> Result<Board, StoreError>;

    /// A column by id, only if it belongs to one of the user's boards.
    async fn column_owned_by(
        &self,
        column_id: i64,
        user_id: i64,
    ) -> Result<Option<Column>, StoreError>;

    /// First column of a board by position.
    async fn first_column(&self, board_id: i64) -> Result<Option<Column>, StoreError>;

    /// Next free card position within a column.
    async fn next_position(&self, column_id: i64) -> Result<i32, StoreError>;

    async fn insert_card(&self, card: NewCard) -> Result<i64, StoreError>;

    /// Attach a label to a card; errors when the label does not exist.
    async fn attach_label(&self, card_id: i64, label_id: i64) -> Result<(), StoreError>;
}

/// Read access to configured automations.
#[async_trait]
pub trait AutomationRepository: Send + Sync {
    async fn automation(&self, id: &str) -> Result<Option<AutomationFlow>, StoreError>;

    async fn active_automations(&self, user_id: i64) -> Result<Vec<AutomationFlow>, StoreError>;
}

/// Append-only audit sink; one row per automation run.
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    async fn append(&self, log: &ExecutionLog) -> Result<(), StoreError>;
}
