//! SQLite store.
//!
//! Durable implementation of the two stores the engine owns outright:
//! bot sessions and execution logs. Everything else (contacts,
//! conversations, boards) lives in the host application's database behind
//! the directory traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::automation::ExecutionLog;
use crate::flow::session::{Session, SessionStatus};

use super::{ExecutionLogSink, SessionStore, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// SQLite-backed session store and execution log sink.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connect and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// In-memory database, mostly for tests. A single connection keeps the
    /// database alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_sessions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                flow_version INTEGER NOT NULL,
                contact_id INTEGER,
                phone TEXT NOT NULL,
                status TEXT NOT NULL,
                current_node TEXT NOT NULL,
                variables TEXT NOT NULL,
                last_step_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bot_sessions_phone_status
            ON bot_sessions (phone, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                conversation_id INTEGER,
                trigger_payload TEXT NOT NULL,
                ai_prompt TEXT,
                ai_response TEXT,
                action_results TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                started_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_session(row: &SqliteRow) -> Result<Session, StoreError> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| StoreError::Backend(format!("bad session id {}: {}", id, e)))?;

    let status: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(format!("bad session status {}", status)))?;

    let variables: String = row.try_get("variables")?;
    let variables = serde_json::from_str(&variables)
        .map_err(|e| StoreError::Backend(format!("bad variables payload: {}", e)))?;

    let last_step_at: DateTime<Utc> = row.try_get("last_step_at")?;

    Ok(Session {
        id,
        flow_id: row.try_get("flow_id")?,
        flow_version: row.try_get::<i64, _>("flow_version")? as u32,
        contact_id: row.try_get("contact_id")?,
        phone: row.try_get("phone")?,
        status,
        current_node: row.try_get("current_node")?,
        variables,
        last_step_at,
    })
}

fn variables_json(session: &Session) -> Result<String, StoreError> {
    serde_json::to_string(&session.variables)
        .map_err(|e| StoreError::Backend(format!("variables not serializable: {}", e)))
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn active_session(&self, phone: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, flow_id, flow_version, contact_id, phone, status,
                   current_node, variables, last_step_at
            FROM bot_sessions
            WHERE phone = ?1 AND status = 'active'
            ORDER BY last_step_at DESC
            LIMIT 1
            "#,
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bot_sessions
                (id, flow_id, flow_version, contact_id, phone, status,
                 current_node, variables, last_step_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.flow_id)
        .bind(session.flow_version as i64)
        .bind(session.contact_id)
        .bind(&session.phone)
        .bind(session.status.as_str())
        .bind(&session.current_node)
        .bind(variables_json(session)?)
        .bind(session.last_step_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bot_sessions
            SET status = ?2, current_node = ?3, variables = ?4, last_step_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.status.as_str())
        .bind(&session.current_node)
        .bind(variables_json(session)?)
        .bind(session.last_step_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    async fn set_status(&self, session_id: Uuid, status: SessionStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE bot_sessions SET status = ?2 WHERE id = ?1")
            .bind(session_id.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }

    async fn complete_active_for(&self, phone: &str) -> Result<u64, StoreError> {
        // One statement, so two racing messages cannot both observe an
        // active session.
        let result = sqlx::query(
            "UPDATE bot_sessions SET status = 'completed' WHERE phone = ?1 AND status = 'active'",
        )
        .bind(phone)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExecutionLogSink for SqliteStore {
    async fn append(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        let action_results = serde_json::to_string(&log.action_results)
            .map_err(|e| StoreError::Backend(format!("action results not serializable: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO execution_logs
                (id, automation_id, user_id, conversation_id, trigger_payload,
                 ai_prompt, ai_response, action_results, status, error,
                 started_at, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(log.id.to_string())
        .bind(&log.automation_id)
        .bind(log.user_id)
        .bind(log.conversation_id)
        .bind(log.trigger_payload.to_string())
        .bind(&log.ai_prompt)
        .bind(&log.ai_response)
        .bind(action_results)
        .bind(log.status.as_str())
        .bind(&log.error)
        .bind(log.started_at)
        .bind(log.duration_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionResult;
    use crate::automation::RunStatus;
    use crate::flow::config::FlowDefinition;

    fn session(phone: &str) -> Session {
        let flow = FlowDefinition::new("flow-1", "test");
        Session::new(&flow, phone, Some(7), "start")
    }

    #[tokio::test]
    async fn create_and_load_active_session() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut original = session("5511999990000");
        original.set_variable("nome", "Ana");
        store.create(&original).await.unwrap();

        let loaded = store
            .active_session("5511999990000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.flow_id, "flow-1");
        assert_eq!(loaded.contact_id, Some(7));
        assert_eq!(loaded.variable("nome"), Some("Ana"));
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn save_persists_cursor_and_variables() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut s = session("5511999990000");
        store.create(&s).await.unwrap();

        s.current_node = "menu".to_string();
        s.set_variable("idade", "42");
        store.save(&s).await.unwrap();

        let loaded = store
            .active_session("5511999990000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.current_node, "menu");
        assert_eq!(loaded.variable("idade"), Some("42"));
    }

    #[tokio::test]
    async fn save_unknown_session_is_not_found() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store.save(&session("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn complete_active_for_closes_only_that_phone() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create(&session("5511999990000")).await.unwrap();
        store.create(&session("5511999990000")).await.unwrap();
        store.create(&session("5511888880000")).await.unwrap();

        let closed = store.complete_active_for("5511999990000").await.unwrap();
        assert_eq!(closed, 2);

        assert!(store
            .active_session("5511999990000")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .active_session("5511888880000")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn terminal_sessions_are_kept_not_deleted() {
        let store = SqliteStore::in_memory().await.unwrap();
        let s = session("5511999990000");
        store.create(&s).await.unwrap();
        store
            .set_status(s.id, SessionStatus::Completed)
            .await
            .unwrap();

        // no longer active, but still present (status update succeeds again)
        assert!(store
            .active_session("5511999990000")
            .await
            .unwrap()
            .is_none());
        store.set_status(s.id, SessionStatus::Failed).await.unwrap();
    }

    #[tokio::test]
    async fn sessions_survive_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("zapflow.db").display()
        );

        let store = SqliteStore::connect(&url).await.unwrap();
        let s = session("5511999990000");
        store.create(&s).await.unwrap();
        drop(store);

        let reopened = SqliteStore::connect(&url).await.unwrap();
        let loaded = reopened
            .active_session("5511999990000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, s.id);
    }

    #[tokio::test]
    async fn execution_log_appends() {
        let store = SqliteStore::in_memory().await.unwrap();
        let log = ExecutionLog {
            id: Uuid::new_v4(),
            automation_id: "auto-1".to_string(),
            user_id: 1,
            conversation_id: Some(5),
            trigger_payload: serde_json::json!({"type": "keyword"}),
            ai_prompt: Some("p".to_string()),
            ai_response: None,
            action_results: vec![ActionResult::success("send_message")],
            status: RunStatus::Success,
            error: None,
            started_at: Utc::now(),
            duration_ms: 12,
        };
        store.append(&log).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM execution_logs")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let status: String = sqlx::query_scalar("SELECT status FROM execution_logs")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(status, "success");
    }
}
