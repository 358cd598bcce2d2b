//! Action execution.
//!
//! Runs an ordered action list against one trigger context. Each action is
//! individually isolated: a failure becomes a failed [`ActionResult`] and
//! execution continues with the next action, so one broken side effect can
//! never starve its siblings.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::gateway::{GatewayError, MessagingGateway};
use crate::http::{HttpError, HttpRequest, Method, RetryingClient};
use crate::store::{ContactDirectory, NewCard, StoreError, TaskBoards};
use crate::template;

use super::{Action, ActionContext, ActionResult};

/// Webhook timeouts are clamped to this range.
const WEBHOOK_TIMEOUT_RANGE: (u64, u64) = (1, 60);
const WEBHOOK_TIMEOUT_DEFAULT: u64 = 10;

/// Stored webhook response bodies are cut at this length.
const RESPONSE_EXCERPT_LEN: usize = 500;

/// Internal failure type; every variant ends up as text in a failed result.
#[derive(Debug, thiserror::Error)]
enum ActionError {
    #[error("invalid action config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Executes action lists with per-action error isolation.
pub struct ActionExecutor {
    gateway: Arc<dyn MessagingGateway>,
    directory: Arc<dyn ContactDirectory>,
    boards: Arc<dyn TaskBoards>,
    http: Arc<RetryingClient>,
}

impl ActionExecutor {
    pub fn new(
        gateway: Arc<dyn MessagingGateway>,
        directory: Arc<dyn ContactDirectory>,
        boards: Arc<dyn TaskBoards>,
        http: Arc<RetryingClient>,
    ) -> Self {
        Self {
            gateway,
            directory,
            boards,
            http,
        }
    }

    /// Run every action in order, one result per action.
    pub async fn execute(&self, actions: &[Action], ctx: &ActionContext) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let result = match self.run_action(action, ctx).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(action = action.tag(), error = %e, "action failed");
                    ActionResult::failure(action.tag(), e.to_string())
                }
            };
            results.push(result);
        }
        results
    }

    async fn run_action(
        &self,
        action: &Action,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        match action {
            Action::SendMessage { message } => self.send_message(message, ctx).await,
            Action::AssignAttendant { attendant_id } => {
                self.assign_attendant(*attendant_id, ctx).await
            }
            Action::AddTag { tag, tag_id } => {
                self.change_tag(action.tag(), tag, tag_id, ctx, true).await
            }
            Action::RemoveTag { tag, tag_id } => {
                self.change_tag(action.tag(), tag, tag_id, ctx, false).await
            }
            Action::CreateTask {
                title,
                description,
                column_id,
                labels,
            } => {
                self.create_task(title, description.as_deref(), *column_id, labels, ctx)
                    .await
            }
            Action::Webhook {
                url,
                method,
                timeout_seconds,
            } => self.webhook(url, *method, *timeout_seconds, ctx).await,
            Action::UpdateField { field, value } => {
                self.update_field(field, value.as_deref(), ctx).await
            }
        }
    }

    async fn send_message(
        &self,
        message: &str,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let rendered = template::substitute(message, &ctx.variables);
        if rendered.trim().is_empty() {
            return Err(ActionError::Invalid("message is empty".to_string()));
        }
        if ctx.phone.trim().is_empty() {
            return Err(ActionError::Invalid("no phone to send to".to_string()));
        }
        let sent = self.gateway.send_text(&ctx.phone, &rendered).await?;
        Ok(ActionResult::success("send_message").with_detail("message_id", sent.id))
    }

    async fn assign_attendant(
        &self,
        attendant_id: i64,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let conversation_id = ctx
            .conversation_id
            .ok_or_else(|| ActionError::Invalid("no conversation in context".to_string()))?;
        // The directory performs lookup, conversation update and bot-session
        // closure as one transaction.
        self.directory
            .assign_attendant(conversation_id, attendant_id)
            .await?;
        Ok(ActionResult::success("assign_attendant")
            .with_detail("attendant_id", attendant_id)
            .with_detail("conversation_id", conversation_id))
    }

    async fn change_tag(
        &self,
        action_tag: &str,
        tag: &Option<String>,
        tag_id: &Option<i64>,
        ctx: &ActionContext,
        add: bool,
    ) -> Result<ActionResult, ActionError> {
        let value = tag
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| tag_id.map(|id| id.to_string()))
            .ok_or_else(|| ActionError::Invalid("no tag or tag_id configured".to_string()))?;
        let conversation_id = ctx
            .conversation_id
            .ok_or_else(|| ActionError::Invalid("no conversation in context".to_string()))?;

        let mut tags = self.directory.tags(conversation_id).await?;
        let present = tags.iter().any(|t| t == &value);
        if add && !present {
            tags.push(value.clone());
            self.directory.set_tags(conversation_id, &tags).await?;
        } else if !add && present {
            tags.retain(|t| t != &value);
            self.directory.set_tags(conversation_id, &tags).await?;
        }

        Ok(ActionResult::success(action_tag)
            .with_detail("tag", value)
            .with_detail("tags", tags.len()))
    }

    async fn create_task(
        &self,
        title: &str,
        description: Option<&str>,
        column_id: Option<i64>,
        labels: &[i64],
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let rendered_title = template::substitute(title, &ctx.variables);
        if rendered_title.trim().is_empty() {
            return Err(ActionError::Invalid("task title is empty".to_string()));
        }

        let board = self.boards.default_board(ctx.user_id).await?;
        let column = match column_id {
            Some(id) => self
                .boards
                .column_owned_by(id, ctx.user_id)
                .await?
                .ok_or_else(|| {
                    ActionError::Invalid(format!("column {} does not belong to user", id))
                })?,
            None => self
                .boards
                .first_column(board.id)
                .await?
                .ok_or_else(|| ActionError::Invalid("board has no columns".to_string()))?,
        };

        let position = self.boards.next_position(column.id).await?;
        let card_id = self
            .boards
            .insert_card(NewCard {
                column_id: column.id,
                title: rendered_title,
                description: description.map(|d| template::substitute(d, &ctx.variables)),
                position,
                contact_id: ctx.contact_id,
            })
            .await?;

        // Labels are best-effort: a bad label id is skipped, not fatal.
        let mut attached = 0u32;
        for label_id in labels {
            match self.boards.attach_label(card_id, *label_id).await {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!(card_id, label_id, error = %e, "skipping label");
                }
            }
        }

        Ok(ActionResult::success("create_task")
            .with_detail("card_id", card_id)
            .with_detail("column_id", column.id)
            .with_detail("labels_attached", attached))
    }

    async fn webhook(
        &self,
        url: &str,
        method: Method,
        timeout_seconds: Option<u64>,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        let rendered = template::substitute(url, &ctx.variables);
        let parsed = url::Url::parse(&rendered)
            .map_err(|e| ActionError::Invalid(format!("invalid webhook url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ActionError::Invalid(format!(
                "unsupported url scheme: {}",
                parsed.scheme()
            )));
        }

        let timeout = timeout_seconds
            .unwrap_or(WEBHOOK_TIMEOUT_DEFAULT)
            .clamp(WEBHOOK_TIMEOUT_RANGE.0, WEBHOOK_TIMEOUT_RANGE.1);

        let payload = serde_json::json!({
            "contact": {
                "id": ctx.contact_id,
                "phone": ctx.phone,
            },
            "conversation_id": ctx.conversation_id,
            "message": ctx.message,
            "variables": ctx.variables,
        });

        let request = if method == Method::Get {
            // GET carries the payload as query parameters.
            let mut target = parsed;
            {
                let mut pairs = target.query_pairs_mut();
                pairs.append_pair("phone", &ctx.phone);
                pairs.append_pair("message", &ctx.message);
                for (key, value) in &ctx.variables {
                    pairs.append_pair(key, value);
                }
            }
            HttpRequest::new(Method::Get, target.to_string())
        } else {
            HttpRequest::new(method, parsed.to_string()).with_json(payload)
        }
        .with_timeout(Duration::from_secs(timeout));

        let response = self.http.execute(request).await?;
        let excerpt: String = response.body.chars().take(RESPONSE_EXCERPT_LEN).collect();

        Ok(ActionResult::success("webhook")
            .with_detail("http_status", response.status)
            .with_detail("response", excerpt))
    }

    async fn update_field(
        &self,
        field: &str,
        value: Option<&str>,
        ctx: &ActionContext,
    ) -> Result<ActionResult, ActionError> {
        if field.trim().is_empty() {
            return Err(ActionError::Invalid("field name is empty".to_string()));
        }

        let contact = match ctx.contact_id {
            Some(id) => self.directory.contact(id).await?,
            None => {
                self.directory
                    .contact_by_phone(ctx.user_id, &ctx.phone)
                    .await?
            }
        }
        .ok_or_else(|| ActionError::Invalid("contact not found".to_string()))?;

        let rendered = value
            .map(|v| template::substitute(v, &ctx.variables))
            .filter(|v| !v.is_empty());

        let old = self
            .directory
            .set_custom_field(contact.id, field, rendered.as_deref())
            .await?;

        Ok(ActionResult::success("update_field")
            .with_detail("field", field)
            .with_detail("old", old.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null))
            .with_detail(
                "new",
                rendered.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
            ))
    }
}
