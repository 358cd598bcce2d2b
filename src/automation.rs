//! One-shot automations.
//!
//! An automation is a trigger, an optional AI agent and an ordered action
//! list — no graph, no session. The engine evaluates the trigger for each
//! inbound message, runs the agent and the actions when it fires, and
//! appends exactly one audit row per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use tracing::{debug, info, warn};

use crate::actions::{Action, ActionContext, ActionExecutor, ActionResult};
use crate::ai::{AgentConfig, AiContext, AiProcessor};
use crate::store::{AutomationRepository, ContactDirectory, ExecutionLogSink};
use crate::triggers::{TriggerContext, TriggerEvaluator, TriggerKind};

/// Whether an automation is eligible to run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Active,
    Inactive,
}

/// One configured automation. Read-only to the engine; authored elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationFlow {
    pub id: String,
    pub user_id: i64,
    pub name: String,
    pub status: AutomationStatus,
    pub trigger: TriggerKind,
    #[serde(default)]
    pub agent: Option<AgentConfig>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Outcome recorded for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// Append-only audit record of one automation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub automation_id: String,
    pub user_id: i64,
    pub conversation_id: Option<i64>,
    pub trigger_payload: serde_json::Value,
    pub ai_prompt: Option<String>,
    pub ai_response: Option<String>,
    pub action_results: Vec<ActionResult>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Orchestrates trigger evaluation, AI processing and action execution.
pub struct AutomationEngine {
    automations: Arc<dyn AutomationRepository>,
    directory: Arc<dyn ContactDirectory>,
    triggers: TriggerEvaluator,
    ai: AiProcessor,
    executor: ActionExecutor,
    logs: Arc<dyn ExecutionLogSink>,
}

impl AutomationEngine {
    pub fn new(
        automations: Arc<dyn AutomationRepository>,
        directory: Arc<dyn ContactDirectory>,
        triggers: TriggerEvaluator,
        ai: AiProcessor,
        executor: ActionExecutor,
        logs: Arc<dyn ExecutionLogSink>,
    ) -> Self {
        Self {
            automations,
            directory,
            triggers,
            ai,
            executor,
            logs,
        }
    }

    /// Evaluate every active automation of the user against one inbound
    /// message, running those whose trigger fires. Returns the audit rows
    /// of the runs that happened.
    pub async fn handle_message(&self, ctx: &TriggerContext) -> Vec<ExecutionLog> {
        let automations = match self.automations.active_automations(ctx.user_id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(user_id = ctx.user_id, error = %e, "failed to load automations");
                return Vec::new();
            }
        };

        let mut logs = Vec::new();
        for automation in &automations {
            if let Some(log) = self.run(automation, ctx).await {
                logs.push(log);
            }
        }
        logs
    }

    /// Load an automation by id and run it against one context.
    pub async fn execute_flow(
        &self,
        automation_id: &str,
        ctx: &TriggerContext,
    ) -> Option<ExecutionLog> {
        match self.automations.automation(automation_id).await {
            Ok(Some(automation)) => self.run(&automation, ctx).await,
            Ok(None) => {
                warn!(automation = %automation_id, "automation not found");
                None
            }
            Err(e) => {
                warn!(automation = %automation_id, error = %e, "failed to load automation");
                None
            }
        }
    }

    /// Run one automation against one context. Returns `None` when the
    /// automation is inactive or its trigger does not fire; otherwise the
    /// audit row that was appended.
    pub async fn run(
        &self,
        automation: &AutomationFlow,
        ctx: &TriggerContext,
    ) -> Option<ExecutionLog> {
        if automation.status != AutomationStatus::Active {
            debug!(automation = %automation.id, "automation inactive, skipping");
            return None;
        }
        if !self.triggers.evaluate(&automation.trigger, ctx).await {
            debug!(
                automation = %automation.id,
                trigger = automation.trigger.tag(),
                "trigger did not fire"
            );
            return None;
        }

        info!(
            automation = %automation.id,
            trigger = automation.trigger.tag(),
            phone = %ctx.phone,
            "automation triggered"
        );

        let started_at = Utc::now();
        let timer = Instant::now();

        let mut action_ctx = self.build_context(automation, ctx).await;

        // AI step; its failure is recorded but does not stop the actions.
        let mut ai_prompt = None;
        let mut ai_response = None;
        let mut error = None;
        if let Some(agent) = &automation.agent {
            let outcome = self
                .ai
                .process(
                    agent,
                    &AiContext {
                        conversation_id: ctx.conversation_id,
                        variables: action_ctx.variables.clone(),
                    },
                )
                .await;
            ai_prompt = outcome.prompt;
            if outcome.success {
                if let Some(response) = outcome.response {
                    action_ctx
                        .variables
                        .insert("ai_response".to_string(), response.clone());
                    ai_response = Some(response);
                }
            } else {
                error = outcome.error;
            }
        }

        let action_results = self.executor.execute(&automation.actions, &action_ctx).await;

        let any_failed = action_results.iter().any(|r| !r.ok());
        if error.is_none() {
            error = action_results
                .iter()
                .find_map(|r| r.error.clone());
        }
        let status = if error.is_some() || any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let log = ExecutionLog {
            id: Uuid::new_v4(),
            automation_id: automation.id.clone(),
            user_id: automation.user_id,
            conversation_id: ctx.conversation_id,
            trigger_payload: serde_json::json!({
                "type": automation.trigger.tag(),
                "phone": ctx.phone,
                "message": ctx.message,
                "conversation_id": ctx.conversation_id,
                "received_at": ctx.received_at,
            }),
            ai_prompt,
            ai_response,
            action_results,
            status,
            error,
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
        };

        if let Err(e) = self.logs.append(&log).await {
            warn!(automation = %automation.id, error = %e, "failed to append execution log");
        }

        Some(log)
    }

    /// Merge conversation/contact fields with the trigger context into the
    /// substitution variables for the agent and the actions.
    async fn build_context(
        &self,
        automation: &AutomationFlow,
        ctx: &TriggerContext,
    ) -> ActionContext {
        let mut action_ctx = ActionContext::new(automation.user_id, &ctx.phone, &ctx.message);
        action_ctx.conversation_id = ctx.conversation_id;
        action_ctx.contact_id = ctx.contact_id;

        let contact = match ctx.contact_id {
            Some(id) => self.directory.contact(id).await.ok().flatten(),
            None => self
                .directory
                .contact_by_phone(ctx.user_id, &ctx.phone)
                .await
                .ok()
                .flatten(),
        };

        if let Some(contact) = contact {
            action_ctx.contact_id = Some(contact.id);
            if let Some(name) = &contact.name {
                action_ctx
                    .variables
                    .insert("contact_name".to_string(), name.clone());
            }
            for (key, value) in &contact.custom_fields {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                action_ctx.variables.entry(key.clone()).or_insert(rendered);
            }
        }

        action_ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionStatus;
    use crate::ai::{AiDefaults, AiError, CompletionClient, CompletionRequest};
    use crate::gateway::{GatewayError, MediaMessage, MessagingGateway, SentMessage};
    use crate::http::{RetryPolicy, RetryingClient};
    use crate::store::MemoryStore;
    use crate::triggers::KeywordList;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct MockGateway {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagingGateway for MockGateway {
        async fn send_text(&self, phone: &str, text: &str) -> Result<SentMessage, GatewayError> {
            self.sent.lock().push((phone.to_string(), text.to_string()));
            Ok(SentMessage {
                id: "m-1".to_string(),
                timestamp: Utc::now(),
            })
        }

        async fn send_media(&self, _: &str, _: &MediaMessage) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn send_choices(
            &self,
            _: &str,
            _: &str,
            _: &[String],
        ) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    struct FakeCompletion {
        reply: Result<String, String>,
    }

    #[async_trait]
    impl CompletionClient for FakeCompletion {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AiError> {
            self.reply.clone().map_err(AiError::Malformed)
        }
    }

    /// Transport for tests that must not reach the network.
    struct NoTransport;

    #[async_trait]
    impl crate::http::HttpTransport for NoTransport {
        async fn execute(
            &self,
            _request: crate::http::HttpRequest,
        ) -> Result<crate::http::HttpResponse, crate::http::TransportError> {
            Err(crate::http::TransportError::Connection(
                "network disabled in tests".to_string(),
            ))
        }
    }

    struct Harness {
        engine: AutomationEngine,
        store: Arc<MemoryStore>,
        gateway: Arc<MockGateway>,
    }

    fn harness(ai_reply: Result<String, String>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway {
            sent: Mutex::new(Vec::new()),
        });
        let http = Arc::new(RetryingClient::new(
            Arc::new(NoTransport),
            RetryPolicy::default(),
        ));
        let engine = AutomationEngine::new(
            store.clone(),
            store.clone(),
            TriggerEvaluator::new(store.clone()),
            AiProcessor::new(
                Arc::new(FakeCompletion { reply: ai_reply }),
                store.clone(),
                AiDefaults::default(),
            ),
            ActionExecutor::new(gateway.clone(), store.clone(), store.clone(), http),
            store.clone(),
        );
        Harness {
            engine,
            store,
            gateway,
        }
    }

    fn keyword_automation(actions: Vec<Action>, agent: Option<AgentConfig>) -> AutomationFlow {
        AutomationFlow {
            id: "auto-1".to_string(),
            user_id: 1,
            name: "boas-vindas".to_string(),
            status: AutomationStatus::Active,
            trigger: TriggerKind::Keyword {
                keywords: KeywordList::Many(vec!["oi".to_string()]),
            },
            agent,
            actions,
        }
    }

    #[tokio::test]
    async fn inactive_automation_never_runs() {
        let h = harness(Ok("resp".to_string()));
        let mut automation = keyword_automation(vec![], None);
        automation.status = AutomationStatus::Inactive;

        let ctx = TriggerContext::new(1, "5511999990000", "oi");
        assert!(h.engine.run(&automation, &ctx).await.is_none());
        assert!(h.store.execution_logs().is_empty());
    }

    #[tokio::test]
    async fn trigger_miss_produces_no_log() {
        let h = harness(Ok("resp".to_string()));
        let automation = keyword_automation(vec![], None);

        let ctx = TriggerContext::new(1, "5511999990000", "tchau");
        assert!(h.engine.run(&automation, &ctx).await.is_none());
        assert!(h.store.execution_logs().is_empty());
    }

    #[tokio::test]
    async fn run_appends_one_log_with_action_results() {
        let h = harness(Ok("resp".to_string()));
        let automation = keyword_automation(
            vec![Action::SendMessage {
                message: "Olá!".to_string(),
            }],
            None,
        );

        let ctx = TriggerContext::new(1, "5511999990000", "oi, tudo bem?");
        let log = h.engine.run(&automation, &ctx).await.unwrap();

        assert_eq!(log.status, RunStatus::Success);
        assert_eq!(log.action_results.len(), 1);
        assert_eq!(log.trigger_payload["type"], "keyword");
        assert_eq!(h.store.execution_logs().len(), 1);
        assert_eq!(h.gateway.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn ai_response_feeds_action_templates() {
        let h = harness(Ok("Seja bem-vinda!".to_string()));
        let automation = keyword_automation(
            vec![Action::SendMessage {
                message: "{{ai_response}}".to_string(),
            }],
            Some(AgentConfig {
                enabled: true,
                prompt: "Responda: {{message}}".to_string(),
                ..AgentConfig::default()
            }),
        );

        let ctx = TriggerContext::new(1, "5511999990000", "oi");
        let log = h.engine.run(&automation, &ctx).await.unwrap();

        assert_eq!(log.ai_response.as_deref(), Some("Seja bem-vinda!"));
        assert_eq!(
            log.ai_prompt.as_deref(),
            Some("Responda: oi")
        );
        assert_eq!(h.gateway.sent.lock()[0].1, "Seja bem-vinda!");
    }

    #[tokio::test]
    async fn ai_failure_is_logged_but_actions_still_run() {
        let h = harness(Err("provider down".to_string()));
        let automation = keyword_automation(
            vec![Action::SendMessage {
                message: "fallback".to_string(),
            }],
            Some(AgentConfig {
                enabled: true,
                prompt: "p".to_string(),
                ..AgentConfig::default()
            }),
        );

        let ctx = TriggerContext::new(1, "5511999990000", "oi");
        let log = h.engine.run(&automation, &ctx).await.unwrap();

        assert_eq!(log.status, RunStatus::Failed);
        assert!(log.error.as_deref().unwrap().contains("provider down"));
        assert!(log.ai_response.is_none());
        // actions still executed and succeeded
        assert_eq!(log.action_results[0].status, ActionStatus::Success);
        assert_eq!(h.gateway.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_action_marks_run_failed_but_log_is_complete() {
        let h = harness(Ok("x".to_string()));
        let automation = keyword_automation(
            vec![
                Action::AddTag {
                    tag: Some("vip".to_string()),
                    tag_id: None,
                },
                Action::SendMessage {
                    message: "ainda envio".to_string(),
                },
            ],
            None,
        );

        // no conversation in context → add_tag fails, send still runs
        let ctx = TriggerContext::new(1, "5511999990000", "oi");
        let log = h.engine.run(&automation, &ctx).await.unwrap();

        assert_eq!(log.status, RunStatus::Failed);
        assert_eq!(log.action_results.len(), 2);
        assert_eq!(log.action_results[0].status, ActionStatus::Failed);
        assert_eq!(log.action_results[1].status, ActionStatus::Success);
    }

    #[tokio::test]
    async fn contact_fields_join_the_context() {
        let h = harness(Ok("x".to_string()));
        let contact = h.store.seed_contact(1, "5511999990000", Some("Ana"));
        h.store.seed_custom_field(contact, "plano", "premium");

        let automation = keyword_automation(
            vec![Action::SendMessage {
                message: "{{contact_name}} ({{plano}})".to_string(),
            }],
            None,
        );

        let ctx = TriggerContext::new(1, "5511999990000", "oi");
        h.engine.run(&automation, &ctx).await.unwrap();

        assert_eq!(h.gateway.sent.lock()[0].1, "Ana (premium)");
    }

    #[tokio::test]
    async fn execute_flow_loads_by_id() {
        let h = harness(Ok("x".to_string()));
        h.store.seed_automation(keyword_automation(vec![], None));

        let ctx = TriggerContext::new(1, "5511999990000", "oi");
        assert!(h.engine.execute_flow("auto-1", &ctx).await.is_some());
        assert!(h.engine.execute_flow("missing", &ctx).await.is_none());
    }

    #[tokio::test]
    async fn handle_message_runs_every_firing_automation() {
        let h = harness(Ok("x".to_string()));
        h.store.seed_automation(keyword_automation(vec![], None));
        let mut second = keyword_automation(vec![], None);
        second.id = "auto-2".to_string();
        second.trigger = TriggerKind::Keyword {
            keywords: KeywordList::Many(vec!["tchau".to_string()]),
        };
        h.store.seed_automation(second);

        let ctx = TriggerContext::new(1, "5511999990000", "oi");
        let logs = h.engine.handle_message(&ctx).await;

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].automation_id, "auto-1");
    }
}
