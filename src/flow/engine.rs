//! Flow execution engine.
//!
//! Walks a published node graph for one contact at a time. Execution is an
//! explicit work-loop with a bounded step count: each node either performs
//! its side effect and advances, suspends awaiting the contact's reply, or
//! terminates the session. The session is durably checkpointed at every
//! suspension and termination, so traversal survives process restarts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ai::{CompletionClient, CompletionRequest, Provider};
use crate::condition;
use crate::config::EngineSettings;
use crate::flow::config::{EdgeCondition, FlowDefinition, Node, NodeKind};
use crate::flow::input;
use crate::flow::session::{Session, SessionStatus};
use crate::gateway::{numbered_fallback, MediaKind, MediaMessage, MessagingGateway};
use crate::http::{HttpRequest, Method, RetryingClient};
use crate::store::{ContactDirectory, FlowRepository, SessionStore, StoreError};
use crate::template;

/// Errors a caller of the engine can see. Everything else is handled
/// internally: sends are logged-and-continued, node failures terminate the
/// session instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow {0} has no start node")]
    NoStartNode(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What executing one node means for the traversal.
enum StepOutcome {
    /// Move to the given node, or complete if there is none.
    Advance(Option<String>),
    /// Park here and wait for the contact's reply.
    Suspend,
    /// Terminate the session.
    Finish(SessionStatus),
}

/// The per-contact session state machine.
pub struct FlowEngine {
    flows: Arc<dyn FlowRepository>,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn ContactDirectory>,
    gateway: Arc<dyn MessagingGateway>,
    http: Arc<RetryingClient>,
    ai: Arc<dyn CompletionClient>,
    settings: EngineSettings,
}

impl FlowEngine {
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn ContactDirectory>,
        gateway: Arc<dyn MessagingGateway>,
        http: Arc<RetryingClient>,
        ai: Arc<dyn CompletionClient>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            flows,
            sessions,
            directory,
            gateway,
            http,
            ai,
            settings,
        }
    }

    /// Start a flow for a contact and execute until the first suspension or
    /// termination. Any prior active session for the phone is completed
    /// first, upholding the one-active-session invariant.
    pub async fn start_session(
        &self,
        flow_id: &str,
        phone: &str,
        contact_id: Option<i64>,
    ) -> Result<Session, FlowError> {
        let flow = self
            .flows
            .published_flow(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;
        let start = flow
            .start_node()
            .ok_or_else(|| FlowError::NoStartNode(flow_id.to_string()))?
            .id
            .clone();

        let closed = self.sessions.complete_active_for(phone).await?;
        if closed > 0 {
            debug!(phone = %phone, closed, "completed prior active sessions");
        }

        let mut session = Session::new(&flow, phone, contact_id, &start);
        self.sessions.create(&session).await?;
        info!(session = %session.id, flow = %flow_id, phone = %phone, "session started");

        self.run_from(&flow, &mut session, start).await?;
        Ok(session)
    }

    /// Feed an inbound message to the contact's active session. Returns
    /// `Ok(false)` when there is none, so the caller can fall back to other
    /// handling (automations, human inbox).
    pub async fn process_input(&self, phone: &str, raw: &str) -> Result<bool, FlowError> {
        let Some(mut session) = self.sessions.active_session(phone).await? else {
            return Ok(false);
        };

        let Some(flow) = self.flows.published_flow(&session.flow_id).await? else {
            warn!(session = %session.id, flow = %session.flow_id, "published flow disappeared");
            self.finish(&mut session, SessionStatus::Failed).await?;
            return Ok(true);
        };
        let Some(node) = flow.node(&session.current_node) else {
            warn!(
                session = %session.id,
                node = %session.current_node,
                "session parked on unknown node"
            );
            self.finish(&mut session, SessionStatus::Failed).await?;
            return Ok(true);
        };

        // Input nodes: validate, re-prompt without advancing on failure.
        let checked = match &node.kind {
            NodeKind::InputText {
                variable,
                error_message,
                min_length,
                max_length,
                ..
            } => Some((
                variable.clone(),
                input::text(raw, *min_length, *max_length),
                error_message.clone(),
            )),
            NodeKind::InputNumber {
                variable,
                error_message,
                min,
                max,
                ..
            } => Some((
                variable.clone(),
                input::number(raw, *min, *max),
                error_message.clone(),
            )),
            NodeKind::InputEmail {
                variable,
                error_message,
                ..
            } => Some((variable.clone(), input::email(raw), error_message.clone())),
            NodeKind::InputPhone {
                variable,
                error_message,
                ..
            } => Some((variable.clone(), input::phone(raw), error_message.clone())),
            NodeKind::InputDate {
                variable,
                error_message,
                ..
            } => Some((variable.clone(), input::date(raw), error_message.clone())),
            _ => None,
        };

        if let Some((variable, validated, error_message)) = checked {
            match validated {
                Some(value) => {
                    debug!(session = %session.id, variable = %variable, "input accepted");
                    session.set_variable(variable, value);
                    let current = session.current_node.clone();
                    let next = next_node(&flow, &session, &current, Some(raw));
                    self.advance_or_complete(&flow, &mut session, next).await?;
                }
                None => {
                    debug!(
                        session = %session.id,
                        node = %session.current_node,
                        "input rejected, re-prompting"
                    );
                    let prompt = error_message.unwrap_or_else(|| {
                        input::default_error_message(node.kind.tag()).to_string()
                    });
                    let rendered = template::substitute(&prompt, &session.variables);
                    self.send_text_logged(phone, &rendered).await;
                }
            }
            return Ok(true);
        }

        // Choice nodes: match against labels and advance regardless. There
        // is deliberately no re-prompt loop here.
        if node.kind.is_choice() {
            let options: Vec<String> = match &node.kind {
                NodeKind::Buttons { options, .. }
                | NodeKind::WhatsappButtons { options, .. }
                | NodeKind::WhatsappList { options, .. } => options
                    .iter()
                    .map(|o| template::substitute(o, &session.variables))
                    .collect(),
                _ => Vec::new(),
            };
            let trimmed = raw.trim();
            let index = options
                .iter()
                .position(|o| o.trim().to_lowercase() == trimmed.to_lowercase())
                .map(|i| i as i64)
                .unwrap_or(-1);

            session.set_variable("button_response", trimmed);
            session.set_variable("button_index", index.to_string());

            let current = session.current_node.clone();
            let next = next_node(&flow, &session, &current, Some(raw));
            self.advance_or_complete(&flow, &mut session, next).await?;
            return Ok(true);
        }

        // Parked on a non-suspending node; resume traversal from its edges.
        let current = session.current_node.clone();
        let next = next_node(&flow, &session, &current, Some(raw));
        self.advance_or_complete(&flow, &mut session, next).await?;
        Ok(true)
    }

    async fn advance_or_complete(
        &self,
        flow: &FlowDefinition,
        session: &mut Session,
        next: Option<String>,
    ) -> Result<(), FlowError> {
        match next {
            Some(node_id) => self.run_from(flow, session, node_id).await,
            None => self.finish(session, SessionStatus::Completed).await,
        }
    }

    /// The work-loop: execute nodes until suspension, termination or the
    /// step budget. Node failures terminate the session as `failed` rather
    /// than propagating.
    async fn run_from(
        &self,
        flow: &FlowDefinition,
        session: &mut Session,
        start: String,
    ) -> Result<(), FlowError> {
        let mut cursor = Some(start);
        let mut steps = 0u32;

        while let Some(node_id) = cursor {
            steps += 1;
            if steps > self.settings.max_steps_per_event {
                warn!(
                    session = %session.id,
                    steps,
                    "step budget exceeded, failing session"
                );
                return self.finish(session, SessionStatus::Failed).await;
            }

            let Some(node) = flow.node(&node_id) else {
                warn!(session = %session.id, node = %node_id, "edge points at unknown node");
                return self.finish(session, SessionStatus::Failed).await;
            };

            session.current_node = node_id.clone();
            session.touch();

            let outcome = match self.execute_node(flow, session, node).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        session = %session.id,
                        node = %node_id,
                        kind = node.kind.tag(),
                        error = %e,
                        "node execution failed"
                    );
                    return self.finish(session, SessionStatus::Failed).await;
                }
            };

            match outcome {
                StepOutcome::Advance(next) => cursor = next,
                StepOutcome::Suspend => {
                    self.sessions.save(session).await?;
                    debug!(session = %session.id, node = %node_id, "suspended awaiting input");
                    return Ok(());
                }
                StepOutcome::Finish(status) => return self.finish(session, status).await,
            }
        }

        // Walked off the end of the graph.
        self.finish(session, SessionStatus::Completed).await
    }

    async fn finish(&self, session: &mut Session, status: SessionStatus) -> Result<(), FlowError> {
        session.status = status;
        session.touch();
        self.sessions.save(session).await?;
        info!(session = %session.id, status = %status, "session finished");
        Ok(())
    }

    /// Execute one node's side effect and decide how the traversal
    /// continues.
    async fn execute_node(
        &self,
        flow: &FlowDefinition,
        session: &mut Session,
        node: &Node,
    ) -> Result<StepOutcome, FlowError> {
        match &node.kind {
            NodeKind::Start => Ok(self.advance(flow, session, &node.id)),

            NodeKind::Text { text } => {
                let rendered = template::substitute(text, &session.variables);
                self.send_text_logged(&session.phone, &rendered).await;
                tokio::time::sleep(self.settings.inter_message_delay()).await;
                Ok(self.advance(flow, session, &node.id))
            }

            NodeKind::Image { url, caption }
            | NodeKind::Video { url, caption }
            | NodeKind::File { url, caption } => {
                let media = MediaMessage {
                    kind: match &node.kind {
                        NodeKind::Image { .. } => MediaKind::Image,
                        NodeKind::Video { .. } => MediaKind::Video,
                        _ => MediaKind::Document,
                    },
                    url: template::substitute(url, &session.variables),
                    caption: caption
                        .as_deref()
                        .map(|c| template::substitute(c, &session.variables)),
                };
                if let Err(e) = self.gateway.send_media(&session.phone, &media).await {
                    warn!(node = %node.id, kind = %media.kind, error = %e, "media send failed");
                }
                tokio::time::sleep(self.settings.inter_message_delay()).await;
                Ok(self.advance(flow, session, &node.id))
            }

            NodeKind::Audio { url } => {
                let media = MediaMessage {
                    kind: MediaKind::Audio,
                    url: template::substitute(url, &session.variables),
                    caption: None,
                };
                if let Err(e) = self.gateway.send_media(&session.phone, &media).await {
                    warn!(node = %node.id, error = %e, "audio send failed");
                }
                tokio::time::sleep(self.settings.inter_message_delay()).await;
                Ok(self.advance(flow, session, &node.id))
            }

            NodeKind::Buttons { text, options }
            | NodeKind::WhatsappButtons { text, options }
            | NodeKind::WhatsappList { text, options } => {
                let rendered = template::substitute(text, &session.variables);
                let options: Vec<String> = options
                    .iter()
                    .map(|o| template::substitute(o, &session.variables))
                    .collect();
                if let Err(e) = self
                    .gateway
                    .send_choices(&session.phone, &rendered, &options)
                    .await
                {
                    warn!(
                        node = %node.id,
                        error = %e,
                        "rich choice send failed, falling back to numbered text"
                    );
                    self.send_text_logged(&session.phone, &numbered_fallback(&rendered, &options))
                        .await;
                }
                Ok(StepOutcome::Suspend)
            }

            NodeKind::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                Ok(self.advance(flow, session, &node.id))
            }

            NodeKind::SetVariable { variable, value } => {
                let rendered = template::substitute(value, &session.variables);
                session.set_variable(variable.clone(), rendered);
                Ok(self.advance(flow, session, &node.id))
            }

            NodeKind::Condition {
                variable,
                operator,
                value,
            } => {
                let expected = template::substitute(value, &session.variables);
                let actual = session.variable(variable).unwrap_or_default();
                let result = condition::evaluate(actual, *operator, &expected);
                debug!(
                    node = %node.id,
                    variable = %variable,
                    result,
                    "condition evaluated"
                );

                let edges = flow.outgoing_edges(&node.id);
                if edges.is_empty() {
                    return Ok(StepOutcome::Finish(SessionStatus::Completed));
                }
                let chosen = edges
                    .iter()
                    .find(|e| {
                        matches!(
                            &e.condition,
                            Some(EdgeCondition::Branch { value }) if *value == result
                        )
                    })
                    .unwrap_or(&edges[0]);
                Ok(StepOutcome::Advance(Some(chosen.to.clone())))
            }

            NodeKind::Webhook { url, method } => {
                self.webhook_node(session, &node.id, url, *method).await;
                Ok(self.advance(flow, session, &node.id))
            }

            NodeKind::Ai {
                prompt,
                system_prompt,
                provider,
                model,
                api_key,
                response_variable,
            } => {
                let rendered = template::substitute(prompt, &session.variables);
                let provider =
                    Provider::parse(provider.as_deref().unwrap_or(&self.settings.ai.provider));

                let mut request = CompletionRequest::new(provider, rendered);
                request.model = model
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| self.settings.ai.model.clone());
                request.api_key = api_key
                    .clone()
                    .or_else(|| self.settings.ai.api_key.clone())
                    .unwrap_or_default();
                request.system_prompt = system_prompt
                    .as_deref()
                    .map(|s| template::substitute(s, &session.variables));
                request.temperature = self.settings.ai.temperature;
                request.max_tokens = self.settings.ai.max_tokens;
                request.timeout = self.settings.ai_timeout();

                match self.ai.complete(&request).await {
                    Ok(reply) => {
                        session.set_variable(response_variable.clone(), reply.clone());
                        self.send_text_logged(&session.phone, &reply).await;
                    }
                    Err(e) => {
                        // The provider error stays in the logs; the contact
                        // only ever sees the generic apology.
                        warn!(node = %node.id, provider = %provider, error = %e, "AI node failed");
                        self.send_text_logged(&session.phone, &self.settings.apology_message)
                            .await;
                    }
                }
                Ok(self.advance(flow, session, &node.id))
            }

            NodeKind::Transfer { message } => {
                if !message.trim().is_empty() {
                    let rendered = template::substitute(message, &session.variables);
                    self.send_text_logged(&session.phone, &rendered).await;
                }
                if let Err(e) = self.directory.open_handoff(&session.phone).await {
                    warn!(session = %session.id, error = %e, "failed to open human handoff");
                    return Ok(StepOutcome::Finish(SessionStatus::Failed));
                }
                info!(session = %session.id, phone = %session.phone, "transferred to human");
                Ok(StepOutcome::Finish(SessionStatus::Completed))
            }

            NodeKind::End { message } | NodeKind::EndChat { message } => {
                if let Some(text) = message.as_deref().filter(|m| !m.trim().is_empty()) {
                    let rendered = template::substitute(text, &session.variables);
                    self.send_text_logged(&session.phone, &rendered).await;
                }
                Ok(StepOutcome::Finish(SessionStatus::Completed))
            }

            NodeKind::InputText { prompt, .. }
            | NodeKind::InputNumber { prompt, .. }
            | NodeKind::InputEmail { prompt, .. }
            | NodeKind::InputPhone { prompt, .. }
            | NodeKind::InputDate { prompt, .. } => {
                if let Some(text) = prompt.as_deref().filter(|p| !p.trim().is_empty()) {
                    let rendered = template::substitute(text, &session.variables);
                    self.send_text_logged(&session.phone, &rendered).await;
                }
                Ok(StepOutcome::Suspend)
            }

            NodeKind::Other => {
                warn!(node = %node.id, "unknown node type, skipping");
                Ok(self.advance(flow, session, &node.id))
            }
        }
    }

    /// Call out from a webhook node. Failures never fail the session; a
    /// missing `webhook_response` variable is the only trace they leave.
    async fn webhook_node(&self, session: &mut Session, node_id: &str, url: &str, method: Method) {
        let rendered = template::substitute(url, &session.variables);

        let request = match method {
            Method::Get => {
                let mut target = match url::Url::parse(&rendered) {
                    Ok(u) => u,
                    Err(e) => {
                        warn!(node = %node_id, url = %rendered, error = %e, "invalid webhook url");
                        return;
                    }
                };
                {
                    let mut pairs = target.query_pairs_mut();
                    for (key, value) in &session.variables {
                        pairs.append_pair(key, value);
                    }
                }
                HttpRequest::new(Method::Get, target.to_string())
            }
            _ => {
                let payload =
                    serde_json::to_value(&session.variables).unwrap_or(serde_json::Value::Null);
                HttpRequest::new(method, rendered).with_json(payload)
            }
        }
        .with_timeout(self.settings.webhook_timeout());

        match self.http.execute(request).await {
            Ok(response) => {
                session.set_variable("webhook_response", response.body);
            }
            Err(e) => {
                warn!(node = %node_id, error = %e, "webhook node call failed, continuing");
            }
        }
    }

    fn advance(&self, flow: &FlowDefinition, session: &Session, node_id: &str) -> StepOutcome {
        StepOutcome::Advance(next_node(flow, session, node_id, None))
    }

    /// Send a text, logging failures instead of propagating them: messaging
    /// trouble never stops a traversal.
    async fn send_text_logged(&self, phone: &str, text: &str) {
        if let Err(e) = self.gateway.send_text(phone, text).await {
            warn!(phone = %phone, error = %e, "text send failed");
        }
    }
}

/// Resolve the next node through the outgoing edges, in `sort_order`.
///
/// An unconditional edge always matches; a button-index condition matches
/// the session's `button_index` variable; a literal value matches the
/// trimmed raw input case-insensitively. First match wins. When edges exist
/// but none match, the first edge is the fallback — an unmatched condition
/// never dead-ends a flow.
fn next_node(
    flow: &FlowDefinition,
    session: &Session,
    node_id: &str,
    raw_input: Option<&str>,
) -> Option<String> {
    let edges = flow.outgoing_edges(node_id);
    if edges.is_empty() {
        return None;
    }

    for edge in &edges {
        match &edge.condition {
            None => return Some(edge.to.clone()),
            Some(EdgeCondition::ButtonIndex { index }) => {
                let current = session
                    .variable("button_index")
                    .and_then(|v| v.parse::<i64>().ok());
                if current == Some(*index) {
                    return Some(edge.to.clone());
                }
            }
            Some(EdgeCondition::Value { value }) => {
                if let Some(raw) = raw_input {
                    if raw.trim().to_lowercase() == value.trim().to_lowercase() {
                        return Some(edge.to.clone());
                    }
                }
            }
            // Branch conditions belong to condition nodes, which resolve
            // their own edges.
            Some(EdgeCondition::Branch { .. }) => {}
        }
    }

    Some(edges[0].to.clone())
}
