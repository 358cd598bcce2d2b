//! End-to-end engine scenarios.
//!
//! Drives the flow engine and the automation engine together through the
//! in-memory store and mock collaborators, the way an inbound-message
//! handler would: try the active session first, fall back to automations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use zapflow::actions::{Action, ActionExecutor};
use zapflow::ai::{
    AiDefaults, AiError, AiProcessor, CompletionClient, CompletionRequest,
};
use zapflow::automation::{AutomationEngine, AutomationFlow, AutomationStatus};
use zapflow::condition::Operator;
use zapflow::flow::config::{Edge, EdgeCondition, FlowDefinition, Node, NodeKind};
use zapflow::flow::engine::FlowEngine;
use zapflow::flow::session::SessionStatus;
use zapflow::gateway::{GatewayError, MediaMessage, MessagingGateway, SentMessage};
use zapflow::http::{
    HttpRequest, HttpResponse, HttpTransport, RetryPolicy, RetryingClient, TransportError,
};
use zapflow::store::MemoryStore;
use zapflow::triggers::{KeywordList, TriggerContext, TriggerEvaluator, TriggerKind};
use zapflow::EngineSettings;

const PHONE: &str = "5511999990000";

struct MockGateway {
    texts: Mutex<Vec<String>>,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
        }
    }

    fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }
}

#[async_trait]
impl MessagingGateway for MockGateway {
    async fn send_text(&self, _phone: &str, text: &str) -> Result<SentMessage, GatewayError> {
        self.texts.lock().push(text.to_string());
        Ok(SentMessage {
            id: format!("m-{}", self.texts.lock().len()),
            timestamp: Utc::now(),
        })
    }

    async fn send_media(&self, _phone: &str, _media: &MediaMessage) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn send_choices(
        &self,
        _phone: &str,
        _text: &str,
        _options: &[String],
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}

struct FakeCompletion;

#[async_trait]
impl CompletionClient for FakeCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
        Ok(format!("echo: {}", request.user_prompt))
    }
}

struct NoTransport;

#[async_trait]
impl HttpTransport for NoTransport {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Err(TransportError::Connection("offline".to_string()))
    }
}

struct World {
    store: Arc<MemoryStore>,
    gateway: Arc<MockGateway>,
    flows: FlowEngine,
    automations: AutomationEngine,
}

fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let http = Arc::new(RetryingClient::new(
        Arc::new(NoTransport),
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        },
    ));
    let mut settings = EngineSettings::default();
    settings.inter_message_delay_ms = 0;

    let flows = FlowEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        gateway.clone(),
        http.clone(),
        Arc::new(FakeCompletion),
        settings,
    );

    let automations = AutomationEngine::new(
        store.clone(),
        store.clone(),
        TriggerEvaluator::new(store.clone()),
        AiProcessor::new(Arc::new(FakeCompletion), store.clone(), AiDefaults::default()),
        ActionExecutor::new(gateway.clone(), store.clone(), store.clone(), http),
        store.clone(),
    );

    World {
        store,
        gateway,
        flows,
        automations,
    }
}

/// A lead-qualification flow: greeting, name input, interest menu,
/// conditional branch, transfer.
fn lead_flow() -> FlowDefinition {
    FlowDefinition::new("lead", "qualificação")
        .with_node(Node::new("start", NodeKind::Start))
        .with_node(Node::new(
            "hello",
            NodeKind::Text {
                text: "Olá! Bem-vindo.".to_string(),
            },
        ))
        .with_node(Node::new(
            "ask_name",
            NodeKind::InputText {
                variable: "nome".to_string(),
                prompt: Some("Qual o seu nome?".to_string()),
                error_message: None,
                min_length: Some(2),
                max_length: None,
            },
        ))
        .with_node(Node::new(
            "menu",
            NodeKind::Buttons {
                text: "{{nome}}, o que você procura?".to_string(),
                options: vec!["Comprar".to_string(), "Suporte".to_string()],
            },
        ))
        .with_node(Node::new(
            "check",
            NodeKind::Condition {
                variable: "button_response".to_string(),
                operator: Operator::Equals,
                value: "comprar".to_string(),
            },
        ))
        .with_node(Node::new(
            "sales",
            NodeKind::Transfer {
                message: "Te passando para vendas, {{nome}}!".to_string(),
            },
        ))
        .with_node(Node::new(
            "bye",
            NodeKind::End {
                message: Some("Nosso suporte responde em instantes.".to_string()),
            },
        ))
        .with_edge(Edge::new("start", "hello", 0))
        .with_edge(Edge::new("hello", "ask_name", 0))
        .with_edge(Edge::new("ask_name", "menu", 0))
        .with_edge(Edge::new("menu", "check", 0))
        .with_edge(Edge::new("check", "sales", 0).with_condition(EdgeCondition::Branch { value: true }))
        .with_edge(Edge::new("check", "bye", 1).with_condition(EdgeCondition::Branch { value: false }))
}

#[tokio::test]
async fn full_conversation_reaches_transfer() {
    let w = world();
    w.store.seed_flow(lead_flow());

    let session = w.flows.start_session("lead", PHONE, None).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_node, "ask_name");

    // name too short → re-prompt, still parked
    assert!(w.flows.process_input(PHONE, "A").await.unwrap());
    assert_eq!(
        w.store.active_session_for(PHONE).unwrap().current_node,
        "ask_name"
    );

    // valid name → menu
    assert!(w.flows.process_input(PHONE, "Ana").await.unwrap());
    assert_eq!(
        w.store.active_session_for(PHONE).unwrap().current_node,
        "menu"
    );

    // pick the purchase branch → condition → transfer → completed
    assert!(w.flows.process_input(PHONE, "Comprar").await.unwrap());

    let finished = w.store.session_row(session.id).unwrap();
    assert_eq!(finished.status, SessionStatus::Completed);
    assert_eq!(finished.variable("nome"), Some("Ana"));
    assert_eq!(finished.variable("button_index"), Some("0"));
    assert!(w.store.handoffs().contains(&PHONE.to_string()));

    let texts = w.gateway.texts();
    assert_eq!(
        texts,
        vec![
            "Olá! Bem-vindo.".to_string(),
            "Qual o seu nome?".to_string(),
            "Sorry, I couldn't understand that. Please try again.".to_string(),
            "Te passando para vendas, Ana!".to_string(),
        ]
    );
}

#[tokio::test]
async fn support_branch_ends_without_transfer() {
    let w = world();
    w.store.seed_flow(lead_flow());

    w.flows.start_session("lead", PHONE, None).await.unwrap();
    w.flows.process_input(PHONE, "Ana").await.unwrap();
    w.flows.process_input(PHONE, "Suporte").await.unwrap();

    let session = w.store.active_session_for(PHONE);
    assert!(session.is_none());
    assert!(w.store.handoffs().is_empty());
    assert!(w
        .gateway
        .texts()
        .contains(&"Nosso suporte responde em instantes.".to_string()));
}

#[tokio::test]
async fn restarting_the_flow_keeps_a_single_active_session() {
    let w = world();
    w.store.seed_flow(lead_flow());

    let first = w.flows.start_session("lead", PHONE, None).await.unwrap();
    let second = w.flows.start_session("lead", PHONE, None).await.unwrap();

    assert_eq!(w.store.active_session_count(PHONE), 1);
    assert_eq!(
        w.store.session_row(first.id).unwrap().status,
        SessionStatus::Completed
    );
    assert_eq!(
        w.store.active_session_for(PHONE).unwrap().id,
        second.id
    );
}

#[tokio::test]
async fn message_without_session_falls_through_to_automations() {
    let w = world();
    w.store.seed_flow(lead_flow());
    w.store.seed_automation(AutomationFlow {
        id: "welcome".to_string(),
        user_id: 1,
        name: "boas-vindas".to_string(),
        status: AutomationStatus::Active,
        trigger: TriggerKind::Keyword {
            keywords: KeywordList::Many(vec!["oi".to_string()]),
        },
        agent: None,
        actions: vec![Action::SendMessage {
            message: "Olá! Como posso ajudar?".to_string(),
        }],
    });

    // the inbound-handler pattern: session first, then automations
    let handled = w.flows.process_input(PHONE, "oi").await.unwrap();
    assert!(!handled);

    let ctx = TriggerContext::new(1, PHONE, "oi");
    let logs = w.automations.handle_message(&ctx).await;

    assert_eq!(logs.len(), 1);
    assert!(logs[0].action_results[0].ok());
    assert_eq!(w.gateway.texts(), vec!["Olá! Como posso ajudar?".to_string()]);
    assert_eq!(w.store.execution_logs().len(), 1);
}

#[tokio::test]
async fn session_variables_survive_into_later_nodes() {
    let w = world();
    let flow = FlowDefinition::new("vars", "vars")
        .with_node(Node::new("start", NodeKind::Start))
        .with_node(Node::new(
            "email",
            NodeKind::InputEmail {
                variable: "email".to_string(),
                prompt: Some("Seu e-mail?".to_string()),
                error_message: Some("E-mail inválido, tente de novo.".to_string()),
            },
        ))
        .with_node(Node::new(
            "confirm",
            NodeKind::Text {
                text: "Enviaremos a proposta para {{email}}.".to_string(),
            },
        ))
        .with_edge(Edge::new("start", "email", 0))
        .with_edge(Edge::new("email", "confirm", 0));
    w.store.seed_flow(flow);

    w.flows.start_session("vars", PHONE, None).await.unwrap();
    w.flows.process_input(PHONE, "not-an-email").await.unwrap();
    w.flows
        .process_input(PHONE, "ana@example.com")
        .await
        .unwrap();

    let texts = w.gateway.texts();
    assert!(texts.contains(&"E-mail inválido, tente de novo.".to_string()));
    assert!(texts.contains(&"Enviaremos a proposta para ana@example.com.".to_string()));
}

#[tokio::test]
async fn mixed_dialogue_flow_and_automation_do_not_interfere() {
    let w = world();
    w.store.seed_flow(lead_flow());
    w.store.seed_automation(AutomationFlow {
        id: "tagger".to_string(),
        user_id: 1,
        name: "tag oi".to_string(),
        status: AutomationStatus::Active,
        trigger: TriggerKind::Keyword {
            keywords: KeywordList::Many(vec!["oi".to_string()]),
        },
        agent: None,
        actions: vec![],
    });

    // while a session is active, the handler never reaches the automations
    w.flows.start_session("lead", PHONE, None).await.unwrap();
    let handled = w.flows.process_input(PHONE, "oi").await.unwrap();
    assert!(handled);
    assert!(w.store.execution_logs().is_empty());
}
