//! zapflow — WhatsApp conversation automation engine.
//!
//! The core of a WhatsApp automation product: a persisted per-contact state
//! machine that walks published flow graphs ([`flow`]), a trigger evaluator
//! that decides when one-shot automations fire ([`triggers`]), an action
//! executor with per-action error isolation ([`actions`]), AI agent
//! processing over several LLM providers ([`ai`]), and the retry/backoff
//! discipline shared by every outbound call ([`http`]).
//!
//! Everything that is not the engine — the WhatsApp transport, the host
//! application's database, flow authoring — stays behind the collaborator
//! traits in [`gateway`] and [`store`], so the engine runs identically
//! against production adapters, SQLite, or the in-memory fakes used by the
//! test suites.

pub mod actions;
pub mod ai;
pub mod automation;
pub mod condition;
pub mod config;
pub mod flow;
pub mod gateway;
pub mod http;
pub mod store;
pub mod template;
pub mod triggers;

pub use actions::{Action, ActionContext, ActionExecutor, ActionResult, ActionStatus};
pub use ai::{AgentConfig, AiDefaults, AiOutcome, AiProcessor, CompletionClient, Provider};
pub use automation::{AutomationEngine, AutomationFlow, AutomationStatus, ExecutionLog, RunStatus};
pub use condition::Operator;
pub use config::EngineSettings;
pub use flow::{Edge, EdgeCondition, FlowDefinition, FlowEngine, FlowError, Node, NodeKind};
pub use flow::{Session, SessionStatus};
pub use gateway::{GatewayError, MediaKind, MediaMessage, MessagingGateway, SentMessage};
pub use http::{HttpError, RetryPolicy, RetryingClient};
pub use store::{MemoryStore, SqliteStore, StoreError};
pub use triggers::{TriggerContext, TriggerEvaluator, TriggerKind};
