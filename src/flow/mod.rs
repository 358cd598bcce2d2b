//! Flow graphs and the session state machine.

pub mod config;
pub mod engine;
pub mod input;
pub mod session;

pub use config::{Edge, EdgeCondition, FlowDefinition, Node, NodeKind};
pub use engine::{FlowEngine, FlowError};
pub use session::{Session, SessionStatus};
