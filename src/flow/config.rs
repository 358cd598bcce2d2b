//! Flow definition types.
//!
//! A flow is an immutable directed graph: typed nodes joined by ordered,
//! optionally conditional edges. Flows are authored and published elsewhere;
//! the engine only walks them.

use serde::{Deserialize, Serialize};

use crate::condition::Operator;
use crate::http::Method;

/// A published flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The designated entry node, if the graph has one.
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// Outgoing edges of a node in `sort_order`.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.edges.iter().filter(|e| e.from == node_id).collect();
        edges.sort_by_key(|e| e.sort_order);
        edges
    }
}

/// One step in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self { id: id.into(), kind }
    }
}

fn default_response_variable() -> String {
    "ai_response".to_string()
}

fn default_webhook_method() -> Method {
    Method::Post
}

/// Node types and their configuration.
///
/// The tag is the node's `type` in the stored graph document. Types this
/// engine version does not know deserialize as [`NodeKind::Other`] and are
/// skipped at execution time rather than failing the whole flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry marker; no side effect.
    Start,

    /// Send a text message.
    Text {
        #[serde(default)]
        text: String,
    },

    /// Send an image by URL.
    Image {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },

    /// Send an audio clip by URL.
    Audio { url: String },

    /// Send a video by URL.
    Video {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },

    /// Send a document by URL.
    File {
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },

    /// Present choices and wait for a reply.
    Buttons {
        #[serde(default)]
        text: String,
        options: Vec<String>,
    },

    /// Present native WhatsApp buttons and wait for a reply.
    WhatsappButtons {
        #[serde(default)]
        text: String,
        options: Vec<String>,
    },

    /// Present a WhatsApp list and wait for a selection.
    WhatsappList {
        #[serde(default)]
        text: String,
        options: Vec<String>,
    },

    /// Pause for a fixed number of seconds.
    Wait { seconds: u64 },

    /// Store a literal (after substitution) in the session variables.
    SetVariable { variable: String, value: String },

    /// Branch on `variable <operator> value`.
    Condition {
        variable: String,
        operator: Operator,
        #[serde(default)]
        value: String,
    },

    /// Call out to an external URL with the session variables as payload.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_method")]
        method: Method,
    },

    /// Ask an AI provider for a reply and send it to the contact. Stored
    /// graphs tag this node `openai` for historical reasons, whichever
    /// provider it actually calls.
    #[serde(rename = "openai", alias = "ai")]
    Ai {
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        system_prompt: Option<String>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_response_variable")]
        response_variable: String,
    },

    /// Hand the conversation over to a human and end the session.
    Transfer {
        #[serde(default)]
        message: String,
    },

    /// End the session, optionally with a closing message.
    End {
        #[serde(default)]
        message: Option<String>,
    },

    /// End the session and the chat, optionally with a closing message.
    EndChat {
        #[serde(default)]
        message: Option<String>,
    },

    /// Free-text input.
    InputText {
        variable: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
    },

    /// Numeric input with optional bounds.
    InputNumber {
        variable: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },

    /// Email input.
    InputEmail {
        variable: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },

    /// Phone input; digits only, 10 or 11 of them.
    InputPhone {
        variable: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },

    /// Date input, accepted in a fixed set of formats.
    InputDate {
        variable: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },

    /// Node type this engine version does not recognize.
    #[serde(other)]
    Other,
}

impl NodeKind {
    /// The `type` tag used in stored documents and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Text { .. } => "text",
            NodeKind::Image { .. } => "image",
            NodeKind::Audio { .. } => "audio",
            NodeKind::Video { .. } => "video",
            NodeKind::File { .. } => "file",
            NodeKind::Buttons { .. } => "buttons",
            NodeKind::WhatsappButtons { .. } => "whatsapp_buttons",
            NodeKind::WhatsappList { .. } => "whatsapp_list",
            NodeKind::Wait { .. } => "wait",
            NodeKind::SetVariable { .. } => "set_variable",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Webhook { .. } => "webhook",
            NodeKind::Ai { .. } => "openai",
            NodeKind::Transfer { .. } => "transfer",
            NodeKind::End { .. } => "end",
            NodeKind::EndChat { .. } => "end_chat",
            NodeKind::InputText { .. } => "input_text",
            NodeKind::InputNumber { .. } => "input_number",
            NodeKind::InputEmail { .. } => "input_email",
            NodeKind::InputPhone { .. } => "input_phone",
            NodeKind::InputDate { .. } => "input_date",
            NodeKind::Other => "other",
        }
    }

    /// Whether replies to this node take the choice-matching path.
    pub fn is_choice(&self) -> bool {
        matches!(
            self,
            NodeKind::Buttons { .. }
                | NodeKind::WhatsappButtons { .. }
                | NodeKind::WhatsappList { .. }
        )
    }

    /// Whether replies to this node take the validated-input path.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            NodeKind::InputText { .. }
                | NodeKind::InputNumber { .. }
                | NodeKind::InputEmail { .. }
                | NodeKind::InputPhone { .. }
                | NodeKind::InputDate { .. }
        )
    }
}

/// A directed, optionally conditional link between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
    #[serde(default)]
    pub sort_order: i32,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, sort_order: i32) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            sort_order,
        }
    }

    pub fn with_condition(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Conditions an edge can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Matches the boolean result of a condition node.
    Branch { value: bool },

    /// Matches the session's `button_index` variable.
    ButtonIndex { index: i64 },

    /// Matches the raw input, case-insensitively, trimmed.
    Value { value: String },
}
