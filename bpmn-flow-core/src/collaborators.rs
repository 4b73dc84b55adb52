//! Seams to the external collaborators the core does not own: the AI
//! provider, MCP tool host, outbound message transports, and the decision
//! service. Each is a trait with a no-op/logging default so the engine runs
//! standalone; production wiring supplies real implementations.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One streaming completion request against the AI collaborator.
#[derive(Clone, Debug, Default)]
pub struct AgentRequest {
    pub model: String,
    pub system_prompt: String,
    pub prompt: String,
    pub tools: Vec<String>,
    /// Free-form provider configuration from the element's `custom` block.
    pub custom: Value,
}

/// Incremental output of a streaming completion.
#[derive(Clone, Debug)]
pub enum AgentDelta {
    /// One streamed token.
    Token(String),
    /// The model asked for a tool invocation.
    ToolRequest { name: String, args: Value },
    /// Stream finished. Absent confidence is treated as 1.0.
    Done { confidence: Option<f64> },
}

pub type AgentStream = BoxStream<'static, Result<AgentDelta>>;

/// Opaque token-streaming completion call. Dropping the returned stream
/// aborts the in-flight provider request; cancellation relies on this.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn stream_completion(&self, request: AgentRequest) -> Result<AgentStream>;
}

/// MCP tool host, invoked between `task.tool.start` and `task.tool.end`.
#[async_trait]
pub trait McpToolClient: Send + Sync {
    async fn invoke(&self, tool: &str, args: &Value) -> Result<Value>;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message_type: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub html: bool,
}

/// Outbound email/SMS/webhook delivery.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn deliver(&self, message: OutboundMessage) -> Result<()>;
}

/// Business-rule delegation (`businessRuleTask`).
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn evaluate(&self, decision_ref: &str, context: &Value) -> Result<Value>;
}

/// The bundle handed to every executor.
pub struct Collaborators {
    pub agent: Arc<dyn AgentClient>,
    pub tools: Arc<dyn McpToolClient>,
    pub transport: Arc<dyn MessageTransport>,
    pub decisions: Arc<dyn DecisionService>,
    pub http: reqwest::Client,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            agent: Arc::new(NullAgent),
            tools: Arc::new(NullToolClient),
            transport: Arc::new(LogTransport),
            decisions: Arc::new(NullDecisionService),
            http: reqwest::Client::new(),
        }
    }
}

// ─── Default (standalone) implementations ─────────────────────

/// Completes immediately with a canned token and full confidence.
pub struct NullAgent;

#[async_trait]
impl AgentClient for NullAgent {
    async fn stream_completion(&self, request: AgentRequest) -> Result<AgentStream> {
        tracing::warn!(model = %request.model, "no agent client configured, returning stub completion");
        let deltas = vec![
            Ok(AgentDelta::Token("No agent client is configured.".to_string())),
            Ok(AgentDelta::Done {
                confidence: Some(1.0),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

pub struct NullToolClient;

#[async_trait]
impl McpToolClient for NullToolClient {
    async fn invoke(&self, tool: &str, _args: &Value) -> Result<Value> {
        tracing::warn!(%tool, "no MCP client configured, tool call returns null");
        Ok(Value::Null)
    }
}

/// Logs outbound messages instead of delivering them.
pub struct LogTransport;

#[async_trait]
impl MessageTransport for LogTransport {
    async fn deliver(&self, message: OutboundMessage) -> Result<()> {
        tracing::info!(
            message_type = %message.message_type,
            to = %message.to,
            subject = %message.subject,
            "outbound message (log transport)"
        );
        Ok(())
    }
}

pub struct NullDecisionService;

#[async_trait]
impl DecisionService for NullDecisionService {
    async fn evaluate(&self, decision_ref: &str, _context: &Value) -> Result<Value> {
        tracing::warn!(%decision_ref, "no decision service configured, returning null");
        Ok(Value::Null)
    }
}
