use crate::model::ElementKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One event on the observer wire. The payload carries the discriminating
/// `type` field; `instanceId`, `elementId` and the server-assigned
/// `timestamp` ride alongside. The timestamp assigned here at emission is
/// canonical; replay reuses it so live and replayed streams agree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(instance_id: Uuid, element_id: Option<String>, payload: EventPayload) -> Self {
        Self {
            payload,
            instance_id,
            element_id,
            timestamp: Utc::now(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowOutcome {
    Success,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "workflow.started", rename_all = "camelCase")]
    WorkflowStarted { process_id: String, name: String },

    #[serde(rename = "workflow.completed", rename_all = "camelCase")]
    WorkflowCompleted {
        outcome: WorkflowOutcome,
        duration_ms: u64,
    },

    #[serde(rename = "element.activated", rename_all = "camelCase")]
    ElementActivated { name: String, kind: ElementKind },

    #[serde(rename = "element.completed", rename_all = "camelCase")]
    ElementCompleted {},

    #[serde(rename = "element.skipped", rename_all = "camelCase")]
    ElementSkipped {},

    #[serde(rename = "task.progress", rename_all = "camelCase")]
    TaskProgress { message: String },

    #[serde(rename = "task.thinking", rename_all = "camelCase")]
    TaskThinking { message: String },

    #[serde(rename = "task.tool.start", rename_all = "camelCase")]
    TaskToolStart { name: String, args: Value },

    #[serde(rename = "task.tool.end", rename_all = "camelCase")]
    TaskToolEnd { name: String, result: Value },

    #[serde(rename = "text.message.start", rename_all = "camelCase")]
    TextMessageStart { message_id: String, role: String },

    /// Incremental delta, one per streamed token.
    #[serde(rename = "text.message.content", rename_all = "camelCase")]
    TextMessageContent { message_id: String, delta: String },

    /// A complete sentence, emitted when a terminator is crossed.
    #[serde(rename = "text.message.chunk", rename_all = "camelCase")]
    TextMessageChunk { message_id: String, content: String },

    #[serde(rename = "text.message.end", rename_all = "camelCase")]
    TextMessageEnd {
        message_id: String,
        cancelled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancellation_reason: Option<String>,
    },

    #[serde(rename = "agent.tool_use", rename_all = "camelCase")]
    AgentToolUse { name: String, args: Value },

    #[serde(rename = "userTask.created", rename_all = "camelCase")]
    UserTaskCreated { task: UserTaskDescriptor },

    #[serde(rename = "gateway.evaluating", rename_all = "camelCase")]
    GatewayEvaluating {},

    #[serde(rename = "gateway.path_taken", rename_all = "camelCase")]
    GatewayPathTaken {
        taken: Vec<String>,
        not_taken: Vec<String>,
    },

    #[serde(rename = "task.error", rename_all = "camelCase")]
    TaskError {
        message: String,
        error_type: String,
        retryable: bool,
    },

    #[serde(rename = "task.retry", rename_all = "camelCase")]
    TaskRetry { attempt: u32, confidence: f64 },

    #[serde(rename = "task.cancellable", rename_all = "camelCase")]
    TaskCancellable {},

    #[serde(rename = "task.cancelling", rename_all = "camelCase")]
    TaskCancelling { reason: String },

    #[serde(rename = "task.cancelled", rename_all = "camelCase")]
    TaskCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_result: Option<Value>,
    },

    #[serde(rename = "task.cancel.failed", rename_all = "camelCase")]
    TaskCancelFailed { reason: String },

    #[serde(rename = "messages.snapshot", rename_all = "camelCase")]
    MessagesSnapshot { entries: ElementHistory },

    #[serde(rename = "deadlock", rename_all = "camelCase")]
    Deadlock {
        join: String,
        arrived: Vec<String>,
        missing: Vec<String>,
    },

    #[serde(rename = "pong", rename_all = "camelCase")]
    Pong {},
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::WorkflowStarted { .. } => "workflow.started",
            EventPayload::WorkflowCompleted { .. } => "workflow.completed",
            EventPayload::ElementActivated { .. } => "element.activated",
            EventPayload::ElementCompleted {} => "element.completed",
            EventPayload::ElementSkipped {} => "element.skipped",
            EventPayload::TaskProgress { .. } => "task.progress",
            EventPayload::TaskThinking { .. } => "task.thinking",
            EventPayload::TaskToolStart { .. } => "task.tool.start",
            EventPayload::TaskToolEnd { .. } => "task.tool.end",
            EventPayload::TextMessageStart { .. } => "text.message.start",
            EventPayload::TextMessageContent { .. } => "text.message.content",
            EventPayload::TextMessageChunk { .. } => "text.message.chunk",
            EventPayload::TextMessageEnd { .. } => "text.message.end",
            EventPayload::AgentToolUse { .. } => "agent.tool_use",
            EventPayload::UserTaskCreated { .. } => "userTask.created",
            EventPayload::GatewayEvaluating {} => "gateway.evaluating",
            EventPayload::GatewayPathTaken { .. } => "gateway.path_taken",
            EventPayload::TaskError { .. } => "task.error",
            EventPayload::TaskRetry { .. } => "task.retry",
            EventPayload::TaskCancellable {} => "task.cancellable",
            EventPayload::TaskCancelling { .. } => "task.cancelling",
            EventPayload::TaskCancelled { .. } => "task.cancelled",
            EventPayload::TaskCancelFailed { .. } => "task.cancel.failed",
            EventPayload::MessagesSnapshot { .. } => "messages.snapshot",
            EventPayload::Deadlock { .. } => "deadlock",
            EventPayload::Pong {} => "pong",
        }
    }
}

/// What a user task looks like to an observer rendering an approval modal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTaskDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub due_date: String,
    #[serde(default)]
    pub form_fields: Value,
}

// ─── Per-element history (replay source of truth) ─────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
}

/// Retained activity for one element: the replay source of truth. Sentence
/// chunks are collapsed into whole messages here; tool start/end pairs merge
/// into single records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementHistory {
    #[serde(default)]
    pub thinking: Vec<ThinkingEntry>,
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
    #[serde(default)]
    pub messages: Vec<MessageEntry>,
}

impl ElementHistory {
    pub fn is_empty(&self) -> bool {
        self.thinking.is_empty() && self.tools.is_empty() && self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_dotted_type_tags() {
        let event = Event::new(
            Uuid::nil(),
            Some("gw1".to_string()),
            EventPayload::GatewayPathTaken {
                taken: vec!["f1".to_string()],
                not_taken: vec!["f2".to_string()],
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "gateway.path_taken");
        assert_eq!(json["elementId"], "gw1");
        assert_eq!(json["taken"][0], "f1");
        assert_eq!(json["notTaken"][0], "f2");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn events_round_trip() {
        let event = Event::new(
            Uuid::now_v7(),
            Some("agent1".to_string()),
            EventPayload::TextMessageEnd {
                message_id: "m1".to_string(),
                cancelled: true,
                cancellation_reason: Some("user requested".to_string()),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "text.message.end");
        match back.payload {
            EventPayload::TextMessageEnd { cancelled, .. } => assert!(cancelled),
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
