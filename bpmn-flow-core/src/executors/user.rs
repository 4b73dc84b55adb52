use super::{ExecContext, ExecOutcome, TaskExecutor};
use crate::error::EngineResult;
use crate::events::{EventPayload, UserTaskDescriptor};
use async_trait::async_trait;
use serde_json::Value;

/// The correlation `messageRef` under which user-task completions arrive.
pub const USER_TASK_REF: &str = "userTask";

/// User task: announce the task to observers and suspend until one of them
/// completes it. The submission's decision and comments are recorded under
/// `{elementId}_decision` / `{elementId}_comments`.
pub struct UserTaskExecutor;

#[async_trait]
impl TaskExecutor for UserTaskExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let candidate_groups = match exec.element.prop("candidateGroups") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(csv)) => csv
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let descriptor = UserTaskDescriptor {
            id: exec.element.id.clone(),
            name: exec.element.display_name().to_string(),
            assignee: exec.resolve_prop("assignee").await,
            candidate_groups,
            priority: exec.element.prop_str("priority").unwrap_or_default(),
            due_date: exec.resolve_prop("dueDate").await,
            form_fields: exec
                .element
                .prop("formFields")
                .cloned()
                .unwrap_or(Value::Null),
        };

        exec.emit(EventPayload::UserTaskCreated { task: descriptor });
        exec.emit(EventPayload::TaskCancellable {});

        let waiter = exec
            .bus
            .wait(USER_TASK_REF, exec.element.id.clone())?;
        exec.set_waiting();

        let payload = tokio::select! {
            biased;
            _ = exec.cancel.cancelled() => {
                return Ok(ExecOutcome::Cancelled {
                    reason: "cancelled while awaiting user decision".to_string(),
                    partial: None,
                });
            }
            result = waiter.recv(None) => result?,
        };
        exec.set_running();

        let decision = payload
            .get("decision")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let comments = payload
            .get("comments")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut ctx = exec.context.write().await;
        ctx.merge(&payload);
        ctx.set(
            format!("{}_decision", exec.element.id),
            Value::String(decision),
        );
        ctx.set(
            format!("{}_comments", exec.element.id),
            Value::String(comments),
        );
        Ok(ExecOutcome::Completed)
    }
}
