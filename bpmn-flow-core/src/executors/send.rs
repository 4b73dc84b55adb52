use super::{ExecContext, ExecOutcome, TaskExecutor};
use crate::collaborators::OutboundMessage;
use crate::error::{EngineError, EngineResult};
use crate::events::EventPayload;
use async_trait::async_trait;

/// Send task: resolve templates in every addressable field, optionally
/// append approval links, and hand the message to the transport
/// collaborator.
pub struct SendTaskExecutor;

#[async_trait]
impl TaskExecutor for SendTaskExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let message_type = exec
            .element
            .prop_str("messageType")
            .unwrap_or_else(|| "Email".to_string());
        let to = exec.resolve_prop("to").await;
        let subject = exec.resolve_prop("subject").await;
        let mut body = exec.resolve_prop("messageBody").await;
        let html = exec.element.prop_bool("htmlFormat");

        if exec.element.prop_bool("includeApprovalLinks") {
            let message_ref = {
                let raw = exec
                    .element
                    .prop_str("approvalMessageRef")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| exec.element.id.clone());
                exec.resolve(&raw).await
            };
            let correlation_key = {
                let raw = exec
                    .element
                    .prop_str("approvalCorrelationKey")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| exec.instance_id.to_string());
                exec.resolve(&raw).await
            };
            let base = exec.config.public_base_url.trim_end_matches('/');
            let approve = format!("{base}/webhooks/approve/{message_ref}/{correlation_key}");
            let deny = format!("{base}/webhooks/deny/{message_ref}/{correlation_key}");
            if html {
                body.push_str(&format!(
                    "<p><a href=\"{approve}\">Approve</a> | <a href=\"{deny}\">Deny</a></p>"
                ));
            } else {
                body.push_str(&format!("\n\nApprove: {approve}\nDeny: {deny}\n"));
            }
        }

        exec.services
            .transport
            .deliver(OutboundMessage {
                message_type: message_type.clone(),
                to: to.clone(),
                subject,
                body,
                html,
            })
            .await
            .map_err(|e| {
                EngineError::Executor(format!("send task `{}`: {e}", exec.element.id))
            })?;

        exec.emit(EventPayload::TaskProgress {
            message: format!("{message_type} dispatched to {to}"),
        });
        Ok(ExecOutcome::Completed)
    }
}
