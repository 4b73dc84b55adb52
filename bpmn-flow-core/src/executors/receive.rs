use super::{timer, ExecContext, ExecOutcome, TaskExecutor};
use crate::error::EngineResult;
use crate::events::EventPayload;
use async_trait::async_trait;
use std::time::Duration;

/// Receive task: register a correlation waiter and suspend until delivery or
/// timeout. The inbound payload merges shallowly into the context on resume.
pub struct ReceiveTaskExecutor;

#[async_trait]
impl TaskExecutor for ReceiveTaskExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let message_ref = {
            let raw = exec
                .element
                .prop_str("messageRef")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| exec.element.id.clone());
            exec.resolve(&raw).await
        };
        let correlation_key = {
            let raw = exec
                .element
                .prop_str("correlationKey")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| exec.instance_id.to_string());
            exec.resolve(&raw).await
        };
        let timeout = parse_timeout(exec);

        if exec.element.prop_bool("useWebhook") {
            tracing::debug!(element = %exec.element.id, message_ref = %message_ref,
                "receive task expects webhook delivery");
        }
        exec.emit(EventPayload::TaskProgress {
            message: format!("waiting for message `{message_ref}` (key `{correlation_key}`)"),
        });

        let waiter = exec.bus.wait(message_ref, correlation_key)?;
        exec.set_waiting();

        let payload = tokio::select! {
            biased;
            _ = exec.cancel.cancelled() => {
                return Ok(ExecOutcome::Cancelled {
                    reason: "cancelled while waiting for message".to_string(),
                    partial: None,
                });
            }
            result = waiter.recv(timeout) => result?,
        };
        exec.set_running();

        let mut ctx = exec.context.write().await;
        ctx.merge(&payload);
        Ok(ExecOutcome::Completed)
    }
}

/// `timeout` is either a bare number of seconds or an ISO-8601-like
/// duration (`PT30S`).
fn parse_timeout(exec: &ExecContext) -> Option<Duration> {
    let raw = exec.element.prop_str("timeout")?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        return Some(Duration::from_secs_f64(secs.max(0.0)));
    }
    match timer::parse_duration(trimmed) {
        Ok(d) => Some(d),
        Err(_) => {
            tracing::warn!(element = %exec.element.id, timeout = %raw,
                "unparseable receive timeout, waiting without deadline");
            None
        }
    }
}
