use super::{ExecContext, ExecOutcome, TaskExecutor};
use crate::error::{EngineError, EngineResult};
use crate::events::EventPayload;
use async_trait::async_trait;
use serde_json::Value;

/// Service task. `External` publishes a topic and suspends until an external
/// worker completes it through the correlation bus; `Web Service` issues an
/// HTTP call; the remaining implementations are accepted but treated as
/// no-ops with a logged warning.
pub struct ServiceTaskExecutor;

#[async_trait]
impl TaskExecutor for ServiceTaskExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let implementation = exec
            .element
            .prop_str("implementation")
            .unwrap_or_else(|| "External".to_string());

        match implementation.as_str() {
            "External" => execute_external(exec).await,
            "Web Service" => execute_web_service(exec).await,
            other => {
                tracing::warn!(
                    element = %exec.element.id,
                    implementation = other,
                    "service task implementation not supported, treating as no-op"
                );
                Ok(ExecOutcome::Completed)
            }
        }
    }
}

async fn execute_external(exec: &ExecContext) -> EngineResult<ExecOutcome> {
    let topic = {
        let raw = exec
            .element
            .prop_str("topic")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| exec.element.id.clone());
        exec.resolve(&raw).await
    };
    let correlation_key = format!("{}:{}", exec.instance_id, exec.element.id);

    exec.emit(EventPayload::TaskProgress {
        message: format!("external topic `{topic}` published, awaiting completion"),
    });

    let waiter = exec.bus.wait(topic, correlation_key)?;
    exec.set_waiting();

    let payload = tokio::select! {
        biased;
        _ = exec.cancel.cancelled() => {
            return Ok(ExecOutcome::Cancelled {
                reason: "cancelled while awaiting external completion".to_string(),
                partial: None,
            });
        }
        result = waiter.recv(None) => result?,
    };
    exec.set_running();

    let mut ctx = exec.context.write().await;
    ctx.merge(&payload);
    Ok(ExecOutcome::Completed)
}

async fn execute_web_service(exec: &ExecContext) -> EngineResult<ExecOutcome> {
    let endpoint = exec.resolve_prop("endpoint").await;
    if endpoint.is_empty() {
        return Err(EngineError::Executor(format!(
            "service task `{}` declares Web Service but no endpoint",
            exec.element.id
        )));
    }
    let method = exec
        .element
        .prop_str("method")
        .unwrap_or_else(|| "GET".to_string())
        .to_uppercase();

    let request = match method.as_str() {
        "GET" => exec.services.http.get(&endpoint),
        "POST" => {
            let body = exec.context.read().await.as_value();
            exec.services.http.post(&endpoint).json(&body)
        }
        "PUT" => {
            let body = exec.context.read().await.as_value();
            exec.services.http.put(&endpoint).json(&body)
        }
        "DELETE" => exec.services.http.delete(&endpoint),
        other => {
            return Err(EngineError::Executor(format!(
                "service task `{}`: unsupported method `{other}`",
                exec.element.id
            )))
        }
    };

    let send = request.send();
    let response = tokio::select! {
        biased;
        _ = exec.cancel.cancelled() => {
            return Ok(ExecOutcome::Cancelled {
                reason: "cancelled during HTTP call".to_string(),
                partial: None,
            });
        }
        result = send => result.map_err(|e| {
            EngineError::Executor(format!("service task `{}`: {e}", exec.element.id))
        })?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Executor(format!(
            "service task `{}`: endpoint returned {status}",
            exec.element.id
        )));
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);

    let result_var = exec
        .element
        .prop_str("resultVariable")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| format!("{}_result", exec.element.id));
    exec.context.write().await.set(result_var, body);
    Ok(ExecOutcome::Completed)
}

/// Business-rule task: delegate to the decision collaborator, store the
/// verdict, complete instantly.
pub struct BusinessRuleTaskExecutor;

#[async_trait]
impl TaskExecutor for BusinessRuleTaskExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let decision_ref = exec
            .element
            .prop_str("decisionRef")
            .unwrap_or_else(|| exec.element.id.clone());
        let snapshot = exec.context.read().await.as_value();
        let verdict = exec
            .services
            .decisions
            .evaluate(&decision_ref, &snapshot)
            .await
            .map_err(|e| {
                EngineError::Executor(format!("business rule `{decision_ref}`: {e}"))
            })?;

        let result_var = exec
            .element
            .prop_str("resultVariable")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("{}_result", exec.element.id));
        exec.context.write().await.set(result_var, verdict);
        Ok(ExecOutcome::Completed)
    }
}
