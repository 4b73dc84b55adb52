//! Agentic task executor.
//!
//! Streams a completion from the AI collaborator, forwarding every token as
//! a `text.message.content` delta and every completed sentence as a
//! `text.message.chunk`. Tool requests round-trip through the MCP
//! collaborator between `task.tool.start`/`task.tool.end`. A confidence
//! score below the threshold triggers a retry up to `maxRetries`; the
//! executor is cancellable at every await and aborts the provider stream by
//! dropping it.

use super::{ExecContext, ExecOutcome, TaskExecutor};
use crate::collaborators::{AgentDelta, AgentRequest};
use crate::error::{EngineError, EngineResult};
use crate::events::EventPayload;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

pub struct AgenticTaskExecutor;

#[async_trait]
impl TaskExecutor for AgenticTaskExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let model = exec
            .element
            .prop_str("model")
            .unwrap_or_else(|| "default".to_string());
        let system_prompt = exec.resolve_prop("systemPrompt").await;
        let prompt = {
            let raw = exec
                .element
                .prop_str("prompt")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| exec.element.display_name().to_string());
            exec.resolve(&raw).await
        };
        let tools: Vec<String> = match exec.element.prop("mcpTools") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let threshold = exec
            .element
            .prop_f64("confidenceThreshold")
            .unwrap_or(exec.config.confidence_default);
        let max_retries = exec
            .element
            .prop_u32("maxRetries")
            .unwrap_or(exec.config.max_retries_default)
            .max(1);
        let custom = exec.element.prop("custom").cloned().unwrap_or(Value::Null);

        exec.emit(EventPayload::TaskThinking {
            message: format!("Initializing {model} agent"),
        });
        exec.emit(EventPayload::TaskCancellable {});

        let mut last_confidence = 0.0;
        for attempt in 1..=max_retries {
            let request = AgentRequest {
                model: model.clone(),
                system_prompt: system_prompt.clone(),
                prompt: prompt.clone(),
                tools: tools.clone(),
                custom: custom.clone(),
            };
            match self.run_attempt(exec, request).await? {
                AttemptOutcome::Cancelled { reason, partial } => {
                    return Ok(ExecOutcome::Cancelled {
                        reason,
                        partial: Some(Value::String(partial)),
                    });
                }
                AttemptOutcome::Finished {
                    content,
                    confidence,
                    message_id,
                } => {
                    last_confidence = confidence;
                    if confidence >= threshold {
                        exec.emit(EventPayload::TextMessageEnd {
                            message_id,
                            cancelled: false,
                            cancellation_reason: None,
                        });
                        let mut ctx = exec.context.write().await;
                        ctx.set(
                            format!("{}_result", exec.element.id),
                            Value::String(content),
                        );
                        ctx.set(format!("{}_confidence", exec.element.id), json!(confidence));
                        return Ok(ExecOutcome::Completed);
                    }
                    exec.emit(EventPayload::TextMessageEnd {
                        message_id,
                        cancelled: false,
                        cancellation_reason: None,
                    });
                    exec.emit(EventPayload::TaskRetry {
                        attempt,
                        confidence,
                    });
                    tracing::debug!(element = %exec.element.id, attempt, confidence, threshold,
                        "agent answer below confidence threshold, retrying");
                }
            }
        }

        Err(EngineError::LowConfidence {
            confidence: last_confidence,
            threshold,
            attempts: max_retries,
        })
    }
}

enum AttemptOutcome {
    Finished {
        content: String,
        confidence: f64,
        message_id: String,
    },
    Cancelled {
        reason: String,
        partial: String,
    },
}

impl AgenticTaskExecutor {
    async fn run_attempt(
        &self,
        exec: &ExecContext,
        request: AgentRequest,
    ) -> EngineResult<AttemptOutcome> {
        let message_id = Uuid::now_v7().to_string();
        exec.emit(EventPayload::TextMessageStart {
            message_id: message_id.clone(),
            role: "assistant".to_string(),
        });

        let mut stream = exec
            .services
            .agent
            .stream_completion(request)
            .await
            .map_err(|e| EngineError::Executor(format!("agent connection: {e}")))?;

        let mut content = String::new();
        let mut sentence_buf = String::new();
        let mut confidence: Option<f64> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = exec.cancel.cancelled() => {
                    let reason = "cancel requested mid-stream".to_string();
                    exec.emit(EventPayload::TextMessageEnd {
                        message_id: message_id.clone(),
                        cancelled: true,
                        cancellation_reason: Some(reason.clone()),
                    });
                    // returning drops the stream, which aborts the provider call
                    return Ok(AttemptOutcome::Cancelled {
                        reason,
                        partial: content,
                    });
                }
                item = stream.next() => item,
            };

            match next {
                Some(Ok(AgentDelta::Token(token))) => {
                    exec.emit(EventPayload::TextMessageContent {
                        message_id: message_id.clone(),
                        delta: token.clone(),
                    });
                    content.push_str(&token);
                    sentence_buf.push_str(&token);
                    for sentence in drain_complete_sentences(&mut sentence_buf) {
                        exec.emit(EventPayload::TextMessageChunk {
                            message_id: message_id.clone(),
                            content: sentence,
                        });
                    }
                }
                Some(Ok(AgentDelta::ToolRequest { name, args })) => {
                    exec.emit(EventPayload::AgentToolUse {
                        name: name.clone(),
                        args: args.clone(),
                    });
                    exec.emit(EventPayload::TaskToolStart {
                        name: name.clone(),
                        args: args.clone(),
                    });
                    let result = match exec.services.tools.invoke(&name, &args).await {
                        Ok(value) => value,
                        Err(e) => json!({"error": e.to_string()}),
                    };
                    exec.emit(EventPayload::TaskToolEnd { name, result });
                }
                Some(Ok(AgentDelta::Done { confidence: c })) => {
                    confidence = c;
                    break;
                }
                Some(Err(e)) => {
                    return Err(EngineError::Executor(format!("agent stream: {e}")));
                }
                None => break,
            }
        }

        // flush a trailing partial sentence so the chunk stream is complete
        let tail = sentence_buf.trim();
        if !tail.is_empty() {
            exec.emit(EventPayload::TextMessageChunk {
                message_id: message_id.clone(),
                content: tail.to_string(),
            });
        }

        Ok(AttemptOutcome::Finished {
            content,
            confidence: confidence.unwrap_or(1.0),
            message_id,
        })
    }
}

/// Split off every complete sentence currently in the buffer. A sentence
/// ends at `.`, `!`, `?` or a blank line.
fn drain_complete_sentences(buf: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        let bytes = buf.as_bytes();
        let mut end = None;
        for i in 0..bytes.len() {
            match bytes[i] {
                b'.' | b'!' | b'?' => {
                    end = Some(i + 1);
                    break;
                }
                b'\n' if i + 1 < bytes.len() && bytes[i + 1] == b'\n' => {
                    end = Some(i + 2);
                    break;
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                let sentence: String = buf.drain(..end).collect();
                let trimmed = sentence.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_string());
                }
            }
            None => break,
        }
    }
    out
}
