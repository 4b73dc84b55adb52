use crate::broadcast::{Broadcaster, ObserverHandle};
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::context::JsonMap;
use crate::correlation::CorrelationBus;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventPayload};
use crate::executors::user::USER_TASK_REF;
use crate::executors::ExecutorRegistry;
use crate::model::ProcessDefinition;
use crate::scheduler::{
    DefinitionRegistry, ElementState, InstanceShared, InstanceStatus, Scheduler,
    CANCEL_DRAIN_DEADLINE,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// The engine façade: instance lifecycle, observer attach/detach, inbound
/// message acceptance, and cancellation. One `Engine` hosts many concurrent
/// workflow instances over a shared broadcaster and correlation bus.
pub struct Engine {
    config: Arc<EngineConfig>,
    broadcaster: Arc<Broadcaster>,
    bus: Arc<CorrelationBus>,
    registry: Arc<ExecutorRegistry>,
    services: Arc<Collaborators>,
    definitions: Arc<DefinitionRegistry>,
    instances: Mutex<HashMap<Uuid, Arc<InstanceShared>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, services: Collaborators) -> Arc<Self> {
        Arc::new(Self {
            broadcaster: Arc::new(Broadcaster::new(config.observer_queue_size)),
            bus: Arc::new(CorrelationBus::new(config.correlation_buffer_ttl)),
            registry: Arc::new(ExecutorRegistry::standard()),
            services: Arc::new(services),
            definitions: Arc::new(DefinitionRegistry::default()),
            instances: Mutex::new(HashMap::new()),
            config: Arc::new(config),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(EngineConfig::default(), Collaborators::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Make a definition addressable by `callActivity` without starting it.
    pub fn register_definition(&self, definition: ProcessDefinition) -> EngineResult<()> {
        definition.validate()?;
        self.definitions.register(Arc::new(definition));
        Ok(())
    }

    /// Start a workflow instance. Returns immediately; execution proceeds
    /// asynchronously on the runtime.
    pub fn start(
        &self,
        definition: ProcessDefinition,
        initial_context: JsonMap,
    ) -> EngineResult<Uuid> {
        definition.validate()?;
        let definition = Arc::new(definition);
        self.definitions.register(Arc::clone(&definition));

        let shared = Arc::new(InstanceShared::new(definition, initial_context));
        let instance_id = shared.instance_id;
        self.instances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(instance_id, Arc::clone(&shared));

        let scheduler = Arc::new(Scheduler {
            shared,
            registry: Arc::clone(&self.registry),
            broadcaster: Arc::clone(&self.broadcaster),
            bus: Arc::clone(&self.bus),
            config: Arc::clone(&self.config),
            services: Arc::clone(&self.services),
            definitions: Arc::clone(&self.definitions),
        });
        tokio::spawn(scheduler.run());

        tracing::info!(instance = %instance_id, "workflow instance started");
        Ok(instance_id)
    }

    /// Start from a serialized YAML definition.
    pub fn start_yaml(&self, yaml: &str, initial_context: JsonMap) -> EngineResult<Uuid> {
        let definition = ProcessDefinition::from_yaml(yaml)?;
        self.start(definition, initial_context)
    }

    fn instance(&self, instance_id: Uuid) -> EngineResult<Arc<InstanceShared>> {
        self.instances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("instance {instance_id}")))
    }

    pub async fn status(&self, instance_id: Uuid) -> EngineResult<InstanceStatus> {
        Ok(self.instance(instance_id)?.snapshot().await)
    }

    /// Cancel a whole instance: every live element transitions to
    /// cancelling, executors observe their tokens, no successors activate.
    pub fn cancel_instance(&self, instance_id: Uuid, reason: &str) -> EngineResult<()> {
        let shared = self.instance(instance_id)?;
        for element_id in shared.live_elements() {
            shared.set_state(&element_id, ElementState::Cancelling);
            self.broadcaster.emit(Event::new(
                instance_id,
                Some(element_id),
                EventPayload::TaskCancelling {
                    reason: reason.to_string(),
                },
            ));
        }
        shared.cancel.cancel();
        tracing::info!(instance = %instance_id, %reason, "instance cancellation requested");
        Ok(())
    }

    /// Cancel a single element. The flow continues along its outgoing flows;
    /// a cancel racing normal completion reports `AlreadyCompleted` and the
    /// result is preserved.
    pub fn cancel_element(
        &self,
        instance_id: Uuid,
        element_id: &str,
        reason: &str,
    ) -> EngineResult<()> {
        let shared = self.instance(instance_id)?;
        match shared.state_of(element_id) {
            Some(state) if state.is_live() => {
                shared.set_state(element_id, ElementState::Cancelling);
                self.broadcaster.emit(Event::new(
                    instance_id,
                    Some(element_id.to_string()),
                    EventPayload::TaskCancelling {
                        reason: reason.to_string(),
                    },
                ));
                shared.cancel_element_token(element_id);

                // drain watchdog: a stuck executor must not leave the cancel
                // unanswered
                let broadcaster = Arc::clone(&self.broadcaster);
                let shared = Arc::clone(&shared);
                let element_id = element_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(CANCEL_DRAIN_DEADLINE).await;
                    if shared
                        .state_of(&element_id)
                        .is_some_and(ElementState::is_live)
                    {
                        broadcaster.emit(Event::new(
                            shared.instance_id,
                            Some(element_id.clone()),
                            EventPayload::TaskCancelFailed {
                                reason: "executor did not drain within deadline".to_string(),
                            },
                        ));
                    }
                });
                Ok(())
            }
            Some(_terminal) => {
                self.broadcaster.emit(Event::new(
                    instance_id,
                    Some(element_id.to_string()),
                    EventPayload::TaskCancelled {
                        error: Some("AlreadyCompleted".to_string()),
                        partial_result: None,
                    },
                ));
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "element {element_id} in instance {instance_id}"
            ))),
        }
    }

    pub fn subscribe(&self) -> ObserverHandle {
        self.broadcaster.subscribe()
    }

    pub fn detach(&self, observer_id: Uuid) {
        self.broadcaster.detach(observer_id);
    }

    /// Forward an external message to the correlation bus. Unknown keys are
    /// buffered for the grace window, never a synchronous error.
    pub fn publish_message(&self, message_ref: &str, correlation_key: &str, payload: JsonMap) {
        self.bus.publish(message_ref, correlation_key, payload);
    }

    /// Complete a suspended user task.
    pub fn complete_user_task(&self, element_id: &str, decision: &str, comments: &str, user: &str) {
        let payload = match json!({
            "decision": decision,
            "comments": comments,
            "completedBy": user,
        }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("literal object"),
        };
        self.bus.publish(USER_TASK_REF, element_id, payload);
    }

    fn find_instance_with_live_element(&self, element_id: &str) -> Option<Uuid> {
        let instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
        instances
            .values()
            .find(|shared| {
                shared
                    .state_of(element_id)
                    .is_some_and(ElementState::is_live)
            })
            .map(|shared| shared.instance_id)
    }

    /// Dispatch one inbound observer-protocol message.
    pub fn handle_observer_message(&self, observer_id: Uuid, message: ObserverMessage) {
        match message {
            ObserverMessage::Ping => {
                self.broadcaster.send_to(
                    observer_id,
                    Event::new(Uuid::nil(), None, EventPayload::Pong {}),
                );
            }
            ObserverMessage::UserTaskComplete {
                task_id,
                decision,
                comments,
                user,
            } => {
                self.complete_user_task(&task_id, &decision, &comments, &user);
            }
            ObserverMessage::TaskCancelRequest {
                instance_id,
                element_id,
                reason,
            } => {
                let target = instance_id.or_else(|| self.find_instance_with_live_element(&element_id));
                match target {
                    Some(iid) => {
                        if let Err(err) = self.cancel_element(iid, &element_id, &reason) {
                            tracing::warn!(element = %element_id, error = %err,
                                "observer cancel request failed");
                        }
                    }
                    None => {
                        tracing::warn!(element = %element_id,
                            "observer cancel request for unknown element");
                    }
                }
            }
            ObserverMessage::ReplayRequest {
                instance_id,
                element_id,
            } => {
                let target =
                    instance_id.or_else(|| self.broadcaster.instance_for_element(&element_id));
                match target {
                    Some(iid) => {
                        self.broadcaster.replay(iid, &element_id, observer_id);
                    }
                    None => {
                        // nothing retained: answer with an empty snapshot
                        self.broadcaster.send_to(
                            observer_id,
                            Event::new(
                                Uuid::nil(),
                                Some(element_id),
                                EventPayload::MessagesSnapshot {
                                    entries: Default::default(),
                                },
                            ),
                        );
                    }
                }
            }
            ObserverMessage::ClearHistory { instance_id } => match instance_id {
                Some(iid) => self.broadcaster.clear_history(iid),
                None => {
                    let ids: Vec<Uuid> = {
                        let instances =
                            self.instances.lock().unwrap_or_else(|p| p.into_inner());
                        instances.keys().copied().collect()
                    };
                    for iid in ids {
                        self.broadcaster.clear_history(iid);
                    }
                }
            },
        }
    }
}

/// Messages an observer may send back over its stream.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ObserverMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "userTask.complete", rename_all = "camelCase")]
    UserTaskComplete {
        task_id: String,
        decision: String,
        #[serde(default)]
        comments: String,
        #[serde(default)]
        user: String,
    },
    #[serde(rename = "task.cancel.request", rename_all = "camelCase")]
    TaskCancelRequest {
        #[serde(default)]
        instance_id: Option<Uuid>,
        element_id: String,
        #[serde(default)]
        reason: String,
    },
    #[serde(rename = "replay.request", rename_all = "camelCase")]
    ReplayRequest {
        #[serde(default)]
        instance_id: Option<Uuid>,
        element_id: String,
    },
    #[serde(rename = "clear.history", rename_all = "camelCase")]
    ClearHistory {
        #[serde(default)]
        instance_id: Option<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        AgentClient, AgentDelta, AgentRequest, AgentStream, MessageTransport, OutboundMessage,
    };
    use crate::scheduler::InstanceState;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(m) => m,
            _ => panic!("fixture must be an object"),
        }
    }

    async fn wait_terminal(engine: &Arc<Engine>, instance_id: Uuid) -> InstanceStatus {
        for _ in 0..4000 {
            let status = engine.status(instance_id).await.unwrap();
            if status.status != InstanceState::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("instance never reached a terminal state");
    }

    async fn wait_waiting(engine: &Arc<Engine>, instance_id: Uuid, element_id: &str) {
        for _ in 0..4000 {
            let status = engine.status(instance_id).await.unwrap();
            if status.element_states.get(element_id) == Some(&ElementState::Waiting) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("element {element_id} never suspended");
    }

    async fn drain_until_complete(handle: &mut ObserverHandle) -> Vec<Event> {
        let mut out = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), handle.events.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event stream closed");
            let done = event.event_type() == "workflow.completed";
            out.push(event);
            if done {
                return out;
            }
        }
    }

    // ── Scripted collaborators ──

    struct SlowAgent {
        tokens: Vec<String>,
        delay: Duration,
        confidence: f64,
    }

    #[async_trait]
    impl AgentClient for SlowAgent {
        async fn stream_completion(&self, _request: AgentRequest) -> AnyResult<AgentStream> {
            let tokens = self.tokens.clone();
            let delay = self.delay;
            let confidence = self.confidence;
            let stream = futures::stream::unfold(0usize, move |i| {
                let tokens = tokens.clone();
                async move {
                    if i < tokens.len() {
                        tokio::time::sleep(delay).await;
                        Some((Ok(AgentDelta::Token(tokens[i].clone())), i + 1))
                    } else if i == tokens.len() {
                        Some((
                            Ok(AgentDelta::Done {
                                confidence: Some(confidence),
                            }),
                            i + 1,
                        ))
                    } else {
                        None
                    }
                }
            });
            Ok(Box::pin(stream))
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn deliver(&self, message: OutboundMessage) -> AnyResult<()> {
            self.sent
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(message);
            Ok(())
        }
    }

    // ── Scenario 1: add-numbers XOR ──

    const ADD_NUMBERS: &str = r#"
id: add-numbers
elements:
  - id: start
    kind: startEvent
  - id: add
    kind: scriptTask
    properties:
      script: "context.sum = context.num1 + context.num2;"
  - id: check
    kind: exclusiveGateway
  - id: big
    kind: task
    name: Success Path
  - id: small
    kind: task
    name: Failure Path
  - id: done_big
    kind: endEvent
  - id: done_small
    kind: endEvent
connections:
  - id: f1
    from: start
    to: add
  - id: f2
    from: add
    to: check
  - id: f3
    from: check
    to: big
    name: Success
    properties:
      condition: "${sum} > 10"
  - id: f4
    from: check
    to: small
    name: Failure
  - id: f5
    from: big
    to: done_big
  - id: f6
    from: small
    to: done_small
"#;

    #[tokio::test]
    async fn add_numbers_takes_success_branch() {
        let engine = Engine::with_defaults();
        let id = engine
            .start_yaml(ADD_NUMBERS, map(json!({"num1": 7, "num2": 5})))
            .unwrap();
        let status = wait_terminal(&engine, id).await;

        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("big"),
            Some(&ElementState::Completed)
        );
        assert_eq!(
            status.element_states.get("small"),
            Some(&ElementState::Skipped)
        );
        assert_eq!(
            status.element_states.get("done_small"),
            Some(&ElementState::Skipped)
        );
        assert_eq!(status.active_tokens, 0);
        assert!(status.context_keys.contains(&"sum".to_string()));
    }

    #[tokio::test]
    async fn add_numbers_takes_failure_branch_on_default() {
        let engine = Engine::with_defaults();
        let id = engine
            .start_yaml(ADD_NUMBERS, map(json!({"num1": 3, "num2": 5})))
            .unwrap();
        let status = wait_terminal(&engine, id).await;

        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("small"),
            Some(&ElementState::Completed)
        );
        assert_eq!(
            status.element_states.get("big"),
            Some(&ElementState::Skipped)
        );
    }

    // ── Scenario 2: user-task approval ──

    const USER_APPROVAL: &str = r#"
id: user-approval
elements:
  - id: start
    kind: startEvent
  - id: approve_step
    kind: userTask
    name: Manager Approval
    properties:
      assignee: "${manager}"
      formFields:
        - name: comments
          type: text
  - id: route
    kind: exclusiveGateway
  - id: accepted
    kind: task
  - id: declined
    kind: task
  - id: end_ok
    kind: endEvent
  - id: end_no
    kind: endEvent
    name: Rejected
connections:
  - id: f1
    from: start
    to: approve_step
  - id: f2
    from: approve_step
    to: route
  - id: f3
    from: route
    to: accepted
    properties:
      condition: '${approve_step_decision} == "approved"'
  - id: f4
    from: route
    to: declined
  - id: f5
    from: accepted
    to: end_ok
  - id: f6
    from: declined
    to: end_no
"#;

    #[tokio::test]
    async fn user_task_approval_routes_on_decision() {
        let engine = Engine::with_defaults();
        let mut observer = engine.subscribe();
        let id = engine
            .start_yaml(USER_APPROVAL, map(json!({"manager": "alice"})))
            .unwrap();

        wait_waiting(&engine, id, "approve_step").await;
        engine.complete_user_task("approve_step", "approved", "looks good", "alice");

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("accepted"),
            Some(&ElementState::Completed)
        );
        assert_eq!(
            status.element_states.get("declined"),
            Some(&ElementState::Skipped)
        );

        let events = drain_until_complete(&mut observer).await;
        let created = events
            .iter()
            .find(|e| e.event_type() == "userTask.created")
            .expect("userTask.created emitted");
        match &created.payload {
            EventPayload::UserTaskCreated { task } => {
                assert_eq!(task.assignee, "alice");
                assert_eq!(task.id, "approve_step");
            }
            other => panic!("wrong payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_user_task_reaches_failure_end() {
        let engine = Engine::with_defaults();
        let id = engine.start_yaml(USER_APPROVAL, map(json!({}))).unwrap();

        wait_waiting(&engine, id, "approve_step").await;
        engine.complete_user_task("approve_step", "rejected", "nope", "bob");

        let status = wait_terminal(&engine, id).await;
        // the "Rejected" end event labels a failure outcome
        assert_eq!(status.status, InstanceState::Failed);
        assert_eq!(
            status.element_states.get("declined"),
            Some(&ElementState::Completed)
        );
    }

    // ── Scenario 3: email-approval correlation ──

    const EMAIL_APPROVAL: &str = r#"
id: email-approval
elements:
  - id: start
    kind: startEvent
  - id: notify
    kind: sendTask
    properties:
      messageType: Email
      to: "${requester}"
      subject: "Approval needed for order ${order_id}"
      messageBody: "Please review order ${order_id}."
      includeApprovalLinks: true
      approvalMessageRef: order-approval
      approvalCorrelationKey: "${order_id}"
  - id: wait_decision
    kind: receiveTask
    properties:
      messageRef: order-approval
      correlationKey: "${order_id}"
      useWebhook: true
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: notify
  - id: f2
    from: notify
    to: wait_decision
  - id: f3
    from: wait_decision
    to: done
"#;

    #[tokio::test]
    async fn email_approval_round_trip() {
        let transport = Arc::new(RecordingTransport::default());
        let services = Collaborators {
            transport: transport.clone(),
            ..Collaborators::default()
        };
        let engine = Engine::new(EngineConfig::default(), services);
        let id = engine
            .start_yaml(
                EMAIL_APPROVAL,
                map(json!({"requester": "dev@example.com", "order_id": "42"})),
            )
            .unwrap();

        wait_waiting(&engine, id, "wait_decision").await;

        // the outbound mail carries resolved fields and both links
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "dev@example.com");
        assert!(sent[0].subject.contains("order 42"));
        assert!(sent[0].body.contains("/webhooks/approve/order-approval/42"));
        assert!(sent[0].body.contains("/webhooks/deny/order-approval/42"));

        // the webhook fires back into the bus
        engine.publish_message(
            "order-approval",
            "42",
            map(json!({"decision": "approved", "method": "email"})),
        );

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        let shared = engine.instance(id).unwrap();
        let ctx = shared.context.read().await;
        assert_eq!(ctx.get_display("decision"), "approved");
        assert_eq!(ctx.get_display("method"), "email");
    }

    // ── Scenario 4: parallel fork/join ──

    const PARALLEL: &str = r#"
id: parallel
elements:
  - id: start
    kind: startEvent
  - id: split
    kind: parallelGateway
  - id: quick
    kind: task
  - id: slow
    kind: timerIntermediateCatchEvent
    properties:
      timerType: duration
      timerDuration: PT2S
  - id: join
    kind: parallelGateway
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: split
  - id: f2
    from: split
    to: quick
  - id: f3
    from: split
    to: slow
  - id: f4
    from: quick
    to: join
  - id: f5
    from: slow
    to: join
  - id: f6
    from: join
    to: done
"#;

    #[tokio::test(start_paused = true)]
    async fn parallel_join_fires_once_after_slower_branch() {
        let engine = Engine::with_defaults();
        let mut observer = engine.subscribe();
        let id = engine.start_yaml(PARALLEL, map(json!({}))).unwrap();

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(status.active_tokens, 0, "token conservation");

        let events = drain_until_complete(&mut observer).await;
        let join_completions = events
            .iter()
            .filter(|e| {
                e.element_id.as_deref() == Some("join")
                    && e.event_type() == "element.completed"
            })
            .count();
        assert_eq!(join_completions, 1, "join must fire exactly once");

        // the join's completion comes after both branches completed
        let idx_of = |eid: &str| {
            events
                .iter()
                .position(|e| {
                    e.element_id.as_deref() == Some(eid)
                        && e.event_type() == "element.completed"
                })
                .unwrap()
        };
        assert!(idx_of("join") > idx_of("quick"));
        assert!(idx_of("join") > idx_of("slow"));
    }

    // ── Scenario 5: deadlock detection ──

    const DEADLOCK: &str = r#"
id: deadlock
elements:
  - id: start
    kind: startEvent
  - id: split
    kind: parallelGateway
  - id: a
    kind: task
  - id: b
    kind: scriptTask
    properties:
      script: "explode_now()"
  - id: join
    kind: parallelGateway
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: split
  - id: f2
    from: split
    to: a
  - id: f3
    from: split
    to: b
  - id: f4
    from: a
    to: join
  - id: f5
    from: b
    to: join
  - id: f6
    from: join
    to: done
"#;

    #[tokio::test]
    async fn failed_branch_trips_deadlock_monitor() {
        let config = EngineConfig {
            deadlock_timeout: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        let engine = Engine::new(config, Collaborators::default());
        let mut observer = engine.subscribe();
        let id = engine.start_yaml(DEADLOCK, map(json!({}))).unwrap();

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Failed);

        let events = drain_until_complete(&mut observer).await;
        let deadlock = events
            .iter()
            .find(|e| e.event_type() == "deadlock")
            .expect("deadlock diagnostic emitted");
        match &deadlock.payload {
            EventPayload::Deadlock {
                join,
                arrived,
                missing,
            } => {
                assert_eq!(join, "join");
                assert_eq!(arrived, &vec!["a".to_string()]);
                assert_eq!(missing, &vec!["b".to_string()]);
            }
            other => panic!("wrong payload {other:?}"),
        }
    }

    // ── Scenario 6: agentic streaming + cancellation + replay ──

    const AGENTIC: &str = r#"
id: agentic
elements:
  - id: start
    kind: startEvent
  - id: agent
    kind: agenticTask
    properties:
      model: test-model
      systemPrompt: You are concise.
      prompt: Summarize the order.
      confidenceThreshold: 0.5
      maxRetries: 1
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: agent
  - id: f2
    from: agent
    to: done
"#;

    #[tokio::test]
    async fn agentic_stream_cancelled_mid_flight_replays_partial() {
        let tokens: Vec<String> = (0..10).map(|i| format!("tok{i} ")).collect();
        let services = Collaborators {
            agent: Arc::new(SlowAgent {
                tokens,
                delay: Duration::from_millis(20),
                confidence: 0.9,
            }),
            ..Collaborators::default()
        };
        let engine = Engine::new(EngineConfig::default(), services);
        let mut observer = engine.subscribe();
        let id = engine.start_yaml(AGENTIC, map(json!({}))).unwrap();

        // cancel after the fifth streamed delta
        let mut deltas = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), observer.events.recv())
                .await
                .expect("timed out")
                .expect("stream closed");
            if event.event_type() == "text.message.content" {
                deltas += 1;
                if deltas == 5 {
                    engine.cancel_element(id, "agent", "user requested").unwrap();
                    break;
                }
            }
        }

        let events = drain_until_complete(&mut observer).await;
        let end = events
            .iter()
            .find(|e| e.event_type() == "text.message.end")
            .expect("message end emitted");
        match &end.payload {
            EventPayload::TextMessageEnd { cancelled, .. } => assert!(cancelled),
            other => panic!("wrong payload {other:?}"),
        }
        assert!(events.iter().any(|e| e.event_type() == "task.cancelled"));

        // single-element cancel lets the flow continue to the end event
        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("agent"),
            Some(&ElementState::Cancelled)
        );

        // replay reproduces exactly the tokens that streamed before the cancel
        let mut late = engine.subscribe();
        engine.handle_observer_message(
            late.observer_id,
            ObserverMessage::ReplayRequest {
                instance_id: Some(id),
                element_id: "agent".to_string(),
            },
        );
        let snapshot = tokio::time::timeout(Duration::from_secs(5), late.events.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        match snapshot.payload {
            EventPayload::MessagesSnapshot { entries } => {
                assert_eq!(entries.messages.len(), 1);
                let message = &entries.messages[0];
                assert!(message.cancelled, "partial content carries cancel marker");
                // at least the five observed tokens, and strictly partial
                assert!(message.content.starts_with("tok0 tok1 tok2 tok3 tok4"));
                assert!(!message.content.contains("tok9"));
            }
            other => panic!("wrong payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn agentic_low_confidence_fails_after_retries() {
        let services = Collaborators {
            agent: Arc::new(SlowAgent {
                tokens: vec!["meh.".to_string()],
                delay: Duration::from_millis(1),
                confidence: 0.1,
            }),
            ..Collaborators::default()
        };
        let engine = Engine::new(EngineConfig::default(), services);
        let mut observer = engine.subscribe();

        let yaml = AGENTIC.replace("maxRetries: 1", "maxRetries: 2");
        let id = engine.start_yaml(&yaml, map(json!({}))).unwrap();

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Failed);

        let events = drain_until_complete(&mut observer).await;
        let retries = events
            .iter()
            .filter(|e| e.event_type() == "task.retry")
            .count();
        assert_eq!(retries, 2);
        let error = events
            .iter()
            .find(|e| e.event_type() == "task.error")
            .expect("task.error emitted");
        match &error.payload {
            EventPayload::TaskError { error_type, .. } => {
                assert_eq!(error_type, "LowConfidence");
            }
            other => panic!("wrong payload {other:?}"),
        }
    }

    // ── Receive timeout ──

    #[tokio::test]
    async fn receive_timeout_fails_the_element() {
        let yaml = r#"
id: timeout
elements:
  - id: start
    kind: startEvent
  - id: wait_msg
    kind: receiveTask
    properties:
      messageRef: never-arrives
      correlationKey: k1
      timeout: "0.05"
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: wait_msg
  - id: f2
    from: wait_msg
    to: done
"#;
        let engine = Engine::with_defaults();
        let mut observer = engine.subscribe();
        let id = engine.start_yaml(yaml, map(json!({}))).unwrap();

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Failed);

        let events = drain_until_complete(&mut observer).await;
        let error = events
            .iter()
            .find(|e| e.event_type() == "task.error")
            .expect("task.error emitted");
        match &error.payload {
            EventPayload::TaskError {
                error_type,
                retryable,
                ..
            } => {
                assert_eq!(error_type, "ReceiveTimeout");
                assert!(retryable);
            }
            other => panic!("wrong payload {other:?}"),
        }
    }

    // ── Boundary timer ──

    const BOUNDARY: &str = r#"
id: boundary
elements:
  - id: start
    kind: startEvent
  - id: wait_msg
    kind: receiveTask
    properties:
      messageRef: slow-reply
      correlationKey: k1
  - id: overdue
    kind: boundaryTimerEvent
    properties:
      attachedTo: wait_msg
      cancelActivity: true
      timerType: duration
      timerDuration: PT1S
  - id: escalate
    kind: task
  - id: done
    kind: endEvent
  - id: done_escalated
    kind: endEvent
connections:
  - id: f1
    from: start
    to: wait_msg
  - id: f2
    from: wait_msg
    to: done
  - id: f3
    from: overdue
    to: escalate
  - id: f4
    from: escalate
    to: done_escalated
"#;

    #[tokio::test(start_paused = true)]
    async fn interrupting_boundary_timer_cancels_and_escalates() {
        let engine = Engine::with_defaults();
        let id = engine.start_yaml(BOUNDARY, map(json!({}))).unwrap();

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("wait_msg"),
            Some(&ElementState::Cancelled)
        );
        assert_eq!(
            status.element_states.get("escalate"),
            Some(&ElementState::Completed)
        );
        assert_eq!(status.active_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_interrupting_boundary_runs_in_parallel() {
        let yaml = BOUNDARY.replace("cancelActivity: true", "cancelActivity: false");
        let engine = Engine::with_defaults();
        let id = engine.start_yaml(&yaml, map(json!({}))).unwrap();

        // boundary fires at 1s while the receive task keeps waiting
        for _ in 0..4000 {
            let status = engine.status(id).await.unwrap();
            if status.element_states.get("escalate") == Some(&ElementState::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mid = engine.status(id).await.unwrap();
        assert_eq!(
            mid.element_states.get("wait_msg"),
            Some(&ElementState::Waiting),
            "activity must keep running on a non-interrupting fire"
        );
        assert_eq!(mid.status, InstanceState::Running);

        // the late reply still completes the activity path
        engine.publish_message("slow-reply", "k1", map(json!({"reply": "late"})));
        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("wait_msg"),
            Some(&ElementState::Completed)
        );
        assert_eq!(status.active_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_interrupting_cycle_boundary_fires_each_repetition() {
        let yaml = BOUNDARY
            .replace("cancelActivity: true", "cancelActivity: false")
            .replace("timerType: duration", "timerType: cycle")
            .replace("timerDuration: PT1S", "timerCycle: R2/PT1S");
        let engine = Engine::with_defaults();
        let mut observer = engine.subscribe();
        let id = engine.start_yaml(&yaml, map(json!({}))).unwrap();

        // each cycle iteration spawns a fresh token down the escalation path
        let mut boundary_fires = 0;
        let mut escalations = 0;
        while escalations < 2 {
            let event = tokio::time::timeout(Duration::from_secs(30), observer.events.recv())
                .await
                .expect("timed out")
                .expect("stream closed");
            if event.event_type() == "element.completed" {
                match event.element_id.as_deref() {
                    Some("overdue") => boundary_fires += 1,
                    Some("escalate") => escalations += 1,
                    _ => {}
                }
            }
        }
        assert_eq!(boundary_fires, 2);

        // the activity itself was never interrupted
        let mid = engine.status(id).await.unwrap();
        assert_eq!(
            mid.element_states.get("wait_msg"),
            Some(&ElementState::Waiting)
        );

        engine.publish_message("slow-reply", "k1", map(json!({"reply": "late"})));
        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(status.active_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn boundary_timer_is_disarmed_when_activity_completes() {
        let engine = Engine::with_defaults();
        let id = engine.start_yaml(BOUNDARY, map(json!({}))).unwrap();

        wait_waiting(&engine, id, "wait_msg").await;
        engine.publish_message("slow-reply", "k1", map(json!({"reply": "fast"})));

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("wait_msg"),
            Some(&ElementState::Completed)
        );
        assert_eq!(status.element_states.get("escalate"), None);
    }

    // ── Timer monotonicity ──

    #[tokio::test(start_paused = true)]
    async fn timer_never_fires_early() {
        let yaml = r#"
id: timed
elements:
  - id: start
    kind: startEvent
  - id: pause
    kind: timerIntermediateCatchEvent
    properties:
      timerType: duration
      timerDuration: PT1S
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: pause
  - id: f2
    from: pause
    to: done
"#;
        let engine = Engine::with_defaults();
        let started = tokio::time::Instant::now();
        let id = engine.start_yaml(yaml, map(json!({}))).unwrap();
        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Succeeded);
        assert!(
            started.elapsed() >= Duration::from_secs(1),
            "timer fired after {:?}",
            started.elapsed()
        );
    }

    // ── Sub-process ──

    #[tokio::test]
    async fn expanded_sub_process_shares_parent_context() {
        let yaml = r#"
id: outer
elements:
  - id: start
    kind: startEvent
  - id: prepare
    kind: subProcess
    expanded: true
    childElements:
      - id: inner_start
        kind: startEvent
      - id: inner_script
        kind: scriptTask
        properties:
          script: "context.prepared = true;"
      - id: inner_end
        kind: endEvent
    childConnections:
      - id: c1
        from: inner_start
        to: inner_script
      - id: c2
        from: inner_script
        to: inner_end
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: prepare
  - id: f2
    from: prepare
    to: done
"#;
        let engine = Engine::with_defaults();
        let id = engine.start_yaml(yaml, map(json!({}))).unwrap();
        let status = wait_terminal(&engine, id).await;

        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(status.active_tokens, 0);
        let shared = engine.instance(id).unwrap();
        assert_eq!(shared.context.read().await.get_display("prepared"), "true");
    }

    // ── Instance cancellation ──

    #[tokio::test]
    async fn cancelling_an_instance_stops_successors() {
        let yaml = r#"
id: cancellable
elements:
  - id: start
    kind: startEvent
  - id: wait_msg
    kind: receiveTask
    properties:
      messageRef: never
      correlationKey: k
  - id: after
    kind: task
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: wait_msg
  - id: f2
    from: wait_msg
    to: after
  - id: f3
    from: after
    to: done
"#;
        let engine = Engine::with_defaults();
        let mut observer = engine.subscribe();
        let id = engine.start_yaml(yaml, map(json!({}))).unwrap();

        wait_waiting(&engine, id, "wait_msg").await;
        engine.cancel_instance(id, "operator abort").unwrap();

        let status = wait_terminal(&engine, id).await;
        assert_eq!(status.status, InstanceState::Cancelled);
        assert_eq!(status.element_states.get("after"), None);

        let events = drain_until_complete(&mut observer).await;
        assert!(events.iter().any(|e| e.event_type() == "task.cancelling"));
        assert!(events.iter().any(|e| e.event_type() == "task.cancelled"));
        match events.last().map(|e| &e.payload) {
            Some(EventPayload::WorkflowCompleted { outcome, .. }) => {
                assert_eq!(*outcome, crate::events::WorkflowOutcome::Cancelled);
            }
            other => panic!("expected workflow.completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelling_a_completed_element_reports_already_completed() {
        let engine = Engine::with_defaults();
        let mut observer = engine.subscribe();
        let id = engine
            .start_yaml(ADD_NUMBERS, map(json!({"num1": 7, "num2": 5})))
            .unwrap();
        wait_terminal(&engine, id).await;

        engine.cancel_element(id, "add", "too late").unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), observer.events.recv())
                .await
                .expect("timed out")
                .expect("stream closed");
            if event.event_type() == "task.cancelled" {
                match event.payload {
                    EventPayload::TaskCancelled { error, .. } => {
                        assert_eq!(error.as_deref(), Some("AlreadyCompleted"));
                        break;
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    // ── Façade errors & protocol ──

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let engine = Engine::with_defaults();
        let missing = Uuid::now_v7();
        assert!(matches!(
            engine.status(missing).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.cancel_instance(missing, "x"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_yaml_creates_no_instance() {
        let engine = Engine::with_defaults();
        let err = engine.start_yaml("id: [unclosed", map(json!({}))).unwrap_err();
        assert!(matches!(err, EngineError::MalformedDefinition(_)));
        assert!(engine
            .instances
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn ping_answers_pong_to_sender_only() {
        let engine = Engine::with_defaults();
        let mut a = engine.subscribe();
        let mut b = engine.subscribe();

        engine.handle_observer_message(a.observer_id, ObserverMessage::Ping);

        let event = tokio::time::timeout(Duration::from_secs(5), a.events.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        assert_eq!(event.event_type(), "pong");
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn observer_messages_parse_from_wire_json() {
        let msg: ObserverMessage = serde_json::from_str(
            r#"{"type":"userTask.complete","taskId":"t1","decision":"approved","comments":"ok","user":"alice"}"#,
        )
        .unwrap();
        match msg {
            ObserverMessage::UserTaskComplete {
                task_id, decision, ..
            } => {
                assert_eq!(task_id, "t1");
                assert_eq!(decision, "approved");
            }
            other => panic!("wrong variant {other:?}"),
        }

        let msg: ObserverMessage =
            serde_json::from_str(r#"{"type":"replay.request","elementId":"agent"}"#).unwrap();
        assert!(matches!(msg, ObserverMessage::ReplayRequest { .. }));

        let msg: ObserverMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ObserverMessage::Ping));
    }

    // ── Inclusive gateway fork/join ──

    const INCLUSIVE: &str = r#"
id: inclusive
elements:
  - id: start
    kind: startEvent
  - id: split
    kind: inclusiveGateway
  - id: a
    kind: task
  - id: b
    kind: task
  - id: c
    kind: task
  - id: join
    kind: inclusiveGateway
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: split
  - id: f2
    from: split
    to: a
    properties:
      condition: "${wants_a}"
  - id: f3
    from: split
    to: b
    properties:
      condition: "${wants_b}"
  - id: f4
    from: split
    to: c
    properties:
      condition: "${wants_c}"
  - id: f5
    from: a
    to: join
  - id: f6
    from: b
    to: join
  - id: f7
    from: c
    to: join
  - id: f8
    from: join
    to: done
"#;

    #[tokio::test]
    async fn inclusive_join_waits_only_for_taken_branches() {
        let engine = Engine::with_defaults();
        let id = engine
            .start_yaml(
                INCLUSIVE,
                map(json!({"wants_a": true, "wants_b": true, "wants_c": false})),
            )
            .unwrap();
        let status = wait_terminal(&engine, id).await;

        assert_eq!(status.status, InstanceState::Succeeded);
        assert_eq!(
            status.element_states.get("a"),
            Some(&ElementState::Completed)
        );
        assert_eq!(
            status.element_states.get("b"),
            Some(&ElementState::Completed)
        );
        assert_eq!(status.element_states.get("c"), Some(&ElementState::Skipped));
        assert_eq!(
            status.element_states.get("join"),
            Some(&ElementState::Completed)
        );
        assert_eq!(status.active_tokens, 0);
    }

    // ── Call activity ──

    #[tokio::test]
    async fn call_activity_runs_registered_definition() {
        let callee = r#"
id: callee
elements:
  - id: s
    kind: startEvent
  - id: work
    kind: scriptTask
    properties:
      script: "context.callee_ran = true;"
  - id: e
    kind: endEvent
connections:
  - id: c1
    from: s
    to: work
  - id: c2
    from: work
    to: e
"#;
        let caller = r#"
id: caller
elements:
  - id: start
    kind: startEvent
  - id: call
    kind: callActivity
    properties:
      calledElement: callee
      inheritVariables: true
  - id: done
    kind: endEvent
connections:
  - id: f1
    from: start
    to: call
  - id: f2
    from: call
    to: done
"#;
        let engine = Engine::with_defaults();
        engine
            .register_definition(ProcessDefinition::from_yaml(callee).unwrap())
            .unwrap();
        let id = engine.start_yaml(caller, map(json!({}))).unwrap();
        let status = wait_terminal(&engine, id).await;

        assert_eq!(status.status, InstanceState::Succeeded);
        let shared = engine.instance(id).unwrap();
        assert_eq!(
            shared.context.read().await.get_display("callee_ran"),
            "true"
        );
    }
}
