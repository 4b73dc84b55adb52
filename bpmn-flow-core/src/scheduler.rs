//! Instance scheduler: drives one workflow instance over its graph.
//!
//! The frontier is a `JoinSet` of element tasks; suspension inside an
//! executor never blocks sibling frontier elements. Parallel forks multiply
//! tokens, joins merge them, end events retire them. A join that stalls past
//! the configured deadline trips the deadlock monitor.

use crate::broadcast::Broadcaster;
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::context::{Context, JsonMap, SharedContext};
use crate::correlation::CorrelationBus;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventPayload, WorkflowOutcome};
use crate::executors::{timer, ExecContext, ExecOutcome, ExecutorRegistry};
use crate::gateway;
use crate::model::{Element, ElementKind, FlowScope, ProcessDefinition};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a cancelled executor gets to drain before the scheduler reports
/// `task.cancel.failed`.
pub const CANCEL_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

// ─── Instance state ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Per-element lifecycle:
/// absent → activated → (running | waiting | cancelling)
///        → completed | failed | cancelled | skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementState {
    Activated,
    Running,
    Waiting,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl ElementState {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ElementState::Activated
                | ElementState::Running
                | ElementState::Waiting
                | ElementState::Cancelling
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

pub type ElementStates = Arc<Mutex<HashMap<String, ElementState>>>;

/// State shared between the engine façade, the scheduler, and status
/// queries. The scheduler exclusively drives transitions; the façade reads
/// and requests cancellation.
pub struct InstanceShared {
    pub instance_id: Uuid,
    pub definition: Arc<ProcessDefinition>,
    pub context: SharedContext,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    status: Mutex<InstanceState>,
    states: ElementStates,
    element_cancels: Mutex<HashMap<String, CancellationToken>>,
    active_tokens: AtomicI64,
}

impl InstanceShared {
    pub fn new(definition: Arc<ProcessDefinition>, initial_context: JsonMap) -> Self {
        Self {
            instance_id: Uuid::now_v7(),
            definition,
            context: crate::context::shared(Context::new(initial_context)),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            status: Mutex::new(InstanceState::Running),
            states: Arc::new(Mutex::new(HashMap::new())),
            element_cancels: Mutex::new(HashMap::new()),
            active_tokens: AtomicI64::new(0),
        }
    }

    pub fn status(&self) -> InstanceState {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_status(&self, state: InstanceState) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn states(&self) -> ElementStates {
        Arc::clone(&self.states)
    }

    pub fn state_of(&self, element_id: &str) -> Option<ElementState> {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(element_id)
            .copied()
    }

    pub fn set_state(&self, element_id: &str, state: ElementState) {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(element_id.to_string(), state);
    }

    /// Mark skipped only if the element never started.
    fn mark_skipped(&self, element_id: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        if states.contains_key(element_id) {
            false
        } else {
            states.insert(element_id.to_string(), ElementState::Skipped);
            true
        }
    }

    fn register_cancel(&self, element_id: &str, token: CancellationToken) {
        self.element_cancels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(element_id.to_string(), token);
    }

    fn unregister_cancel(&self, element_id: &str) {
        self.element_cancels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(element_id);
    }

    /// Trigger an individual element's cancellation token. Returns false if
    /// the element has no live executor.
    pub fn cancel_element_token(&self, element_id: &str) -> bool {
        let cancels = self
            .element_cancels
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match cancels.get(element_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn live_elements(&self) -> Vec<String> {
        let states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let mut live: Vec<String> = states
            .iter()
            .filter(|(_, st)| st.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        live.sort();
        live
    }

    fn tokens_add(&self, delta: i64) {
        self.active_tokens.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn active_tokens(&self) -> i64 {
        self.active_tokens.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> InstanceStatus {
        let context_keys = self.context.read().await.keys();
        let element_states = self
            .states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        InstanceStatus {
            instance_id: self.instance_id,
            process_id: self.definition.id.clone(),
            status: self.status(),
            started_at: self.started_at,
            frontier: self.live_elements(),
            context_keys,
            active_tokens: self.active_tokens().max(0) as u64,
            element_states,
        }
    }
}

/// Read-only status snapshot returned by the façade.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: Uuid,
    pub process_id: String,
    pub status: InstanceState,
    pub started_at: DateTime<Utc>,
    pub frontier: Vec<String>,
    pub context_keys: Vec<String>,
    pub active_tokens: u64,
    pub element_states: HashMap<String, ElementState>,
}

/// Known process definitions, addressable by id for `callActivity`.
#[derive(Default)]
pub struct DefinitionRegistry {
    inner: Mutex<HashMap<String, Arc<ProcessDefinition>>>,
}

impl DefinitionRegistry {
    pub fn register(&self, definition: Arc<ProcessDefinition>) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(definition.id.clone(), definition);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }
}

// ─── Scheduler ────────────────────────────────────────────────

pub struct Scheduler {
    pub shared: Arc<InstanceShared>,
    pub registry: Arc<ExecutorRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub bus: Arc<CorrelationBus>,
    pub config: Arc<EngineConfig>,
    pub services: Arc<Collaborators>,
    pub definitions: Arc<DefinitionRegistry>,
}

#[derive(Debug)]
struct ScopeOutcome {
    failure_end: bool,
}

#[derive(Debug)]
enum ElementTaskOutcome {
    Completed { failure_end: bool },
    Failed(EngineError),
    Cancelled { by_instance: bool },
}

#[derive(Debug)]
enum StepResult {
    Element {
        element_id: String,
        kind: ElementKind,
        outcome: ElementTaskOutcome,
    },
    Boundary {
        boundary_id: String,
        attached_to: String,
        cancel_activity: bool,
    },
    JoinTimeout {
        join_id: String,
    },
}

#[derive(Default)]
struct JoinState {
    arrived_from: Vec<String>,
    watchdog: Option<AbortHandle>,
}

impl Scheduler {
    /// Drive the instance to a terminal state. Spawned once per `start`.
    pub async fn run(self: Arc<Self>) {
        let shared = Arc::clone(&self.shared);
        self.emit(
            None,
            EventPayload::WorkflowStarted {
                process_id: shared.definition.id.clone(),
                name: shared.definition.name.clone(),
            },
        );

        let scope = FlowScope::root(&shared.definition);
        let result = match scope.start_event() {
            Some(start) => {
                let entry = start.id.clone();
                Arc::clone(&self)
                    .run_scope(scope, entry, Arc::clone(&shared.context))
                    .await
            }
            None => Err(EngineError::MalformedDefinition(
                "no start event".to_string(),
            )),
        };

        let outcome = match result {
            Ok(ScopeOutcome { failure_end: false }) => {
                shared.set_status(InstanceState::Succeeded);
                WorkflowOutcome::Success
            }
            Ok(ScopeOutcome { failure_end: true }) => {
                shared.set_status(InstanceState::Failed);
                WorkflowOutcome::Failed
            }
            Err(err) if err.is_cancelled() => {
                shared.set_status(InstanceState::Cancelled);
                WorkflowOutcome::Cancelled
            }
            Err(err) => {
                tracing::warn!(instance = %shared.instance_id, error = %err, "instance failed");
                shared.set_status(InstanceState::Failed);
                WorkflowOutcome::Failed
            }
        };

        let duration_ms = (Utc::now() - shared.started_at).num_milliseconds().max(0) as u64;
        self.emit(
            None,
            EventPayload::WorkflowCompleted {
                outcome,
                duration_ms,
            },
        );
    }

    fn emit(&self, element_id: Option<String>, payload: EventPayload) {
        self.broadcaster
            .emit(Event::new(self.shared.instance_id, element_id, payload));
    }

    /// Interpret one graph level (the top-level process or a sub-process
    /// child graph). Boxed for recursion.
    fn run_scope(
        self: Arc<Self>,
        scope: FlowScope,
        entry: String,
        ctx: SharedContext,
    ) -> BoxFuture<'static, EngineResult<ScopeOutcome>> {
        let sched = self;
        Box::pin(async move {
            let mut run = ScopeRun {
                sched,
                scope,
                ctx,
                tasks: JoinSet::new(),
                joins: HashMap::new(),
                watchers: HashMap::new(),
                boundary_cancelled: HashSet::new(),
                failure_end: false,
                first_error: None,
                cancelled: false,
            };

            run.sched.shared.tokens_add(1);
            run.spawn_element(&entry);

            while let Some(joined) = run.tasks.join_next().await {
                match joined {
                    Ok(step) => run.handle_step(step).await,
                    Err(err) if err.is_cancelled() => continue,
                    Err(err) => {
                        run.first_error.get_or_insert(EngineError::Executor(format!(
                            "element task failed: {err}"
                        )));
                    }
                }
            }

            if run.cancelled {
                return Err(EngineError::Cancelled("instance cancelled".to_string()));
            }
            if let Some(err) = run.first_error.take() {
                return Err(err);
            }
            Ok(ScopeOutcome {
                failure_end: run.failure_end,
            })
        })
    }

    /// Execute one element end to end, emitting lifecycle events. Returns to
    /// the scope coordinator, which routes successors.
    async fn execute_element(
        self: Arc<Self>,
        ctx: SharedContext,
        element: Element,
    ) -> StepResult {
        let shared = Arc::clone(&self.shared);
        let element_id = element.id.clone();
        let kind = element.kind;

        if shared.cancel.is_cancelled() {
            return StepResult::Element {
                element_id,
                kind,
                outcome: ElementTaskOutcome::Cancelled { by_instance: true },
            };
        }

        let cancel = shared.cancel.child_token();
        shared.register_cancel(&element_id, cancel.clone());
        shared.set_state(&element_id, ElementState::Activated);
        self.emit(
            Some(element_id.clone()),
            EventPayload::ElementActivated {
                name: element.display_name().to_string(),
                kind,
            },
        );
        shared.set_state(&element_id, ElementState::Running);

        let outcome = Arc::clone(&self)
            .dispatch_element(&ctx, &element, cancel.clone())
            .await;

        shared.unregister_cancel(&element_id);

        match &outcome {
            ElementTaskOutcome::Completed { .. } => {
                shared.set_state(&element_id, ElementState::Completed);
                self.emit(Some(element_id.clone()), EventPayload::ElementCompleted {});
            }
            ElementTaskOutcome::Failed(err) => {
                shared.set_state(&element_id, ElementState::Failed);
                self.emit(
                    Some(element_id.clone()),
                    EventPayload::TaskError {
                        message: err.to_string(),
                        error_type: err.error_type().to_string(),
                        retryable: err.retryable(),
                    },
                );
            }
            ElementTaskOutcome::Cancelled { .. } => {
                shared.set_state(&element_id, ElementState::Cancelled);
            }
        }

        StepResult::Element {
            element_id,
            kind,
            outcome,
        }
    }

    async fn dispatch_element(
        self: Arc<Self>,
        ctx: &SharedContext,
        element: &Element,
        cancel: CancellationToken,
    ) -> ElementTaskOutcome {
        match element.kind {
            kind if kind.is_gateway() => ElementTaskOutcome::Completed { failure_end: false },
            ElementKind::SubProcess => self.run_sub_process(ctx, element).await,
            ElementKind::CallActivity => self.run_call_activity(ctx, element).await,
            ElementKind::BoundaryTimerEvent => {
                // boundary events are armed by the scheduler, not the frontier
                ElementTaskOutcome::Completed { failure_end: false }
            }
            kind => {
                let Some(executor) = self.registry.get(kind) else {
                    tracing::warn!(element = %element.id, kind = kind.label(),
                        "no executor registered, treating as instant");
                    return ElementTaskOutcome::Completed { failure_end: false };
                };
                let exec = ExecContext {
                    instance_id: self.shared.instance_id,
                    element: element.clone(),
                    context: Arc::clone(ctx),
                    broadcaster: Arc::clone(&self.broadcaster),
                    bus: Arc::clone(&self.bus),
                    cancel,
                    config: Arc::clone(&self.config),
                    services: Arc::clone(&self.services),
                    states: self.shared.states(),
                };
                match executor.execute(&exec).await {
                    Ok(ExecOutcome::Completed) => {
                        ElementTaskOutcome::Completed { failure_end: false }
                    }
                    Ok(ExecOutcome::Cancelled { reason, partial }) => {
                        self.emit(
                            Some(element.id.clone()),
                            EventPayload::TaskCancelled {
                                error: None,
                                partial_result: partial,
                            },
                        );
                        tracing::debug!(element = %element.id, %reason, "element cancelled");
                        ElementTaskOutcome::Cancelled {
                            by_instance: self.shared.cancel.is_cancelled(),
                        }
                    }
                    Err(err) if err.is_cancelled() => {
                        self.emit(
                            Some(element.id.clone()),
                            EventPayload::TaskCancelled {
                                error: None,
                                partial_result: None,
                            },
                        );
                        ElementTaskOutcome::Cancelled {
                            by_instance: self.shared.cancel.is_cancelled(),
                        }
                    }
                    Err(err) => ElementTaskOutcome::Failed(err),
                }
            }
        }
    }

    async fn run_sub_process(
        self: Arc<Self>,
        ctx: &SharedContext,
        element: &Element,
    ) -> ElementTaskOutcome {
        if !element.expanded || element.child_elements.is_empty() {
            return ElementTaskOutcome::Completed { failure_end: false };
        }
        let child_scope = FlowScope::child_of(element);
        let Some(start) = child_scope.start_event() else {
            return ElementTaskOutcome::Failed(EngineError::MalformedDefinition(format!(
                "sub-process `{}` has no start event",
                element.id
            )));
        };
        let entry = start.id.clone();
        match Arc::clone(&self)
            .run_scope(child_scope, entry, Arc::clone(ctx))
            .await
        {
            Ok(outcome) => ElementTaskOutcome::Completed {
                failure_end: outcome.failure_end,
            },
            Err(err) if err.is_cancelled() => ElementTaskOutcome::Cancelled {
                by_instance: self.shared.cancel.is_cancelled(),
            },
            Err(err) => ElementTaskOutcome::Failed(err),
        }
    }

    async fn run_call_activity(
        self: Arc<Self>,
        ctx: &SharedContext,
        element: &Element,
    ) -> ElementTaskOutcome {
        let called = element.prop_str("calledElement").unwrap_or_default();
        let Some(definition) = self.definitions.get(&called) else {
            return ElementTaskOutcome::Failed(EngineError::NotFound(format!(
                "call activity `{}` references unknown definition `{called}`",
                element.id
            )));
        };
        let child_scope = FlowScope::root(&definition);
        let Some(start) = child_scope.start_event() else {
            return ElementTaskOutcome::Failed(EngineError::MalformedDefinition(format!(
                "called definition `{called}` has no start event"
            )));
        };
        let entry = start.id.clone();

        let inherit = element.prop_bool("inheritVariables");
        let child_ctx = if inherit {
            Arc::clone(ctx)
        } else {
            crate::context::shared(Context::default())
        };

        if element.prop_bool("async") {
            let sched = Arc::clone(&self);
            let called_id = called.clone();
            tokio::spawn(async move {
                match sched.run_scope(child_scope, entry, child_ctx).await {
                    Ok(_) => {
                        tracing::info!(called = %called_id, "async call activity completed")
                    }
                    Err(err) => {
                        tracing::warn!(called = %called_id, error = %err, "async call activity failed")
                    }
                }
            });
            return ElementTaskOutcome::Completed { failure_end: false };
        }

        match Arc::clone(&self)
            .run_scope(child_scope, entry, Arc::clone(&child_ctx))
            .await
        {
            Ok(outcome) => {
                if !inherit {
                    // surface the callee's results to the caller
                    let child_snapshot = child_ctx.read().await.snapshot();
                    ctx.write().await.merge(&child_snapshot);
                }
                ElementTaskOutcome::Completed {
                    failure_end: outcome.failure_end,
                }
            }
            Err(err) if err.is_cancelled() => ElementTaskOutcome::Cancelled {
                by_instance: self.shared.cancel.is_cancelled(),
            },
            Err(err) => ElementTaskOutcome::Failed(err),
        }
    }
}

/// An end event marks the instance failed when its properties or name label
/// a failure/rejection path. Flow names never route; this is an outcome
/// label on the terminal element itself.
fn end_event_is_failure(element: &Element) -> bool {
    if let Some(outcome) = element.prop_str("outcome") {
        return matches!(
            outcome.trim().to_lowercase().as_str(),
            "failure" | "failed" | "rejected" | "denied"
        );
    }
    let name = element.name.to_lowercase();
    name.contains("fail") || name.contains("reject") || name.contains("denied")
}

// ─── Per-scope coordinator state ──────────────────────────────

struct ScopeRun {
    sched: Arc<Scheduler>,
    scope: FlowScope,
    ctx: SharedContext,
    tasks: JoinSet<StepResult>,
    joins: HashMap<String, JoinState>,
    watchers: HashMap<String, Vec<AbortHandle>>,
    /// Activities whose cancellation was initiated by an interrupting
    /// boundary timer; their successors come from the boundary instead.
    boundary_cancelled: HashSet<String>,
    failure_end: bool,
    first_error: Option<EngineError>,
    cancelled: bool,
}

impl ScopeRun {
    fn emit(&self, element_id: &str, payload: EventPayload) {
        self.sched.broadcaster.emit(Event::new(
            self.sched.shared.instance_id,
            Some(element_id.to_string()),
            payload,
        ));
    }

    fn spawn_element(&mut self, element_id: &str) {
        let Some(element) = self.scope.element(element_id) else {
            tracing::warn!(element = element_id, "routing to unknown element, dropping token");
            self.sched.shared.tokens_add(-1);
            return;
        };
        let element = element.clone();

        // arm boundary timers attached to this activity
        for boundary in self.scope.boundary_timers_for(&element.id) {
            let cancel_activity = boundary.prop_bool("cancelActivity");
            let deadlines: Vec<Duration> = match timer::parse_timer(boundary) {
                Ok(timer::TimerSpec::Duration(d)) => vec![d],
                Ok(timer::TimerSpec::Date(at)) => {
                    vec![(at - Utc::now()).to_std().unwrap_or(Duration::ZERO)]
                }
                Ok(timer::TimerSpec::Cycle {
                    repetitions,
                    interval,
                }) => {
                    // interrupting timers stop the activity on the first
                    // fire; non-interrupting cycles fire once per repetition
                    let fires = if cancel_activity { 1 } else { repetitions };
                    (1..=fires).map(|i| interval * i).collect()
                }
                Err(err) => {
                    tracing::warn!(boundary = %boundary.id, error = %err,
                        "unparseable boundary timer, not arming");
                    continue;
                }
            };
            for deadline in deadlines {
                let boundary_id = boundary.id.clone();
                let attached_to = element.id.clone();
                let handle = self.tasks.spawn(async move {
                    tokio::time::sleep(deadline).await;
                    StepResult::Boundary {
                        boundary_id,
                        attached_to,
                        cancel_activity,
                    }
                });
                self.watchers
                    .entry(element.id.clone())
                    .or_default()
                    .push(handle);
            }
        }

        let sched = Arc::clone(&self.sched);
        let ctx = Arc::clone(&self.ctx);
        self.tasks.spawn(sched.execute_element(ctx, element));
    }

    async fn handle_step(&mut self, step: StepResult) {
        match step {
            StepResult::Element {
                element_id,
                kind,
                outcome,
            } => {
                self.abort_watchers(&element_id);
                match outcome {
                    ElementTaskOutcome::Completed { failure_end } => {
                        self.failure_end |= failure_end;
                        if self.boundary_cancelled.remove(&element_id) {
                            // completion raced an interrupting boundary timer:
                            // the boundary path already owns the token
                            self.emit(
                                &element_id,
                                EventPayload::TaskCancelled {
                                    error: Some("AlreadyCompleted".to_string()),
                                    partial_result: None,
                                },
                            );
                            return;
                        }
                        self.advance_from(&element_id, kind).await;
                    }
                    ElementTaskOutcome::Failed(err) => {
                        self.boundary_cancelled.remove(&element_id);
                        self.sched.shared.tokens_add(-1);
                        tracing::warn!(element = %element_id, error = %err, "element failed");
                        self.first_error.get_or_insert(err);
                    }
                    ElementTaskOutcome::Cancelled { by_instance } => {
                        if by_instance {
                            self.cancelled = true;
                            self.sched.shared.tokens_add(-1);
                            self.stop_monitors();
                        } else if self.boundary_cancelled.remove(&element_id) {
                            // token continues along the boundary path, already routed
                        } else {
                            // single-element cancel: the flow continues
                            self.advance_from(&element_id, kind).await;
                        }
                    }
                }
            }
            StepResult::Boundary {
                boundary_id,
                attached_to,
                cancel_activity,
            } => {
                let live = self
                    .sched
                    .shared
                    .state_of(&attached_to)
                    .is_some_and(ElementState::is_live);
                if !live {
                    return;
                }
                self.fire_boundary(&boundary_id, &attached_to, cancel_activity);
            }
            StepResult::JoinTimeout { join_id } => {
                self.handle_join_timeout(&join_id);
            }
        }
    }

    /// A boundary timer elapsed while its activity was still live.
    fn fire_boundary(&mut self, boundary_id: &str, attached_to: &str, cancel_activity: bool) {
        let Some(boundary) = self.scope.element(boundary_id).cloned() else {
            return;
        };
        self.emit(
            boundary_id,
            EventPayload::ElementActivated {
                name: boundary.display_name().to_string(),
                kind: ElementKind::BoundaryTimerEvent,
            },
        );
        self.sched
            .shared
            .set_state(boundary_id, ElementState::Completed);
        self.emit(boundary_id, EventPayload::ElementCompleted {});

        if cancel_activity {
            // the activity's token transfers to the boundary path
            self.boundary_cancelled.insert(attached_to.to_string());
            self.sched
                .shared
                .set_state(attached_to, ElementState::Cancelling);
            self.emit(
                attached_to,
                EventPayload::TaskCancelling {
                    reason: format!("boundary timer `{boundary_id}` fired"),
                },
            );
            if !self.sched.shared.cancel_element_token(attached_to) {
                tracing::warn!(element = attached_to, "boundary fired but no live executor token");
            }
        } else {
            // non-interrupting: an extra token flows down the boundary path
            self.sched.shared.tokens_add(1);
        }

        let targets: Vec<String> = self
            .scope
            .outgoing(boundary_id)
            .iter()
            .map(|c| c.to.clone())
            .collect();
        for target in targets {
            self.route(target, boundary_id.to_string());
        }
    }

    fn handle_join_timeout(&mut self, join_id: &str) {
        let Some(join_element) = self.scope.element(join_id).cloned() else {
            return;
        };
        let Some(state) = self.joins.get(join_id) else {
            return; // join released before the watchdog fired
        };
        let expected = self.expected_arrivals(&join_element);
        if state.arrived_from.len() >= expected {
            return;
        }

        let arrived = state.arrived_from.clone();
        let arrived_set: HashSet<&str> = arrived.iter().map(String::as_str).collect();
        let mut missing = Vec::new();
        for conn in self.scope.incoming(join_id) {
            if !arrived_set.contains(conn.from.as_str()) {
                let culprit = self.last_known_upstream(&conn.from);
                if !missing.contains(&culprit) {
                    missing.push(culprit);
                }
            }
        }

        tracing::warn!(join = join_id, ?arrived, ?missing, "parallel join deadlock detected");
        self.emit(
            join_id,
            EventPayload::Deadlock {
                join: join_id.to_string(),
                arrived: arrived.clone(),
                missing: missing.clone(),
            },
        );

        // stop progress on the stalled paths
        if let Some(state) = self.joins.remove(join_id) {
            self.sched
                .shared
                .tokens_add(-(state.arrived_from.len() as i64));
        }
        self.first_error.get_or_insert(EngineError::Deadlock {
            join: join_id.to_string(),
            arrived,
            missing,
        });
    }

    /// Reverse-walk the graph from a missing join input to the nearest
    /// element the scheduler has actually seen: the last known predecessor
    /// on that branch.
    fn last_known_upstream(&self, from: &str) -> String {
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        queue.push_back(from.to_string());
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            match self.sched.shared.state_of(&id) {
                Some(ElementState::Skipped) | None => {
                    for conn in self.scope.incoming(&id) {
                        queue.push_back(conn.from.clone());
                    }
                }
                Some(_) => return id,
            }
        }
        from.to_string()
    }

    /// Successor routing after an element finished.
    async fn advance_from(&mut self, element_id: &str, kind: ElementKind) {
        if kind == ElementKind::EndEvent {
            self.sched.shared.tokens_add(-1);
            if let Some(element) = self.scope.element(element_id) {
                if end_event_is_failure(element) {
                    self.failure_end = true;
                }
            }
            return;
        }

        if kind.is_gateway() {
            self.advance_from_gateway(element_id, kind).await;
            return;
        }

        let targets: Vec<(String, String)> = self
            .scope
            .outgoing(element_id)
            .iter()
            .map(|c| (c.id.clone(), c.to.clone()))
            .collect();
        if targets.is_empty() {
            // dead-end non-end element: the token simply retires
            self.sched.shared.tokens_add(-1);
            return;
        }
        if targets.len() > 1 {
            self.sched.shared.tokens_add(targets.len() as i64 - 1);
        }
        for (_, target) in targets {
            self.route(target, element_id.to_string());
        }
    }

    async fn advance_from_gateway(&mut self, element_id: &str, kind: ElementKind) {
        self.emit(element_id, EventPayload::GatewayEvaluating {});
        let outgoing = self.scope.outgoing(element_id);
        let decision = {
            let ctx = self.ctx.read().await;
            gateway::evaluate(kind, element_id, &outgoing, &ctx)
        };
        let decision = match decision {
            Ok(d) => d,
            Err(err) => {
                self.sched
                    .shared
                    .set_state(element_id, ElementState::Failed);
                self.emit(
                    element_id,
                    EventPayload::TaskError {
                        message: err.to_string(),
                        error_type: err.error_type().to_string(),
                        retryable: err.retryable(),
                    },
                );
                self.sched.shared.tokens_add(-1);
                self.first_error.get_or_insert(err);
                return;
            }
        };

        self.emit(
            element_id,
            EventPayload::GatewayPathTaken {
                taken: decision.taken_flow_ids(),
                not_taken: decision.not_taken_flow_ids(),
            },
        );

        if !decision.not_taken.is_empty() {
            self.mark_skipped_paths(&decision);
        }

        if decision.taken.len() > 1 {
            self.sched
                .shared
                .tokens_add(decision.taken.len() as i64 - 1);
        }
        for (_, target) in decision.taken {
            self.route(target, element_id.to_string());
        }
    }

    /// Elements reachable only through not-taken flows become `skipped`.
    fn mark_skipped_paths(&self, decision: &gateway::GatewayDecision) {
        let taken_targets: Vec<&str> = decision.taken.iter().map(|(_, t)| t.as_str()).collect();
        let not_taken_targets: Vec<&str> =
            decision.not_taken.iter().map(|(_, t)| t.as_str()).collect();
        let reach_taken = self.scope.reachable_from(taken_targets.iter().copied());
        let reach_not = self
            .scope
            .reachable_from(not_taken_targets.iter().copied());

        for id in reach_not.difference(&reach_taken) {
            if self.sched.shared.mark_skipped(id) {
                self.emit(id, EventPayload::ElementSkipped {});
            }
        }
    }

    /// Hand a token to a successor: joins accumulate arrivals, everything
    /// else activates immediately.
    fn route(&mut self, target_id: String, from_id: String) {
        let Some(target) = self.scope.element(&target_id).cloned() else {
            tracing::warn!(element = %target_id, "route to unknown element, dropping token");
            self.sched.shared.tokens_add(-1);
            return;
        };

        if !self.scope.is_join(&target) {
            self.spawn_element(&target_id);
            return;
        }

        let expected = self.expected_arrivals(&target);
        let state = self.joins.entry(target_id.clone()).or_default();
        state.arrived_from.push(from_id);

        if state.arrived_from.len() >= expected {
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
            let state = self
                .joins
                .remove(&target_id)
                .unwrap_or_default();
            // merge: n arriving tokens become one
            let merged = state.arrived_from.len().saturating_sub(1);
            if merged > 0 {
                self.sched.shared.tokens_add(-(merged as i64));
            }
            self.spawn_element(&target_id);
        } else if state.watchdog.is_none() {
            let deadline = self.sched.config.deadlock_timeout;
            let join_id = target_id.clone();
            let handle = self.tasks.spawn(async move {
                tokio::time::sleep(deadline).await;
                StepResult::JoinTimeout { join_id }
            });
            state.watchdog = Some(handle);
        }
    }

    /// Expected arrivals at a converging gateway. Parallel joins expect every
    /// incoming arc; inclusive joins expect only the arcs whose upstream
    /// branch can still deliver a token (skipped branches are excluded, and
    /// the count is re-derived at every arrival).
    fn expected_arrivals(&self, join: &Element) -> usize {
        let incoming = self.scope.incoming(&join.id);
        match join.kind {
            ElementKind::InclusiveGateway => incoming
                .iter()
                .filter(|c| self.sched.shared.state_of(&c.from) != Some(ElementState::Skipped))
                .count()
                .max(1),
            _ => incoming.len().max(1),
        }
    }

    fn abort_watchers(&mut self, element_id: &str) {
        if let Some(handles) = self.watchers.remove(element_id) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    /// Instance-level cancellation: nothing pending should keep the scope
    /// alive or fire later.
    fn stop_monitors(&mut self) {
        for (_, state) in self.joins.drain() {
            if let Some(watchdog) = state.watchdog {
                watchdog.abort();
            }
        }
        for (_, handles) in self.watchers.drain() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}
