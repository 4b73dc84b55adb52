//! Task executors: one strategy per element kind.
//!
//! Each executor runs a single element to completion, emitting progress
//! through the broadcaster as it goes. Executors obey the cooperative
//! cancellation contract: they check the token at every suspension point and
//! never hold shared locks while suspended. Gateways, sub-processes, call
//! activities and boundary events are scheduler concerns and have no
//! registry entry.

pub mod agentic;
pub mod receive;
pub mod script;
pub mod send;
pub mod service;
pub mod timer;
pub mod user;

use crate::broadcast::Broadcaster;
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::context::SharedContext;
use crate::correlation::CorrelationBus;
use crate::error::EngineResult;
use crate::events::{Event, EventPayload};
use crate::model::{Element, ElementKind};
use crate::scheduler::{ElementState, ElementStates};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How an executor finished.
#[derive(Debug)]
pub enum ExecOutcome {
    Completed,
    Cancelled {
        reason: String,
        partial: Option<Value>,
    },
}

/// Everything an executor needs to run one element.
pub struct ExecContext {
    pub instance_id: Uuid,
    pub element: Element,
    pub context: SharedContext,
    pub broadcaster: Arc<Broadcaster>,
    pub bus: Arc<CorrelationBus>,
    pub cancel: CancellationToken,
    pub config: Arc<EngineConfig>,
    pub services: Arc<Collaborators>,
    pub states: ElementStates,
}

impl ExecContext {
    pub fn emit(&self, payload: EventPayload) {
        self.broadcaster.emit(Event::new(
            self.instance_id,
            Some(self.element.id.clone()),
            payload,
        ));
    }

    /// Resolve `${…}` templates in a property value against the live context.
    pub async fn resolve(&self, input: &str) -> String {
        self.context.read().await.resolve_templates(input)
    }

    pub async fn resolve_prop(&self, key: &str) -> String {
        let raw = self.element.prop_str(key).unwrap_or_default();
        self.resolve(&raw).await
    }

    /// Mark this element as suspended (visible in status snapshots).
    pub fn set_waiting(&self) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states.insert(self.element.id.clone(), ElementState::Waiting);
    }

    /// Back to running after a suspension resolved.
    pub fn set_running(&self) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states.insert(self.element.id.clone(), ElementState::Running);
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome>;
}

/// Kind → strategy map consulted by the scheduler for every leaf element.
pub struct ExecutorRegistry {
    map: HashMap<ElementKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    /// The standard wiring for all leaf kinds.
    pub fn standard() -> Self {
        let mut map: HashMap<ElementKind, Arc<dyn TaskExecutor>> = HashMap::new();
        let instant = Arc::new(InstantExecutor);
        map.insert(ElementKind::StartEvent, instant.clone());
        map.insert(ElementKind::EndEvent, instant.clone());
        map.insert(ElementKind::IntermediateEvent, instant.clone());
        map.insert(ElementKind::Task, instant.clone());
        map.insert(ElementKind::ManualTask, instant);
        map.insert(ElementKind::ScriptTask, Arc::new(script::ScriptTaskExecutor));
        map.insert(
            ElementKind::ServiceTask,
            Arc::new(service::ServiceTaskExecutor),
        );
        map.insert(
            ElementKind::BusinessRuleTask,
            Arc::new(service::BusinessRuleTaskExecutor),
        );
        map.insert(ElementKind::SendTask, Arc::new(send::SendTaskExecutor));
        map.insert(
            ElementKind::ReceiveTask,
            Arc::new(receive::ReceiveTaskExecutor),
        );
        map.insert(ElementKind::UserTask, Arc::new(user::UserTaskExecutor));
        map.insert(
            ElementKind::AgenticTask,
            Arc::new(agentic::AgenticTaskExecutor),
        );
        map.insert(
            ElementKind::TimerIntermediateCatchEvent,
            Arc::new(timer::TimerEventExecutor),
        );
        Self { map }
    }

    pub fn get(&self, kind: ElementKind) -> Option<Arc<dyn TaskExecutor>> {
        self.map.get(&kind).cloned()
    }
}

/// Events and plain tasks complete the moment they are reached.
pub struct InstantExecutor;

#[async_trait]
impl TaskExecutor for InstantExecutor {
    async fn execute(&self, _exec: &ExecContext) -> EngineResult<ExecOutcome> {
        Ok(ExecOutcome::Completed)
    }
}
