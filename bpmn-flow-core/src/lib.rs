//! BPMN-Flow core: a BPMN 2.0 workflow execution engine.
//!
//! Process definitions load from YAML into an immutable graph that the
//! scheduler interprets directly: sequence flows, exclusive/inclusive/
//! parallel gateways with fork/join token accounting, sub-processes, call
//! activities, and boundary timers. Task executors may suspend indefinitely
//! (user approval, message correlation, agent streaming) and are
//! cooperatively cancellable. Lifecycle and streaming events fan out to
//! bounded observer queues with per-element history for replay.

pub mod broadcast;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod events;
pub mod executors;
pub mod expr;
pub mod gateway;
pub mod model;
pub mod scheduler;

pub use config::EngineConfig;
pub use engine::{Engine, ObserverMessage};
pub use error::{EngineError, EngineResult};
pub use model::ProcessDefinition;
