use thiserror::Error;

/// The engine-wide error taxonomy.
///
/// Every failure that can surface to an observer (`task.error`) or to a
/// caller of the engine façade is one of these variants. Cancellation is the
/// only expected-not-an-error member; everything else fails the element or
/// the instance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed definition: {0}")]
    MalformedDefinition(String),

    #[error("no matching outgoing path at gateway `{gateway}`")]
    NoMatchingPath { gateway: String },

    #[error("condition `{condition}` failed to evaluate: {reason}")]
    ConditionEvaluation { condition: String, reason: String },

    #[error("receive `{message_ref}` timed out after {waited_ms} ms")]
    ReceiveTimeout { message_ref: String, waited_ms: u64 },

    #[error("confidence {confidence} below threshold {threshold} after {attempts} attempt(s)")]
    LowConfidence {
        confidence: f64,
        threshold: f64,
        attempts: u32,
    },

    #[error("a waiter is already registered for ({message_ref}, {correlation_key})")]
    DuplicateWaiter {
        message_ref: String,
        correlation_key: String,
    },

    #[error("executor failed: {0}")]
    Executor(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("parallel join `{join}` deadlocked: arrived {arrived:?}, missing {missing:?}")]
    Deadlock {
        join: String,
        arrived: Vec<String>,
        missing: Vec<String>,
    },

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Short machine-readable discriminator carried on `task.error` events.
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::MalformedDefinition(_) => "MalformedDefinition",
            EngineError::NoMatchingPath { .. } => "NoMatchingPath",
            EngineError::ConditionEvaluation { .. } => "ConditionEvaluationError",
            EngineError::ReceiveTimeout { .. } => "ReceiveTimeout",
            EngineError::LowConfidence { .. } => "LowConfidence",
            EngineError::DuplicateWaiter { .. } => "DuplicateWaiter",
            EngineError::Executor(_) => "ExecutorException",
            EngineError::Cancelled(_) => "Cancelled",
            EngineError::Deadlock { .. } => "Deadlock",
            EngineError::NotFound(_) => "NotFound",
        }
    }

    /// Whether a retry of the same element could plausibly succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ReceiveTimeout { .. } | EngineError::Executor(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
