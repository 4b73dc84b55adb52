use std::time::Duration;

/// Engine tunables, populated from the environment.
///
/// Every knob has a sane default so the engine runs with no configuration at
/// all; `from_env()` overrides from the recognized variables.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Base URL inlined into approval links (`PUBLIC_BASE_URL` / `NGROK_URL`).
    pub public_base_url: String,
    /// How long a parallel join may stall before the deadlock monitor flags it
    /// (`DEADLOCK_TIMEOUT_MS`).
    pub deadlock_timeout: Duration,
    /// Grace window for correlation messages that arrive before their waiter
    /// (`CORRELATION_BUFFER_TTL_S`).
    pub correlation_buffer_ttl: Duration,
    /// Per-observer outbound queue depth (`OBSERVER_QUEUE_SIZE`).
    pub observer_queue_size: usize,
    /// Agentic-task retry ceiling when the element declares none
    /// (`MAX_RETRIES_DEFAULT`).
    pub max_retries_default: u32,
    /// Agentic-task confidence threshold when the element declares none
    /// (`CONFIDENCE_DEFAULT`).
    pub confidence_default: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".to_string(),
            deadlock_timeout: Duration::from_millis(30_000),
            correlation_buffer_ttl: Duration::from_secs(300),
            observer_queue_size: 256,
            max_retries_default: 3,
            confidence_default: 0.7,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(base) = env_string("PUBLIC_BASE_URL").or_else(|| env_string("NGROK_URL")) {
            cfg.public_base_url = base;
        }
        if let Some(ms) = env_parse::<u64>("DEADLOCK_TIMEOUT_MS") {
            cfg.deadlock_timeout = Duration::from_millis(ms);
        }
        if let Some(s) = env_parse::<u64>("CORRELATION_BUFFER_TTL_S") {
            cfg.correlation_buffer_ttl = Duration::from_secs(s);
        }
        if let Some(n) = env_parse::<usize>("OBSERVER_QUEUE_SIZE") {
            cfg.observer_queue_size = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("MAX_RETRIES_DEFAULT") {
            cfg.max_retries_default = n.max(1);
        }
        if let Some(c) = env_parse::<f64>("CONFIDENCE_DEFAULT") {
            cfg.confidence_default = c;
        }
        cfg
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(%key, value = %raw, "ignoring unparseable configuration value");
                None
            }
        },
        Err(_) => None,
    }
}
