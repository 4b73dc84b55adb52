use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};

pub type JsonMap = serde_json::Map<String, Value>;

/// Handle to an instance's context, shared between the scheduler and the
/// executors running under it. Writers hold the lock only for the duration
/// of the mutation, never across a suspension point.
pub type SharedContext = Arc<tokio::sync::RwLock<Context>>;

pub fn shared(context: Context) -> SharedContext {
    Arc::new(tokio::sync::RwLock::new(context))
}

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("template pattern"))
}

/// Per-instance mutable key/value store.
///
/// Reads support dotted paths (`a.b.c`) and are total: any missing segment
/// resolves to the empty string. Writes are flat assignments at the top
/// level; correlation payloads merge shallowly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Context {
    values: JsonMap,
}

impl Context {
    pub fn new(initial: JsonMap) -> Self {
        Self { values: initial }
    }

    /// Dotted-path read. `None` only when a segment is missing; callers that
    /// need a total read use `get_display`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current: &Value = self.values.get(path.split('.').next()?)?;
        for segment in path.split('.').skip(1) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Total read: missing paths render as the empty string.
    pub fn get_display(&self, path: &str) -> String {
        self.get(path).map(value_display).unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Shallow merge of an inbound payload (webhook body, user-task
    /// submission) into the top level.
    pub fn merge(&mut self, payload: &JsonMap) {
        for (k, v) in payload {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Replace every `${path}` occurrence with the display form of the
    /// context value at `path`.
    pub fn resolve_templates(&self, input: &str) -> String {
        template_re()
            .replace_all(input, |caps: &regex::Captures<'_>| {
                self.get_display(caps[1].trim())
            })
            .into_owned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> JsonMap {
        self.values.clone()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// Render a JSON value the way it appears inside templates: strings bare,
/// null empty, composites as compact JSON.
pub fn value_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
