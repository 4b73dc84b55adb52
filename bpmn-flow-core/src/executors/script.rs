//! Sandboxed script task.
//!
//! Scripts run inside an operation-bounded rhai engine. They see the
//! instance context as a read/write `context` map plus a curated set of
//! builtins (random numbers, date/time). Top-level keys the script touched
//! are written back, and the script's return value lands in
//! `resultVariable` (or `result` when none is declared).

use super::{ExecContext, ExecOutcome, TaskExecutor};
use crate::context::JsonMap;
use crate::error::{EngineError, EngineResult};
use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

pub struct ScriptTaskExecutor;

#[async_trait]
impl TaskExecutor for ScriptTaskExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let script = exec.element.prop_str("script").unwrap_or_default();
        if script.trim().is_empty() {
            return Ok(ExecOutcome::Completed);
        }
        if let Some(format) = exec.element.prop_str("scriptFormat") {
            tracing::debug!(element = %exec.element.id, script_format = %format, "running script task");
        }

        let snapshot = exec.context.read().await.snapshot();
        let (updated, result) = run_script(&script, snapshot).map_err(|e| {
            EngineError::Executor(format!("script task `{}`: {e}", exec.element.id))
        })?;

        let mut ctx = exec.context.write().await;
        for (key, value) in updated {
            ctx.set(key, value);
        }
        if !result.is_null() {
            let result_var = exec
                .element
                .prop_str("resultVariable")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "result".to_string());
            ctx.set(result_var, result);
        }
        Ok(ExecOutcome::Completed)
    }
}

/// Synchronous sandbox run; all rhai state stays inside this call so nothing
/// non-Send crosses a suspension point.
fn run_script(script: &str, context: JsonMap) -> anyhow::Result<(JsonMap, Value)> {
    let mut engine = rhai::Engine::new();
    engine.set_max_operations(500_000);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(32);
    engine.set_max_string_size(1 << 20);
    engine.set_max_array_size(65_536);
    engine.set_max_map_size(65_536);

    engine.register_fn("random", || rand::thread_rng().gen::<f64>());
    engine.register_fn("random_int", |lo: i64, hi: i64| {
        if lo >= hi {
            lo
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        }
    });
    engine.register_fn("now_iso", || chrono::Utc::now().to_rfc3339());
    engine.register_fn("now_epoch_ms", || chrono::Utc::now().timestamp_millis());
    engine.register_fn("today", || {
        chrono::Utc::now().format("%Y-%m-%d").to_string()
    });

    let ctx_dynamic =
        rhai::serde::to_dynamic(Value::Object(context)).map_err(|e| anyhow!("{e}"))?;
    let mut scope = rhai::Scope::new();
    scope.push("context", ctx_dynamic);

    let returned = engine
        .eval_with_scope::<rhai::Dynamic>(&mut scope, script)
        .map_err(|e| anyhow!("{e}"))?;

    let ctx_back: rhai::Dynamic = scope
        .get("context")
        .cloned()
        .ok_or_else(|| anyhow!("script removed the `context` variable"))?;
    let ctx_value: Value = rhai::serde::from_dynamic(&ctx_back).map_err(|e| anyhow!("{e}"))?;
    let updated = match ctx_value {
        Value::Object(map) => map,
        other => {
            return Err(anyhow!(
                "script replaced `context` with a non-map value: {other}"
            ))
        }
    };

    let result_value = if returned.is_unit() {
        Value::Null
    } else {
        rhai::serde::from_dynamic(&returned).unwrap_or(Value::Null)
    };
    Ok((updated, result_value))
}
