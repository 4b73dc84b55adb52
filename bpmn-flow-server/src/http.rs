use crate::ws;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bpmn_flow_core::context::JsonMap;
use bpmn_flow_core::{Engine, EngineError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/workflows/execute", post(execute_workflow))
        .route("/workflows/:id/status", get(workflow_status))
        .route("/workflows/:id/cancel", post(cancel_workflow))
        .route(
            "/webhooks/approve/:message_ref/:correlation_key",
            get(webhook_approve),
        )
        .route(
            "/webhooks/deny/:message_ref/:correlation_key",
            get(webhook_deny),
        )
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

/// Engine errors mapped onto HTTP statuses.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::MalformedDefinition(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.to_string(),
            "type": self.0.error_type(),
        }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Inline YAML definition.
    #[serde(default)]
    pub definition: Option<String>,
    /// Or a definition file on disk.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub context: JsonMap,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub instance_id: Uuid,
}

async fn execute_workflow(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let yaml = match (request.definition, request.path) {
        (Some(inline), _) => inline,
        (None, Some(path)) => tokio::fs::read_to_string(&path).await.map_err(|e| {
            EngineError::MalformedDefinition(format!("cannot read `{path}`: {e}"))
        })?,
        (None, None) => {
            return Err(EngineError::MalformedDefinition(
                "request carries neither `definition` nor `path`".to_string(),
            )
            .into())
        }
    };
    let instance_id = state.engine.start_yaml(&yaml, request.context)?;
    Ok(Json(ExecuteResponse { instance_id }))
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let status = state.engine.status(id).await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "cancelled via API".to_string());
    state.engine.cancel_instance(id, &reason)?;
    Ok(Json(json!({"cancelled": true})))
}

async fn webhook_approve(
    State(state): State<AppState>,
    Path((message_ref, correlation_key)): Path<(String, String)>,
) -> Html<String> {
    webhook_decision(&state, &message_ref, &correlation_key, "approved")
}

async fn webhook_deny(
    State(state): State<AppState>,
    Path((message_ref, correlation_key)): Path<(String, String)>,
) -> Html<String> {
    webhook_decision(&state, &message_ref, &correlation_key, "denied")
}

/// Publish the browser-click decision to the correlation bus and answer the
/// caller with a terminal page. Unknown keys are buffered by the bus, never
/// an error. Path segments are attacker-controlled and must be entity-escaped
/// before they reach the page.
fn webhook_decision(
    state: &AppState,
    message_ref: &str,
    correlation_key: &str,
    decision: &str,
) -> Html<String> {
    let payload = match json!({
        "decision": decision,
        "method": "email",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!("literal object"),
    };
    state
        .engine
        .publish_message(message_ref, correlation_key, payload);
    tracing::info!(%message_ref, %correlation_key, %decision, "webhook decision received");

    let message_ref = escape_html(message_ref);
    let correlation_key = escape_html(correlation_key);
    Html(format!(
        "<html><body><h1>Decision recorded</h1>\
         <p>Your <strong>{decision}</strong> decision for <code>{message_ref}</code> \
         (key <code>{correlation_key}</code>) has been delivered to the workflow.</p>\
         </body></html>"
    ))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

