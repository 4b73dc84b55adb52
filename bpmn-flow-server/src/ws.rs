//! WebSocket observer sessions.
//!
//! Each connection subscribes to the engine's broadcaster and pumps events
//! out as JSON text frames while dispatching inbound protocol messages
//! (`ping`, `userTask.complete`, `task.cancel.request`, `replay.request`,
//! `clear.history`). If the broadcaster drops the observer for back-pressure
//! the event stream ends and the socket closes.

use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bpmn_flow_core::{Engine, ObserverMessage};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| observer_session(state.engine, socket))
}

async fn observer_session(engine: Arc<Engine>, socket: WebSocket) {
    let mut handle = engine.subscribe();
    let observer_id = handle.observer_id;
    tracing::info!(observer = %observer_id, "observer connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = handle.events.recv() => match outbound {
                Some(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::warn!(%err, "unserializable event, skipping");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // dropped by the broadcaster (queue overflow) or engine gone
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ObserverMessage>(&text) {
                        Ok(message) => engine.handle_observer_message(observer_id, message),
                        Err(err) => {
                            tracing::debug!(observer = %observer_id, %err,
                                "ignoring malformed observer message");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong frames are not protocol messages
                Some(Err(err)) => {
                    tracing::debug!(observer = %observer_id, %err, "observer socket error");
                    break;
                }
            },
        }
    }

    engine.detach(observer_id);
    tracing::info!(observer = %observer_id, "observer disconnected");
}
