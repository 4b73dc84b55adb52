use crate::context::JsonMap;
use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Key = (String, String);

#[derive(Debug)]
struct Registered {
    token: u64,
    tx: oneshot::Sender<JsonMap>,
}

#[derive(Debug)]
struct Buffered {
    payload: JsonMap,
    expires_at: Instant,
}

#[derive(Debug)]
struct BusInner {
    next_token: u64,
    waiters: HashMap<Key, Registered>,
    buffered: HashMap<Key, Buffered>,
}

/// Process-wide rendezvous between external messages and suspended
/// executors, keyed by `(messageRef, correlationKey)`.
///
/// At most one waiter per key; delivery is exactly once. Messages published
/// before their waiter registers are buffered for a grace window and
/// delivered to a slightly-late `wait`; after the window they are discarded
/// and logged. The registry mutex is never held across an await.
pub struct CorrelationBus {
    buffer_ttl: Duration,
    inner: Arc<Mutex<BusInner>>,
}

impl CorrelationBus {
    pub fn new(buffer_ttl: Duration) -> Self {
        Self {
            buffer_ttl,
            inner: Arc::new(Mutex::new(BusInner {
                next_token: 0,
                waiters: HashMap::new(),
                buffered: HashMap::new(),
            })),
        }
    }

    /// Register a waiter for `(message_ref, correlation_key)`.
    ///
    /// If a message already sits in the grace buffer it is consumed
    /// immediately. A second concurrent registration for the same key fails
    /// with `DuplicateWaiter`. Dropping the returned `Waiter` (cancellation,
    /// timeout) deregisters atomically.
    pub fn wait(
        &self,
        message_ref: impl Into<String>,
        correlation_key: impl Into<String>,
    ) -> EngineResult<Waiter> {
        let key = (message_ref.into(), correlation_key.into());
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        purge_expired(&mut inner);

        if let Some(buffered) = inner.buffered.remove(&key) {
            tracing::debug!(message_ref = %key.0, correlation_key = %key.1,
                "late waiter consumed buffered message");
            return Ok(Waiter {
                key,
                token: 0,
                registry: Arc::clone(&self.inner),
                state: WaiterState::Ready(buffered.payload),
            });
        }

        if inner.waiters.contains_key(&key) {
            return Err(EngineError::DuplicateWaiter {
                message_ref: key.0,
                correlation_key: key.1,
            });
        }

        inner.next_token += 1;
        let token = inner.next_token;
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(key.clone(), Registered { token, tx });
        tracing::debug!(message_ref = %key.0, correlation_key = %key.1, "waiter registered");
        Ok(Waiter {
            key,
            token,
            registry: Arc::clone(&self.inner),
            state: WaiterState::Pending(rx),
        })
    }

    /// Deliver a message to the waiter for its key, or buffer it for the
    /// grace window if nobody is waiting yet. Never an error for the caller.
    pub fn publish(
        &self,
        message_ref: impl Into<String>,
        correlation_key: impl Into<String>,
        payload: JsonMap,
    ) {
        let key = (message_ref.into(), correlation_key.into());
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        purge_expired(&mut inner);

        if let Some(registered) = inner.waiters.remove(&key) {
            match registered.tx.send(payload) {
                Ok(()) => {
                    tracing::debug!(message_ref = %key.0, correlation_key = %key.1, "message delivered");
                    return;
                }
                Err(payload) => {
                    // receiver raced away (timeout/cancel); fall through to buffer
                    inner.buffered.insert(
                        key.clone(),
                        Buffered {
                            payload,
                            expires_at: Instant::now() + self.buffer_ttl,
                        },
                    );
                    tracing::debug!(message_ref = %key.0, correlation_key = %key.1,
                        "waiter vanished mid-delivery, message buffered");
                    return;
                }
            }
        }

        inner.buffered.insert(
            key.clone(),
            Buffered {
                payload,
                expires_at: Instant::now() + self.buffer_ttl,
            },
        );
        tracing::debug!(message_ref = %key.0, correlation_key = %key.1,
            "no waiter yet, message buffered");
    }

    pub fn pending_waiters(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.waiters.len()
    }
}

fn remove_if_token(registry: &Mutex<BusInner>, key: &Key, token: u64) {
    let mut inner = registry.lock().unwrap_or_else(|p| p.into_inner());
    if inner.waiters.get(key).map(|r| r.token) == Some(token) {
        inner.waiters.remove(key);
        tracing::debug!(message_ref = %key.0, correlation_key = %key.1, "waiter deregistered");
    }
}

fn purge_expired(inner: &mut BusInner) {
    let now = Instant::now();
    inner.buffered.retain(|key, buffered| {
        let keep = buffered.expires_at > now;
        if !keep {
            tracing::warn!(message_ref = %key.0, correlation_key = %key.1,
                "discarding expired correlation message");
        }
        keep
    });
}

#[derive(Debug)]
enum WaiterState {
    Ready(JsonMap),
    Pending(oneshot::Receiver<JsonMap>),
    Done,
}

/// A registered correlation waiter. Dropping it deregisters the entry (the
/// token guards against removing a successor registration for the same key).
#[derive(Debug)]
pub struct Waiter {
    key: Key,
    token: u64,
    registry: Arc<Mutex<BusInner>>,
    state: WaiterState,
}

impl Waiter {
    pub fn message_ref(&self) -> &str {
        &self.key.0
    }

    /// Await delivery, with an optional absolute timeout. On timeout the
    /// registry entry is removed (via drop) and `ReceiveTimeout` is returned.
    pub async fn recv(mut self, timeout: Option<Duration>) -> EngineResult<JsonMap> {
        let state = std::mem::replace(&mut self.state, WaiterState::Done);
        match state {
            WaiterState::Ready(payload) => Ok(payload),
            WaiterState::Pending(rx) => match timeout {
                Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                    Ok(Ok(payload)) => Ok(payload),
                    Ok(Err(_)) => Err(EngineError::Executor(
                        "correlation channel closed".to_string(),
                    )),
                    Err(_) => Err(EngineError::ReceiveTimeout {
                        message_ref: self.key.0.clone(),
                        waited_ms: deadline.as_millis() as u64,
                    }),
                },
                None => rx
                    .await
                    .map_err(|_| EngineError::Executor("correlation channel closed".to_string())),
            },
            WaiterState::Done => Err(EngineError::Executor(
                "correlation waiter consumed twice".to_string(),
            )),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.token != 0 {
            remove_if_token(&self.registry, &self.key, self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(decision: &str) -> JsonMap {
        match json!({"decision": decision}) {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_the_matching_waiter_exactly_once() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(300)));
        let waiter = bus.wait("approval", "case-1").unwrap();
        let other = bus.wait("approval", "case-2").unwrap();

        bus.publish("approval", "case-1", payload("approved"));

        let got = waiter.recv(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(got["decision"], "approved");

        // the other key never sees it
        let miss = other.recv(Some(Duration::from_millis(50))).await;
        assert!(matches!(miss, Err(EngineError::ReceiveTimeout { .. })));
    }

    #[tokio::test]
    async fn second_waiter_for_same_key_fails() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(300)));
        let _first = bus.wait("msg", "k").unwrap();
        let err = bus.wait("msg", "k").unwrap_err();
        assert!(matches!(err, EngineError::DuplicateWaiter { .. }));
    }

    #[tokio::test]
    async fn early_publish_is_buffered_for_late_waiter() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(300)));
        bus.publish("webhook", "order-9", payload("approved"));

        let waiter = bus.wait("webhook", "order-9").unwrap();
        let got = waiter.recv(Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(got["decision"], "approved");
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_messages_expire_after_ttl() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(300)));
        bus.publish("webhook", "stale", payload("approved"));

        tokio::time::advance(Duration::from_secs(301)).await;

        let waiter = bus.wait("webhook", "stale").unwrap();
        let miss = waiter.recv(Some(Duration::from_millis(10))).await;
        assert!(matches!(miss, Err(EngineError::ReceiveTimeout { .. })));
    }

    #[tokio::test]
    async fn timeout_removes_registration() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(300)));
        let waiter = bus.wait("msg", "k").unwrap();
        let miss = waiter.recv(Some(Duration::from_millis(10))).await;
        assert!(matches!(miss, Err(EngineError::ReceiveTimeout { .. })));
        assert_eq!(bus.pending_waiters(), 0);

        // a fresh registration for the same key is accepted again
        let _second = bus.wait("msg", "k").unwrap();
    }

    #[tokio::test]
    async fn dropping_a_waiter_deregisters_it() {
        let bus = Arc::new(CorrelationBus::new(Duration::from_secs(300)));
        {
            let _waiter = bus.wait("msg", "k").unwrap();
            assert_eq!(bus.pending_waiters(), 1);
        }
        assert_eq!(bus.pending_waiters(), 0);
    }
}
