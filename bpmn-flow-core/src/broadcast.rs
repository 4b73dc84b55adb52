use crate::events::{
    ElementHistory, Event, EventPayload, MessageEntry, ThinkingEntry, ToolEntry,
};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A subscribed observer: its id plus the bounded event stream.
pub struct ObserverHandle {
    pub observer_id: Uuid,
    pub events: mpsc::Receiver<Event>,
}

struct Inner {
    observers: HashMap<Uuid, mpsc::Sender<Event>>,
    /// Retained activity per (instance, element) for replay.
    history: HashMap<(Uuid, String), ElementHistory>,
}

/// Fan-out hub between executors/scheduler and observers.
///
/// Every observer gets its own bounded outbound queue; a full queue drops
/// the observer rather than blocking the scheduler. The mutex is held only
/// for map access and `try_send`, never across an await.
pub struct Broadcaster {
    queue_size: usize,
    inner: Mutex<Inner>,
}

impl Broadcaster {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size: queue_size.max(1),
            inner: Mutex::new(Inner {
                observers: HashMap::new(),
                history: HashMap::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> ObserverHandle {
        let observer_id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(self.queue_size);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.observers.insert(observer_id, tx);
        tracing::debug!(observer = %observer_id, "observer attached");
        ObserverHandle {
            observer_id,
            events: rx,
        }
    }

    pub fn detach(&self, observer_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.observers.remove(&observer_id).is_some() {
            tracing::debug!(observer = %observer_id, "observer detached");
        }
    }

    pub fn observer_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.observers.len()
    }

    /// Record into history and fan out. Slow observers are disconnected
    /// here; the caller never blocks.
    pub fn emit(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        record(&mut inner.history, &event);

        let mut dropped = Vec::new();
        for (id, tx) in &inner.observers {
            if tx.try_send(event.clone()).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            inner.observers.remove(&id);
            tracing::warn!(observer = %id, "observer queue overflow, dropping observer");
        }
    }

    /// Deliver one event to a single observer (pong, snapshot). Returns false
    /// if the observer is gone or was dropped for overflow.
    pub fn send_to(&self, observer_id: Uuid, event: Event) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.observers.get(&observer_id) {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    inner.observers.remove(&observer_id);
                    tracing::warn!(observer = %observer_id, "observer queue overflow, dropping observer");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Compile the retained entries for an element and send a
    /// `messages.snapshot` to the requesting observer only.
    pub fn replay(&self, instance_id: Uuid, element_id: &str, observer_id: Uuid) -> bool {
        let entries = {
            let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner
                .history
                .get(&(instance_id, element_id.to_string()))
                .cloned()
                .unwrap_or_default()
        };
        self.send_to(
            observer_id,
            Event::new(
                instance_id,
                Some(element_id.to_string()),
                EventPayload::MessagesSnapshot { entries },
            ),
        )
    }

    /// Find the instance that retained history for an element, used when an
    /// observer replays by element id alone.
    pub fn instance_for_element(&self, element_id: &str) -> Option<Uuid> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .history
            .keys()
            .find(|(_, eid)| eid == element_id)
            .map(|(iid, _)| *iid)
    }

    /// Purge retained history for all elements of an instance. Active waiters
    /// are untouched; this affects replay only.
    pub fn clear_history(&self, instance_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.history.retain(|(iid, _), _| *iid != instance_id);
    }

    pub fn element_history(&self, instance_id: Uuid, element_id: &str) -> ElementHistory {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .history
            .get(&(instance_id, element_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

/// History recording rules. Sentence chunks are intentionally not recorded:
/// content deltas accumulate into whole messages, which is exactly the
/// collapsed form a snapshot carries.
fn record(history: &mut HashMap<(Uuid, String), ElementHistory>, event: &Event) {
    let Some(element_id) = event.element_id.as_ref() else {
        return;
    };
    let key = (event.instance_id, element_id.clone());

    match &event.payload {
        EventPayload::TaskThinking { message } => {
            history.entry(key).or_default().thinking.push(ThinkingEntry {
                timestamp: event.timestamp,
                message: message.clone(),
            });
        }
        EventPayload::TaskToolStart { name, args } => {
            history.entry(key).or_default().tools.push(ToolEntry {
                name: name.clone(),
                start_time: event.timestamp,
                end_time: None,
                args: args.clone(),
                result: None,
            });
        }
        EventPayload::TaskToolEnd { name, result } => {
            if let Some(entry) = history.entry(key).or_default().tools.iter_mut().rev().find(
                |t| t.name == *name && t.end_time.is_none(),
            ) {
                entry.end_time = Some(event.timestamp);
                entry.result = Some(result.clone());
            }
        }
        EventPayload::TextMessageStart { message_id, role } => {
            history.entry(key).or_default().messages.push(MessageEntry {
                id: message_id.clone(),
                role: role.clone(),
                content: String::new(),
                timestamp: event.timestamp,
                cancelled: false,
                cancellation_reason: None,
            });
        }
        EventPayload::TextMessageContent { message_id, delta } => {
            if let Some(entry) = history
                .entry(key)
                .or_default()
                .messages
                .iter_mut()
                .find(|m| m.id == *message_id)
            {
                entry.content.push_str(delta);
            }
        }
        EventPayload::TextMessageEnd {
            message_id,
            cancelled,
            cancellation_reason,
        } => {
            if let Some(entry) = history
                .entry(key)
                .or_default()
                .messages
                .iter_mut()
                .find(|m| m.id == *message_id)
            {
                entry.cancelled = *cancelled;
                entry.cancellation_reason = cancellation_reason.clone();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thinking(instance: Uuid, element: &str, message: &str) -> Event {
        Event::new(
            instance,
            Some(element.to_string()),
            EventPayload::TaskThinking {
                message: message.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn fan_out_reaches_all_observers() {
        let hub = Broadcaster::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        let instance = Uuid::now_v7();

        hub.emit(thinking(instance, "e1", "hello"));

        assert_eq!(a.events.recv().await.unwrap().event_type(), "task.thinking");
        assert_eq!(b.events.recv().await.unwrap().event_type(), "task.thinking");
    }

    /// A wedged observer is dropped instead of stalling emission.
    #[tokio::test]
    async fn overflowing_observer_is_dropped() {
        let hub = Broadcaster::new(2);
        let _stuck = hub.subscribe(); // never drained
        let mut live = hub.subscribe();
        let instance = Uuid::now_v7();

        for i in 0..5 {
            hub.emit(thinking(instance, "e1", &format!("m{i}")));
            // keep the live observer drained so only the stuck one overflows
            let _ = live.events.recv().await.unwrap();
        }

        assert_eq!(hub.observer_count(), 1);
    }

    #[tokio::test]
    async fn replay_reconstructs_history_with_original_timestamps() {
        let hub = Broadcaster::new(32);
        let instance = Uuid::now_v7();

        hub.emit(thinking(instance, "agent", "Initializing"));
        hub.emit(Event::new(
            instance,
            Some("agent".to_string()),
            EventPayload::TextMessageStart {
                message_id: "m1".to_string(),
                role: "assistant".to_string(),
            },
        ));
        for delta in ["Hello ", "world. ", "Bye."] {
            hub.emit(Event::new(
                instance,
                Some("agent".to_string()),
                EventPayload::TextMessageContent {
                    message_id: "m1".to_string(),
                    delta: delta.to_string(),
                },
            ));
        }
        hub.emit(Event::new(
            instance,
            Some("agent".to_string()),
            EventPayload::TaskToolStart {
                name: "search".to_string(),
                args: json!({"q": "x"}),
            },
        ));
        hub.emit(Event::new(
            instance,
            Some("agent".to_string()),
            EventPayload::TaskToolEnd {
                name: "search".to_string(),
                result: json!({"hits": 2}),
            },
        ));

        let recorded = hub.element_history(instance, "agent");
        let message_started_at = recorded.messages[0].timestamp;

        // late observer asks for replay
        let mut late = hub.subscribe();
        assert!(hub.replay(instance, "agent", late.observer_id));
        let snapshot = late.events.recv().await.unwrap();
        match snapshot.payload {
            EventPayload::MessagesSnapshot { entries } => {
                assert_eq!(entries.thinking.len(), 1);
                assert_eq!(entries.messages.len(), 1);
                assert_eq!(entries.messages[0].content, "Hello world. Bye.");
                assert_eq!(entries.messages[0].timestamp, message_started_at);
                assert_eq!(entries.tools.len(), 1);
                assert!(entries.tools[0].end_time.is_some());
                assert_eq!(entries.tools[0].result, Some(json!({"hits": 2})));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_history_purges_instance_entries() {
        let hub = Broadcaster::new(8);
        let instance = Uuid::now_v7();
        let other = Uuid::now_v7();
        hub.emit(thinking(instance, "e1", "a"));
        hub.emit(thinking(other, "e1", "b"));

        hub.clear_history(instance);

        assert!(hub.element_history(instance, "e1").is_empty());
        assert!(!hub.element_history(other, "e1").is_empty());
    }

    #[tokio::test]
    async fn snapshot_goes_only_to_requester() {
        let hub = Broadcaster::new(8);
        let instance = Uuid::now_v7();
        hub.emit(thinking(instance, "e1", "a"));

        let mut requester = hub.subscribe();
        let mut bystander = hub.subscribe();
        hub.replay(instance, "e1", requester.observer_id);

        assert_eq!(
            requester.events.recv().await.unwrap().event_type(),
            "messages.snapshot"
        );
        assert!(bystander.events.try_recv().is_err());
    }
}
