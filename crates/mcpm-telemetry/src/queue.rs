use std::collections::VecDeque;
use std::sync::Mutex;

use mcpm_core::{Event, EventType};
use tokio::sync::Notify;
use tracing::warn;

/// A bounded, never-blocking event queue sitting between request handlers
/// and the telemetry writer task.
///
/// Request handling must never stall on telemetry, so
/// `push` never awaits. When the queue is full, the oldest event that is
/// *not* a `SESSION_START`/`SESSION_END` is evicted to make room; if the
/// queue is saturated entirely with session boundary events, the new event
/// is still accepted (those are never dropped; bounding memory usage is
/// secondary to having a paired start/end for every session).
pub struct EventQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, event: Event) {
        let mut queue = self.inner.lock().expect("event queue mutex poisoned");
        if queue.len() >= self.capacity {
            let evict_at = queue.iter().position(|e| {
                !matches!(e.event_type, EventType::SessionStart | EventType::SessionEnd)
            });
            match evict_at {
                Some(idx) => {
                    queue.remove(idx);
                }
                None => {
                    warn!(
                        queue_len = queue.len(),
                        "telemetry queue saturated with session boundary events, growing past capacity"
                    );
                }
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    /// Waits until at least one event is queued, then drains everything
    /// currently present.
    pub async fn drain_wait(&self) -> Vec<Event> {
        loop {
            {
                let mut queue = self.inner.lock().expect("event queue mutex poisoned");
                if !queue.is_empty() {
                    return queue.drain(..).collect();
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking drain, used during shutdown.
    pub fn drain_now(&self) -> Vec<Event> {
        let mut queue = self.inner.lock().expect("event queue mutex poisoned");
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(ty: EventType, id: &str) -> Event {
        Event {
            id: None,
            session_id: id.to_string(),
            event_type: ty,
            server_name: "srv".to_string(),
            resource_id: "res".to_string(),
            timestamp: Utc::now(),
            duration_ms: None,
            success: true,
            error_message: None,
            metadata: json!({}),
        }
    }

    #[test]
    fn evicts_oldest_non_session_event_when_full() {
        let queue = EventQueue::new(2);
        queue.push(event(EventType::ToolInvocation, "a"));
        queue.push(event(EventType::ToolInvocation, "b"));
        queue.push(event(EventType::ToolInvocation, "c"));
        let drained = queue.drain_now();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].session_id, "b");
        assert_eq!(drained[1].session_id, "c");
    }

    #[test]
    fn never_drops_session_boundary_events() {
        let queue = EventQueue::new(2);
        queue.push(event(EventType::SessionStart, "a"));
        queue.push(event(EventType::SessionStart, "b"));
        queue.push(event(EventType::SessionEnd, "c"));
        let drained = queue.drain_now();
        assert_eq!(drained.len(), 3);
    }
}
