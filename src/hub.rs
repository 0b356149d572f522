// Realtime fan-out broadcaster
// Per-group topics over tokio broadcast channels. Delivery is
// at-least-once and best-effort ordered; a lagging receiver drops old
// events and re-syncs through a fresh snapshot. Publishing never blocks
// and never fails the mutation: a topic with no subscribers is simply
// dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::protocol::ServerEvent;

/// Buffered events per topic before slow receivers start lagging.
const TOPIC_CAPACITY: usize = 64;

/// Per-group subscriber registry.
#[derive(Default)]
pub struct Hub {
    topics: Mutex<HashMap<String, broadcast::Sender<ServerEvent>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a group's event stream, creating the topic on first use.
    pub fn subscribe(&self, group_id: &str) -> broadcast::Receiver<ServerEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(group_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Fan an event out to every session subscribed to the group.
    /// Fire-and-forget: no subscribers, no delivery, no error.
    pub fn publish(&self, group_id: &str, event: ServerEvent) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = topics.get(group_id) {
            if sender.send(event).is_err() {
                // Last subscriber went away; drop the dead topic.
                topics.remove(group_id);
            }
        }
    }

    /// Fan a deployment-wide event (template changes) out to every topic.
    pub fn publish_all(&self, event: ServerEvent) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    /// Number of live subscribers in a group (connection bookkeeping only).
    pub fn subscriber_count(&self, group_id: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(group_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
