// Queue lifecycle events for the UI reconciliation layer.
//
// Published on an explicit broadcast channel rather than a global bus:
// subscribers hold a receiver and drop it to unsubscribe. The UI derives
// per-entity sync markers (queued / synced / failed) from these.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered events per subscriber before lagging receivers drop events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Queue depth changed (enqueue, merge, delete, retirement).
    Changed { depth: i64 },
    /// A replay pass finished; ids settled or permanently retired this pass.
    Replayed { processed: Vec<Uuid>, failed: Vec<Uuid> },
}

/// Publisher handle for queue events.
#[derive(Debug, Clone)]
pub struct QueueEvents {
    tx: broadcast::Sender<QueueEvent>,
}

impl QueueEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Best-effort publish; a send with no live subscribers is not an error.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new()
    }
}
