// Mutation codec & merge policy.
//
// Turns an application intent into a durable `QueuedMutation`. Document
// updates to the same `(path, method)` collapse into the existing entry:
// the body is overwritten in place while id, idempotency key, retry
// accounting and timestamps stay untouched. Without this, a user editing
// offline for five minutes would queue dozens of near-duplicate PUTs.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::events::{QueueEvent, QueueEvents};
use crate::mutation::{MutationIntent, QueueBackpressure, QueuedMutation};
use crate::store::QueueStore;

/// Default cap on queue depth before `enqueue` refuses new entries.
const DEFAULT_MAX_PENDING: i64 = 10_000;

/// The write side of the pipeline: owns the store and the event channel.
pub struct MutationQueue {
    store: QueueStore,
    events: QueueEvents,
    max_pending: i64,
    /// Guards FIFO order against wall-clock ties: `created_at` values
    /// handed out by this process are strictly increasing.
    last_created_at: Option<DateTime<Utc>>,
}

impl MutationQueue {
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            events: QueueEvents::new(),
            max_pending: DEFAULT_MAX_PENDING,
            last_created_at: None,
        }
    }

    pub fn with_max_pending(mut self, max_pending: i64) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn events(&self) -> &QueueEvents {
        &self.events
    }

    pub fn depth(&self) -> Result<i64> {
        self.store.count()
    }

    /// Queue an intent, applying the merge rule for document updates.
    ///
    /// Returns the resulting entry: either a fresh one or the existing
    /// merge target carrying the new body under its original id and
    /// idempotency key.
    pub fn enqueue(
        &mut self,
        intent: MutationIntent,
        now: DateTime<Utc>,
    ) -> Result<QueuedMutation> {
        if intent.operation_type.merges_by_target() {
            let prior =
                self.store.find_by_target(intent.operation_type, &intent.path, intent.method)?;

            if let Some(oldest) = prior.first() {
                // Pre-existing duplicates beyond the oldest are an
                // inconsistency; collapse them away.
                if prior.len() > 1 {
                    let extras: Vec<_> = prior[1..].iter().map(|e| e.id).collect();
                    self.store.delete_many(&extras)?;
                }

                let mut merged = oldest.clone();
                merged.body = intent.body;
                self.store.put(&merged)?;

                debug!(
                    id = %merged.id,
                    path = %merged.path,
                    collapsed = prior.len() - 1,
                    "merged document update into existing queue entry"
                );
                self.publish_depth()?;
                return Ok(merged);
            }
        }

        let depth = self.store.count()?;
        if self.store.is_durable() && depth >= self.max_pending {
            return Err(QueueBackpressure { pending_count: depth, cap: self.max_pending }.into());
        }

        let entry = QueuedMutation::from_intent(intent, self.next_created_at(now));
        self.store.put(&entry)?;

        debug!(
            id = %entry.id,
            operation = entry.operation_type.as_str(),
            path = %entry.path,
            "queued mutation"
        );
        self.publish_depth()?;
        Ok(entry)
    }

    /// Emit `Changed` with the current depth.
    pub fn publish_depth(&self) -> Result<i64> {
        let depth = self.store.count()?;
        self.events.publish(QueueEvent::Changed { depth });
        Ok(depth)
    }

    fn next_created_at(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = match self.last_created_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(candidate);
        candidate
    }
}
