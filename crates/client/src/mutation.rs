// Queued mutation records and their lifecycle states.
//
// Entries flow through a state machine:
//   pending → (delivered | already applied)   deleted from the queue
//   pending → pending                         retry scheduled with backoff
//   pending → failed                          after MAX_ATTEMPTS failures
//
// `failed` entries stay in the store for user-visible "needs attention"
// state but are never retried automatically.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use folio_common::types::{HttpMethod, OperationKind};

/// Delivery attempts before an entry is permanently retired.
pub const MAX_ATTEMPTS: u32 = 5;

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Eligible for delivery once `next_retry_at` has passed.
    Pending,
    /// Permanently given up; requires explicit user action.
    Failed,
}

impl MutationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An application-level write before it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationIntent {
    pub operation_type: OperationKind,
    pub path: String,
    pub method: HttpMethod,
    pub body: Value,
}

impl MutationIntent {
    pub fn new(
        operation_type: OperationKind,
        path: impl Into<String>,
        method: HttpMethod,
        body: Value,
    ) -> Self {
        Self { operation_type, path: path.into(), method, body }
    }
}

/// A pending, not-yet-confirmed write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
    /// Stable for the lifetime of the entry; the merge key.
    pub id: Uuid,
    pub operation_type: OperationKind,
    pub path: String,
    pub method: HttpMethod,
    /// Full desired-state diff or create-args for the operation.
    pub body: Value,
    /// Generated once per logical mutation, never per delivery attempt.
    /// Survives merges and retries unchanged.
    pub idempotency_key: Uuid,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: MutationStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueuedMutation {
    /// Build a fresh entry from an intent, minting its id and
    /// idempotency key.
    pub fn from_intent(intent: MutationIntent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_type: intent.operation_type,
            path: intent.path,
            method: intent.method,
            body: intent.body,
            idempotency_key: Uuid::new_v4(),
            created_at,
            retry_count: 0,
            status: MutationStatus::Pending,
            next_retry_at: None,
            last_error: None,
        }
    }

    /// Whether this entry may be attempted at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == MutationStatus::Pending
            && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Typed error for queue-depth backpressure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("QUEUE_BACKPRESSURE: {pending_count} pending mutations exceeds cap of {cap}")]
pub struct QueueBackpressure {
    pub pending_count: i64,
    pub cap: i64,
}
