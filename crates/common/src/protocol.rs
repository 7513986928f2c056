// Wire-level contract between the client pipeline and the relay.

use serde::{Deserialize, Serialize};

/// Header carrying the idempotency key on every queued delivery.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Header naming the operation kind so the relay can scope its replay
/// records per `(actor, scope, operation, key)` tuple.
pub const OPERATION_KIND_HEADER: &str = "x-folio-operation";

/// Marker header set on responses served from the relay's replay store
/// instead of re-executing the underlying effect.
pub const IDEMPOTENCY_REPLAY_HEADER: &str = "idempotency-replay";

/// How the client classifies a completed HTTP delivery.
///
/// Network-level failures never reach this enum: they surface as transport
/// errors and stop the current replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx: the mutation was applied.
    Applied,
    /// 409: the mutation already landed during an earlier attempt whose
    /// success response was lost. Treated as success, never retried.
    AlreadyApplied,
    /// 401: the session expired. The whole replay pass must abort.
    AuthExpired,
    /// Any other status: retryable failure.
    Rejected,
}

impl DeliveryOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Applied,
            409 => Self::AlreadyApplied,
            401 => Self::AuthExpired,
            _ => Self::Rejected,
        }
    }

    /// Whether the entry should be removed from the queue.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Applied | Self::AlreadyApplied)
    }
}

/// The error envelope the relay responds with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range_is_applied() {
        assert_eq!(DeliveryOutcome::from_status(200), DeliveryOutcome::Applied);
        assert_eq!(DeliveryOutcome::from_status(201), DeliveryOutcome::Applied);
        assert_eq!(DeliveryOutcome::from_status(204), DeliveryOutcome::Applied);
    }

    #[test]
    fn conflict_is_already_applied() {
        assert_eq!(DeliveryOutcome::from_status(409), DeliveryOutcome::AlreadyApplied);
        assert!(DeliveryOutcome::AlreadyApplied.is_settled());
    }

    #[test]
    fn unauthorized_aborts() {
        assert_eq!(DeliveryOutcome::from_status(401), DeliveryOutcome::AuthExpired);
        assert!(!DeliveryOutcome::AuthExpired.is_settled());
    }

    #[test]
    fn everything_else_is_retryable() {
        for status in [400, 403, 404, 422, 429, 500, 502, 503] {
            assert_eq!(DeliveryOutcome::from_status(status), DeliveryOutcome::Rejected);
        }
    }
}
