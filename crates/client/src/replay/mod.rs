// Replay engine: the retry/backoff state machine driving delivery.
//
// On each pass, eligible pending entries are attempted oldest-first:
//   2xx / 409  → entry deleted, counted as processed
//   401        → the whole pass aborts, entries untouched
//   other HTTP → retry_count bumped; backoff scheduled or, at the
//                ceiling, the entry is retired to `failed`
//   network    → same retry accounting, then the pass stops (no point
//                hammering a downed network for the rest of the queue)
//
// Transport is abstracted via `MutationTransport` for testability; the
// reqwest implementation lives in a separate module.

pub mod http;

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use folio_common::protocol::DeliveryOutcome;
use folio_common::types::{HttpMethod, OperationKind};

use crate::events::{QueueEvent, QueueEvents};
use crate::mutation::{MutationIntent, MutationStatus, QueuedMutation, MAX_ATTEMPTS};
use crate::queue::MutationQueue;

// ── Backoff ─────────────────────────────────────────────────────────

const BASE_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = 60_000;

/// Exponential backoff after the given number of failed attempts:
/// `min(60s, 2^(retry_count-1) * 1s)`.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let exp = retry_count.saturating_sub(1).min(6); // cap exponent to avoid overflow
    let delay_ms = BASE_DELAY_MS.saturating_mul(1u64 << exp).min(MAX_DELAY_MS);
    Duration::from_millis(delay_ms)
}

// ── Transport ───────────────────────────────────────────────────────

/// One delivery attempt handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest<'a> {
    pub operation: OperationKind,
    pub method: HttpMethod,
    pub path: &'a str,
    pub body: &'a Value,
    pub idempotency_key: Uuid,
}

/// A completed HTTP exchange. Network-level failures never construct
/// this; they surface as transport errors instead.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub body: Option<Value>,
}

/// Abstraction over the HTTP delivery call.
pub trait MutationTransport {
    fn deliver(
        &mut self,
        request: DeliveryRequest<'_>,
    ) -> impl std::future::Future<Output = Result<DeliveryResponse>> + Send;
}

// ── Pass outcome ────────────────────────────────────────────────────

/// Ids settled or permanently retired during one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub processed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// How a submitted intent left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Durably queued; delivery happens on the next replay trigger.
    Queued(QueuedMutation),
    /// Delivered eagerly (or in degraded mode) without staying queued.
    Delivered { status: u16 },
}

// ── Engine ──────────────────────────────────────────────────────────

/// Drives delivery attempts over one actor/session's queue.
pub struct ReplayEngine<T: MutationTransport> {
    queue: MutationQueue,
    transport: T,
}

impl<T: MutationTransport> ReplayEngine<T> {
    pub fn new(queue: MutationQueue, transport: T) -> Self {
        Self { queue, transport }
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MutationQueue {
        &mut self.queue
    }

    pub fn events(&self) -> &QueueEvents {
        self.queue.events()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Queue-then-replay entry point (document saves). In degraded
    /// storage mode this collapses to a single synchronous attempt.
    pub async fn submit(
        &mut self,
        intent: MutationIntent,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        if !self.queue.store().is_durable() {
            return self.deliver_once(intent).await;
        }
        Ok(SubmitOutcome::Queued(self.queue.enqueue(intent, now)?))
    }

    /// Eager-send entry point (thread/comment actions): attempt delivery
    /// immediately, fall back to the queue on any failure. The queued
    /// fallback reuses the idempotency key of the eager attempt, so a
    /// lost success response cannot double-apply.
    pub async fn submit_eager(
        &mut self,
        intent: MutationIntent,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        if !self.queue.store().is_durable() {
            return self.deliver_once(intent).await;
        }

        let entry = self.queue.enqueue(intent, now)?;
        let attempt = self
            .transport
            .deliver(DeliveryRequest {
                operation: entry.operation_type,
                method: entry.method,
                path: &entry.path,
                body: &entry.body,
                idempotency_key: entry.idempotency_key,
            })
            .await;

        match attempt {
            Ok(response) if DeliveryOutcome::from_status(response.status).is_settled() => {
                self.queue.store().delete_many(&[entry.id])?;
                self.queue.publish_depth()?;
                Ok(SubmitOutcome::Delivered { status: response.status })
            }
            Ok(response) => {
                debug!(
                    id = %entry.id,
                    status = response.status,
                    "eager delivery rejected, mutation stays queued"
                );
                Ok(SubmitOutcome::Queued(entry))
            }
            Err(error) => {
                debug!(id = %entry.id, %error, "eager delivery failed, mutation stays queued");
                Ok(SubmitOutcome::Queued(entry))
            }
        }
    }

    /// Run one replay pass over all eligible entries.
    pub async fn replay(&mut self, now: DateTime<Utc>) -> Result<ReplaySummary> {
        let snapshot = self.queue.store().get_all()?;
        let eligible: Vec<Uuid> =
            snapshot.iter().filter(|e| e.is_eligible(now)).map(|e| e.id).collect();

        let mut summary = ReplaySummary::default();
        if eligible.is_empty() {
            self.events().publish(QueueEvent::Replayed {
                processed: Vec::new(),
                failed: Vec::new(),
            });
            return Ok(summary);
        }

        debug!(eligible = eligible.len(), "starting replay pass");

        for id in eligible {
            // Re-read at attempt time: a merge may have replaced the body
            // since the pass snapshot was taken.
            let Some(entry) = self.queue.store().get(id)? else {
                continue;
            };
            if !entry.is_eligible(now) {
                continue;
            }

            let attempt = self
                .transport
                .deliver(DeliveryRequest {
                    operation: entry.operation_type,
                    method: entry.method,
                    path: &entry.path,
                    body: &entry.body,
                    idempotency_key: entry.idempotency_key,
                })
                .await;

            match attempt {
                Ok(response) => match DeliveryOutcome::from_status(response.status) {
                    DeliveryOutcome::Applied | DeliveryOutcome::AlreadyApplied => {
                        self.queue.store().delete_many(&[entry.id])?;
                        self.queue.publish_depth()?;
                        summary.processed.push(entry.id);
                    }
                    DeliveryOutcome::AuthExpired => {
                        // Session expired: retrying further entries is
                        // pointless and could leak into the wrong session.
                        // No entry is charged a retry.
                        warn!("authentication expired, aborting replay pass");
                        break;
                    }
                    DeliveryOutcome::Rejected => {
                        self.record_failure(
                            entry.id,
                            format!("HTTP {}", response.status),
                            now,
                            &mut summary,
                        )?;
                    }
                },
                Err(error) => {
                    self.record_failure(entry.id, error.to_string(), now, &mut summary)?;
                    info!(%error, "network error, stopping replay pass");
                    break;
                }
            }
        }

        info!(
            processed = summary.processed.len(),
            failed = summary.failed.len(),
            "replay pass finished"
        );
        self.events().publish(QueueEvent::Replayed {
            processed: summary.processed.clone(),
            failed: summary.failed.clone(),
        });
        Ok(summary)
    }

    /// Charge one failed attempt against an entry: schedule the next
    /// retry with backoff, or retire the entry at the ceiling.
    fn record_failure(
        &mut self,
        id: Uuid,
        reason: String,
        now: DateTime<Utc>,
        summary: &mut ReplaySummary,
    ) -> Result<()> {
        // Re-read rather than patching a stale copy, so a body merged in
        // during the HTTP call is preserved.
        let Some(mut entry) = self.queue.store().get(id)? else {
            return Ok(());
        };

        entry.retry_count += 1;
        entry.last_error = Some(reason);

        if entry.retry_count >= MAX_ATTEMPTS {
            entry.status = MutationStatus::Failed;
            entry.next_retry_at = None;
            warn!(
                id = %entry.id,
                operation = entry.operation_type.as_str(),
                attempts = entry.retry_count,
                last_error = entry.last_error.as_deref().unwrap_or(""),
                "mutation permanently failed, needs user attention"
            );
            summary.failed.push(entry.id);
        } else {
            let delay = backoff_delay(entry.retry_count);
            entry.next_retry_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            debug!(
                id = %entry.id,
                retry_count = entry.retry_count,
                delay_ms = delay.as_millis() as u64,
                "delivery failed, retry scheduled"
            );
        }

        self.queue.store().put(&entry)
    }

    /// Degraded-storage path: one synchronous attempt, no retry.
    async fn deliver_once(&mut self, intent: MutationIntent) -> Result<SubmitOutcome> {
        let entry = QueuedMutation::from_intent(intent, Utc::now());
        let response = self
            .transport
            .deliver(DeliveryRequest {
                operation: entry.operation_type,
                method: entry.method,
                path: &entry.path,
                body: &entry.body,
                idempotency_key: entry.idempotency_key,
            })
            .await?;

        if DeliveryOutcome::from_status(response.status).is_settled() {
            Ok(SubmitOutcome::Delivered { status: response.status })
        } else {
            Err(anyhow!(
                "delivery failed with HTTP {} and no durable queue to retry from",
                response.status
            ))
        }
    }
}
