// Idempotent replay store and enforcement middleware.
//
// Maps (actor, scope, operation, idempotency key) to the first computed
// response for that logical mutation. A re-delivery with the same tuple
// gets the stored response verbatim, without re-executing the side effect
// (no second notification, no double-incremented counter). A re-delivery
// whose body hash differs is a protocol violation and gets 409.
//
// Only committed outcomes (2xx) are recorded: a handler failure leaves no
// side effect behind, so the retry must reach the handler again rather
// than replay the failure from cache.

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{HeaderValue, Method, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use folio_common::protocol::{
    IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_REPLAY_HEADER, OPERATION_KIND_HEADER,
};
use folio_common::types::OperationKind;

use crate::error::{ErrorCode, RelayError};

/// Default retention window for replay records.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60); // 24 hours

/// Maximum body size buffered for hashing (1 MiB).
const MAX_HASH_BODY_BYTES: usize = 1024 * 1024;

/// Identity of the caller and the workspace a mutation targets. Inserted
/// as a request extension by the (out-of-scope) auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestScope {
    pub actor_id: Uuid,
    pub scope_id: Uuid,
}

/// The full replay-record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayKey {
    pub actor_id: Uuid,
    pub scope_id: Uuid,
    pub operation: OperationKind,
    pub idempotency_key: String,
}

/// A recorded first response.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    /// SHA-256 of the request body, to detect key reuse with a new body.
    pub body_hash: String,
    pub status: StatusCode,
    pub body: Bytes,
    created_at: Instant,
}

impl StoredResponse {
    /// Build a record for a response computed now. Retention age is
    /// tracked from this moment; durable stores persist their own
    /// timestamps and rebuild records through this constructor.
    pub fn new(body_hash: String, status: StatusCode, body: Bytes) -> Self {
        Self { body_hash, status, body, created_at: Instant::now() }
    }
}

/// Interface the relay's mutation handlers sit behind.
///
/// The contract is check-before-execute, store-after-execute: a durable
/// implementation must record the response inside the same transaction as
/// the side effect, so a failed store rolls the effect back rather than
/// leaving it applied-but-unrecorded.
pub trait ReplayStore {
    fn get_replay(
        &self,
        key: &ReplayKey,
    ) -> impl std::future::Future<Output = Option<StoredResponse>> + Send;

    fn store_replay(
        &self,
        key: ReplayKey,
        response: StoredResponse,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// In-memory replay store with TTL-based retention.
#[derive(Debug, Clone)]
pub struct InMemoryReplayStore {
    entries: Arc<RwLock<HashMap<ReplayKey, StoredResponse>>>,
    ttl: Duration,
}

impl Default for InMemoryReplayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReplayStore {
    pub fn new() -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), ttl: DEFAULT_TTL }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Remove expired records. Call periodically for memory hygiene.
    pub async fn evict_expired(&self) -> usize {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before - guard.len()
    }

    /// Number of stored records (including potentially expired).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl ReplayStore for InMemoryReplayStore {
    async fn get_replay(&self, key: &ReplayKey) -> Option<StoredResponse> {
        let guard = self.entries.read().await;
        guard.get(key).and_then(|entry| {
            if entry.created_at.elapsed() < self.ttl {
                Some(entry.clone())
            } else {
                None
            }
        })
    }

    async fn store_replay(&self, key: ReplayKey, response: StoredResponse) -> anyhow::Result<()> {
        let mut guard = self.entries.write().await;
        guard.insert(key, response);
        Ok(())
    }
}

/// Axum middleware enforcing the idempotency protocol on mutating
/// requests (POST/PUT/PATCH) that carry both protocol headers.
///
/// Requests without the headers, without a `RequestScope`, or with other
/// methods pass through unchanged.
pub async fn idempotency_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    if !matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH) {
        return next.run(request).await;
    }

    let Some(key) = header_str(&request, IDEMPOTENCY_KEY_HEADER) else {
        return next.run(request).await;
    };
    let Some(operation) =
        header_str(&request, OPERATION_KIND_HEADER).and_then(|s| OperationKind::parse(&s))
    else {
        return next.run(request).await;
    };
    let Some(scope) = request.extensions().get::<RequestScope>().copied() else {
        return next.run(request).await;
    };
    let Some(store) = request.extensions().get::<InMemoryReplayStore>().cloned() else {
        return next.run(request).await;
    };

    let replay_key = ReplayKey {
        actor_id: scope.actor_id,
        scope_id: scope.scope_id,
        operation,
        idempotency_key: key.clone(),
    };

    // Buffer the body for hashing.
    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, MAX_HASH_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return RelayError::new(
                ErrorCode::ValidationFailed,
                "request body too large for idempotency check",
            )
            .into_response();
        }
    };
    let body_hash = hash_body(&body_bytes);

    // Check before execute.
    if let Some(stored) = store.get_replay(&replay_key).await {
        if stored.body_hash == body_hash {
            debug!(
                operation = operation.as_str(),
                idempotency_key = %key,
                "serving replayed response without re-executing effect"
            );
            return Response::builder()
                .status(stored.status)
                .header(IDEMPOTENCY_KEY_HEADER, &key)
                .header(IDEMPOTENCY_REPLAY_HEADER, "true")
                .body(Body::from(stored.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        return RelayError::from_code(ErrorCode::ReplayMismatch)
            .with_details(json!({ "idempotency_key": key }))
            .into_response();
    }

    // Execute, then store the committed outcome.
    let request = Request::from_parts(parts, Body::from(body_bytes.clone()));
    let response = next.run(request).await;

    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = to_bytes(resp_body, MAX_HASH_BODY_BYTES).await.unwrap_or_default();

    if resp_parts.status.is_success() {
        let stored = StoredResponse::new(body_hash, resp_parts.status, resp_bytes.clone());
        if let Err(error) = store.store_replay(replay_key, stored).await {
            // The effect must not outlive a failed record; a durable
            // store rolls back transactionally. The in-memory store
            // cannot, so surface the inconsistency loudly.
            tracing::error!(%error, "failed to record replay response");
            return RelayError::from_code(ErrorCode::InternalError).into_response();
        }
    }

    let mut response = Response::from_parts(resp_parts, Body::from(resp_bytes));
    response.headers_mut().insert(
        IDEMPOTENCY_KEY_HEADER,
        HeaderValue::from_str(&key).unwrap_or(HeaderValue::from_static("")),
    );
    response
}

fn header_str(request: &Request<Body>, name: &str) -> Option<String> {
    request.headers().get(name).and_then(|v| v.to_str().ok()).map(String::from)
}

fn hash_body(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}
