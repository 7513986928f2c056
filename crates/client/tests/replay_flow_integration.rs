use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use chrono::Utc;
use folio_client::mutation::{MutationIntent, MutationStatus, MAX_ATTEMPTS};
use folio_client::queue::MutationQueue;
use folio_client::replay::{
    DeliveryRequest, DeliveryResponse, MutationTransport, ReplayEngine,
};
use folio_client::store::QueueStore;
use folio_common::types::{HttpMethod, OperationKind};
use serde_json::{json, Value};
use tempfile::tempdir;
use uuid::Uuid;

/// Route pipeline logs to the test harness; later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted transport recording every delivery it sees. When the script
/// runs dry it answers 200.
#[derive(Debug, Default)]
struct ScriptedTransport {
    script: VecDeque<Result<DeliveryResponse, String>>,
    sent: Vec<(OperationKind, String, Value, Uuid)>,
}

impl ScriptedTransport {
    fn fail_network_n(&mut self, n: usize) {
        for _ in 0..n {
            self.script.push_back(Err("connection refused".to_string()));
        }
    }
}

impl MutationTransport for ScriptedTransport {
    async fn deliver(&mut self, request: DeliveryRequest<'_>) -> Result<DeliveryResponse> {
        self.sent.push((
            request.operation,
            request.path.to_string(),
            request.body.clone(),
            request.idempotency_key,
        ));
        match self.script.pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Ok(DeliveryResponse { status: 200, body: None }),
        }
    }
}

fn doc_update(path: &str, body: Value) -> MutationIntent {
    MutationIntent::new(OperationKind::DocumentUpdate, path, HttpMethod::Put, body)
}

fn comment_create(text: &str) -> MutationIntent {
    MutationIntent::new(
        OperationKind::CommentCreate,
        "/threads/7/comments",
        HttpMethod::Post,
        json!({"text": text}),
    )
}

#[tokio::test]
async fn offline_edit_session_collapses_and_drains_on_reconnect() {
    init_tracing();
    let tmp = tempdir().expect("tempdir should be created");
    let store = QueueStore::open(tmp.path().join("queue.db")).expect("queue store should open");
    let mut engine = ReplayEngine::new(MutationQueue::new(store), ScriptedTransport::default());

    // A burst of offline saves to one document plus a comment, the way an
    // editor autosave loop produces them.
    let first = engine
        .queue_mut()
        .enqueue(doc_update("/documents/42", json!({"title": "draft 1"})), Utc::now())
        .expect("enqueue should succeed");
    for n in 2..=5 {
        engine
            .queue_mut()
            .enqueue(doc_update("/documents/42", json!({"title": format!("draft {n}")})), Utc::now())
            .expect("enqueue should succeed");
    }
    engine
        .queue_mut()
        .enqueue(comment_create("looks good"), Utc::now())
        .expect("enqueue should succeed");

    // Five saves collapsed into one queued update.
    assert_eq!(engine.queue().depth().expect("depth"), 2);

    let summary = engine.replay(Utc::now()).await.expect("replay should succeed");
    assert_eq!(summary.processed.len(), 2);
    assert!(summary.failed.is_empty());
    assert_eq!(engine.queue().depth().expect("depth"), 0);

    // Exactly two requests went out; the document update carried the last
    // body under the first save's idempotency key.
    let sent = &engine.transport().sent;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, OperationKind::DocumentUpdate);
    assert_eq!(sent[0].2, json!({"title": "draft 5"}));
    assert_eq!(sent[0].3, first.idempotency_key);
    assert_eq!(sent[1].0, OperationKind::CommentCreate);
}

#[tokio::test]
async fn queued_mutations_survive_process_restart() {
    init_tracing();
    let tmp = tempdir().expect("tempdir should be created");
    let db_path = tmp.path().join("queue.db");

    let queued = {
        let store = QueueStore::open(&db_path).expect("queue store should open");
        let mut queue = MutationQueue::new(store);
        queue
            .enqueue(doc_update("/documents/9", json!({"title": "unsent"})), Utc::now())
            .expect("enqueue should succeed")
        // Store dropped here: simulated shutdown with work still queued.
    };

    let store = QueueStore::open(&db_path).expect("queue store should reopen");
    let mut engine = ReplayEngine::new(MutationQueue::new(store), ScriptedTransport::default());
    assert_eq!(engine.queue().depth().expect("depth"), 1);

    let summary = engine.replay(Utc::now()).await.expect("replay should succeed");
    assert_eq!(summary.processed, vec![queued.id]);
    assert_eq!(engine.queue().depth().expect("depth"), 0);

    // The restart did not mint a new idempotency key.
    assert_eq!(engine.transport().sent[0].3, queued.idempotency_key);
}

#[tokio::test]
async fn persistent_outage_retires_entry_after_five_attempts() {
    init_tracing();
    let tmp = tempdir().expect("tempdir should be created");
    let db_path = tmp.path().join("queue.db");
    let store = QueueStore::open(&db_path).expect("queue store should open");
    let mut engine = ReplayEngine::new(MutationQueue::new(store), ScriptedTransport::default());

    let entry = engine
        .queue_mut()
        .enqueue(comment_create("never arrives"), Utc::now())
        .expect("enqueue should succeed");
    engine.transport_mut().fail_network_n(MAX_ATTEMPTS as usize);

    // One trigger per backoff window, each ending in a network error.
    let mut now = Utc::now();
    for _ in 0..MAX_ATTEMPTS {
        engine.replay(now).await.expect("replay should succeed");
        now += chrono::Duration::seconds(120);
    }

    let stored = engine
        .queue()
        .store()
        .get(entry.id)
        .expect("store read should succeed")
        .expect("entry should be retained");
    assert_eq!(stored.status, MutationStatus::Failed);
    assert_eq!(stored.retry_count, MAX_ATTEMPTS);
    assert!(stored.next_retry_at.is_none());

    // Later triggers leave the retired entry alone.
    engine.replay(now).await.expect("replay should succeed");
    assert_eq!(engine.transport().sent.len(), MAX_ATTEMPTS as usize);

    // The failed entry survives a restart for user-facing recovery flows.
    drop(engine);
    let store = QueueStore::open(&db_path).expect("queue store should reopen");
    let stored = store
        .get(entry.id)
        .expect("store read should succeed")
        .expect("entry should be retained");
    assert_eq!(stored.status, MutationStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("connection refused"));
}

#[tokio::test]
async fn merge_during_backoff_is_delivered_on_the_next_attempt() {
    init_tracing();
    let tmp = tempdir().expect("tempdir should be created");
    let store = QueueStore::open(tmp.path().join("queue.db")).expect("queue store should open");
    let mut engine = ReplayEngine::new(MutationQueue::new(store), ScriptedTransport::default());

    let entry = engine
        .queue_mut()
        .enqueue(doc_update("/documents/42", json!({"title": "v1"})), Utc::now())
        .expect("enqueue should succeed");

    engine.transport_mut().fail_network_n(1);
    let now = Utc::now();
    engine.replay(now).await.expect("replay should succeed");

    // While cooling down the user keeps editing; the queued body advances.
    let merged = engine
        .queue_mut()
        .enqueue(doc_update("/documents/42", json!({"title": "v2"})), Utc::now())
        .expect("enqueue should succeed");
    assert_eq!(merged.id, entry.id);
    assert_eq!(merged.retry_count, 1);

    let summary =
        engine.replay(now + chrono::Duration::seconds(2)).await.expect("replay should succeed");
    assert_eq!(summary.processed, vec![entry.id]);

    // The retry carried the merged body, still under the original key.
    let last = engine.transport().sent.last().expect("second delivery");
    assert_eq!(last.2, json!({"title": "v2"}));
    assert_eq!(last.3, entry.idempotency_key);
}
