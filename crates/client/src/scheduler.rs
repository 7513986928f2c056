// Replay scheduling: decides when the engine runs a pass.
//
// Triggers: process start, offline→online transition, a debounced
// queue-changed signal, a periodic safety-net timer, and explicit manual
// triggers. Passes are serialized by construction: the scheduler owns the
// engine and processes one trigger at a time, so a trigger arriving while
// a pass is in flight simply queues behind it.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::events::QueueEvent;
use crate::replay::{MutationTransport, ReplayEngine, ReplaySummary};

/// Default coalescing window for queue-changed triggers.
const DEFAULT_DEBOUNCE_MS: u64 = 1_000;
/// Default safety-net interval.
const DEFAULT_PERIODIC_SECS: u64 = 30;

/// Why a replay pass is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayTrigger {
    /// Process/page start.
    Startup,
    /// The host reported an offline→online transition.
    Online,
    /// The queue contents changed (debounced).
    QueueChanged,
    /// Safety-net timer.
    Periodic,
    /// Explicit replay call.
    Manual,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce_window: Duration,
    pub periodic_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            periodic_interval: Duration::from_secs(DEFAULT_PERIODIC_SECS),
        }
    }
}

// ── Debounce ────────────────────────────────────────────────────────

/// Coalesces queue-changed signals: each signal re-arms the window, and
/// the pass runs once the window elapses without further signals.
#[derive(Debug)]
struct TriggerDebounce {
    window: Duration,
    deadline: Option<Instant>,
}

impl TriggerDebounce {
    fn new(window: Duration) -> Self {
        Self { window, deadline: None }
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn clear(&mut self) {
        self.deadline = None;
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

// ── Status reporting ────────────────────────────────────────────────

/// Reports queue depth and pass outcomes opportunistically, but only when
/// something actually changed since the last report.
#[derive(Debug, Default)]
struct StatusReporter {
    last_depth: Option<i64>,
    last_outcome: Option<(usize, usize)>,
}

impl StatusReporter {
    /// Returns true if the depth was reported (i.e. it changed).
    fn report_depth(&mut self, depth: i64) -> bool {
        if self.last_depth == Some(depth) {
            return false;
        }
        self.last_depth = Some(depth);
        info!(depth, "queue depth");
        true
    }

    /// Returns true if the outcome was reported (i.e. it changed).
    fn report_pass(&mut self, summary: &ReplaySummary) -> bool {
        let outcome = (summary.processed.len(), summary.failed.len());
        if self.last_outcome == Some(outcome) {
            return false;
        }
        self.last_outcome = Some(outcome);
        info!(processed = outcome.0, failed = outcome.1, "replay outcome");
        true
    }
}

// ── Scheduler ───────────────────────────────────────────────────────

/// Handle for firing triggers into a running scheduler.
#[derive(Debug, Clone)]
pub struct ReplayHandle {
    tx: mpsc::UnboundedSender<ReplayTrigger>,
}

impl ReplayHandle {
    /// Fire a trigger. Returns false if the scheduler has shut down.
    pub fn trigger(&self, trigger: ReplayTrigger) -> bool {
        self.tx.send(trigger).is_ok()
    }
}

/// Owns the engine and serializes all replay passes.
pub struct ReplayScheduler<T: MutationTransport> {
    engine: ReplayEngine<T>,
    config: SchedulerConfig,
    rx: mpsc::UnboundedReceiver<ReplayTrigger>,
    reporter: StatusReporter,
}

impl<T: MutationTransport> ReplayScheduler<T> {
    pub fn new(engine: ReplayEngine<T>, config: SchedulerConfig) -> (Self, ReplayHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self { engine, config, rx, reporter: StatusReporter::default() };
        (scheduler, ReplayHandle { tx })
    }

    /// Run until every `ReplayHandle` has been dropped.
    pub async fn run(self) {
        let Self { mut engine, config, mut rx, mut reporter } = self;

        run_pass(&mut engine, &mut reporter, ReplayTrigger::Startup).await;

        let mut queue_events = engine.events().subscribe();
        let mut debounce = TriggerDebounce::new(config.debounce_window);
        let mut periodic = tokio::time::interval_at(
            tokio::time::Instant::now() + config.periodic_interval,
            config.periodic_interval,
        );
        periodic.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = debounce.deadline();

            tokio::select! {
                maybe_trigger = rx.recv() => match maybe_trigger {
                    None => break,
                    Some(ReplayTrigger::QueueChanged) => debounce.arm(Instant::now()),
                    Some(trigger) => run_pass(&mut engine, &mut reporter, trigger).await,
                },

                event = queue_events.recv() => match event {
                    Ok(QueueEvent::Changed { .. }) | Err(RecvError::Lagged(_)) => {
                        debounce.arm(Instant::now());
                    }
                    Ok(QueueEvent::Replayed { .. }) | Err(RecvError::Closed) => {}
                },

                _ = periodic.tick() => {
                    run_pass(&mut engine, &mut reporter, ReplayTrigger::Periodic).await;
                }

                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    debounce.clear();
                    run_pass(&mut engine, &mut reporter, ReplayTrigger::QueueChanged).await;
                }
            }
        }

        debug!("replay scheduler shut down");
    }
}

async fn run_pass<T: MutationTransport>(
    engine: &mut ReplayEngine<T>,
    reporter: &mut StatusReporter,
    trigger: ReplayTrigger,
) {
    debug!(?trigger, "replay pass triggered");
    match engine.replay(Utc::now()).await {
        Ok(summary) => {
            reporter.report_pass(&summary);
            match engine.queue().depth() {
                Ok(depth) => {
                    reporter.report_depth(depth);
                }
                Err(error) => warn!(%error, "failed to read queue depth"),
            }
        }
        Err(error) => warn!(%error, ?trigger, "replay pass failed"),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationIntent;
    use crate::queue::MutationQueue;
    use crate::replay::{DeliveryRequest, DeliveryResponse};
    use crate::store::QueueStore;
    use anyhow::Result;
    use folio_common::types::{HttpMethod, OperationKind};
    use serde_json::json;
    use uuid::Uuid;

    /// Transport that always answers 200.
    #[derive(Debug, Default)]
    struct OkTransport;

    impl MutationTransport for OkTransport {
        async fn deliver(&mut self, _request: DeliveryRequest<'_>) -> Result<DeliveryResponse> {
            Ok(DeliveryResponse { status: 200, body: None })
        }
    }

    fn comment(text: &str) -> MutationIntent {
        MutationIntent::new(
            OperationKind::CommentCreate,
            "/threads/7/comments",
            HttpMethod::Post,
            json!({"text": text}),
        )
    }

    // ── TriggerDebounce ─────────────────────────────────────────────

    #[test]
    fn debounce_not_ready_before_window() {
        let mut debounce = TriggerDebounce::new(Duration::from_millis(100));
        let now = Instant::now();

        debounce.arm(now);
        assert!(!debounce.is_ready(now + Duration::from_millis(50)));
        assert!(debounce.is_ready(now + Duration::from_millis(100)));
    }

    #[test]
    fn debounce_rearm_resets_window() {
        let mut debounce = TriggerDebounce::new(Duration::from_millis(100));
        let now = Instant::now();

        debounce.arm(now);
        debounce.arm(now + Duration::from_millis(80));

        assert!(!debounce.is_ready(now + Duration::from_millis(100)));
        assert!(debounce.is_ready(now + Duration::from_millis(180)));
    }

    #[test]
    fn debounce_clear_disarms() {
        let mut debounce = TriggerDebounce::new(Duration::from_millis(100));
        debounce.arm(Instant::now());
        debounce.clear();
        assert!(debounce.deadline().is_none());
    }

    // ── StatusReporter ──────────────────────────────────────────────

    #[test]
    fn depth_reported_only_when_changed() {
        let mut reporter = StatusReporter::default();
        assert!(reporter.report_depth(3));
        assert!(!reporter.report_depth(3));
        assert!(reporter.report_depth(0));
        assert!(!reporter.report_depth(0));
    }

    #[test]
    fn outcome_reported_only_when_changed() {
        let mut reporter = StatusReporter::default();
        let empty = ReplaySummary::default();
        let one = ReplaySummary { processed: vec![Uuid::new_v4()], failed: vec![] };

        assert!(reporter.report_pass(&empty));
        assert!(!reporter.report_pass(&empty));
        assert!(reporter.report_pass(&one));
        assert!(!reporter.report_pass(&ReplaySummary {
            processed: vec![Uuid::new_v4()],
            failed: vec![],
        }));
    }

    // ── Scheduler runs ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn startup_pass_drains_preexisting_queue() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("queue.db");

        let mut queue =
            MutationQueue::new(QueueStore::open(&path).expect("store"));
        queue.enqueue(comment("from before restart"), Utc::now()).expect("enqueue");

        let engine = ReplayEngine::new(queue, OkTransport);
        let (scheduler, handle) = ReplayScheduler::new(engine, SchedulerConfig::default());
        let task = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(10)).await;

        let inspector = QueueStore::open(&path).expect("second connection");
        assert_eq!(inspector.count().expect("count"), 0);

        drop(handle);
        task.await.expect("scheduler task");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_runs_a_pass() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("queue.db");

        let engine = ReplayEngine::new(
            MutationQueue::new(QueueStore::open(&path).expect("store")),
            OkTransport,
        );
        let (scheduler, handle) = ReplayScheduler::new(engine, SchedulerConfig::default());
        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Seed through a second connection, then trigger manually.
        let seeder = QueueStore::open(&path).expect("second connection");
        let entry = crate::mutation::QueuedMutation::from_intent(comment("late"), Utc::now());
        seeder.put(&entry).expect("put");

        assert!(handle.trigger(ReplayTrigger::Manual));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(seeder.count().expect("count"), 0);

        drop(handle);
        task.await.expect("scheduler task");
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_picks_up_stragglers() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("queue.db");

        let engine = ReplayEngine::new(
            MutationQueue::new(QueueStore::open(&path).expect("store")),
            OkTransport,
        );
        let (scheduler, handle) = ReplayScheduler::new(engine, SchedulerConfig::default());
        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seeder = QueueStore::open(&path).expect("second connection");
        let entry = crate::mutation::QueuedMutation::from_intent(comment("straggler"), Utc::now());
        seeder.put(&entry).expect("put");

        // No trigger fired; only the safety net runs.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(seeder.count().expect("count"), 0);

        drop(handle);
        task.await.expect("scheduler task");
    }

    #[tokio::test(start_paused = true)]
    async fn online_trigger_runs_a_pass() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("queue.db");

        let engine = ReplayEngine::new(
            MutationQueue::new(QueueStore::open(&path).expect("store")),
            OkTransport,
        );
        let (scheduler, handle) = ReplayScheduler::new(engine, SchedulerConfig::default());
        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seeder = QueueStore::open(&path).expect("second connection");
        let entry = crate::mutation::QueuedMutation::from_intent(comment("offline edit"), Utc::now());
        seeder.put(&entry).expect("put");

        assert!(handle.trigger(ReplayTrigger::Online));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seeder.count().expect("count"), 0);

        drop(handle);
        task.await.expect("scheduler task");
    }

    #[tokio::test(start_paused = true)]
    async fn queue_changed_trigger_is_debounced() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("queue.db");

        let engine = ReplayEngine::new(
            MutationQueue::new(QueueStore::open(&path).expect("store")),
            OkTransport,
        );
        let (scheduler, handle) = ReplayScheduler::new(engine, SchedulerConfig::default());
        let task = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seeder = QueueStore::open(&path).expect("second connection");
        let entry = crate::mutation::QueuedMutation::from_intent(comment("typed fast"), Utc::now());
        seeder.put(&entry).expect("put");

        assert!(handle.trigger(ReplayTrigger::QueueChanged));
        // Within the 1s debounce window nothing has run yet.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(seeder.count().expect("count"), 1);

        // After the window elapses, the pass drains the queue.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(seeder.count().expect("count"), 0);

        drop(handle);
        task.await.expect("scheduler task");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_all_handles_shuts_the_scheduler_down() {
        let dir = tempfile::tempdir().expect("temp dir");
        let engine = ReplayEngine::new(
            MutationQueue::new(QueueStore::open(dir.path().join("queue.db")).expect("store")),
            OkTransport,
        );
        let (scheduler, handle) = ReplayScheduler::new(engine, SchedulerConfig::default());
        let task = tokio::spawn(scheduler.run());

        drop(handle);
        task.await.expect("scheduler should exit cleanly");
    }
}
