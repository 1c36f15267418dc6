//! The `Reporter` handle used inside the training loop.
//!
//! Every recording call is synchronous and non-blocking: it stamps the event
//! with the next sequence number and hands it to the background worker
//! through a bounded queue. Nothing here performs durable I/O, and nothing
//! here returns an error into the training loop.

use crate::config::ReporterConfig;
use crate::detector::{detect, DetectorSettings};
use crate::error::{TraincardError, TraincardResult};
use crate::event::{Event, EventPayload, FailureReport, LogLevel};
use crate::flush::{Command, FlushSchedule, FlushWorker, RetryPolicy, Shared};
use crate::journal::JournalWriter;
use crate::layout::{RankLayout, RunLayout};
use crate::phase::Phase;
use crate::reducer::{Reducer, ReducerPolicy};
use crate::resume::ResumeMerger;
use crate::snapshot::SnapshotStore;
use crate::state::RunState;
use crate::system::SystemStats;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Max characters of a failure stack kept in the event.
const MAX_STACK_CHARS: usize = 8192;

/// Sequencing state; the lock spans numbering and `try_send` so queue order
/// equals sequence order.
struct Sequencer {
    tx: mpsc::Sender<Command>,
    next_sequence: u64,
    /// Highest metric step seen in this process.
    latest_step: Option<u64>,
    /// Highest raw step per metric name in this process.
    metric_steps: HashMap<String, u64>,
}

impl Sequencer {
    /// Advance the step high-water marks; only for events that were enqueued.
    fn observe_metric(&mut self, name: String, step: u64) {
        let high = self.metric_steps.entry(name).or_insert(step);
        *high = (*high).max(step);
        self.latest_step = Some(self.latest_step.map_or(step, |s| s.max(step)));
    }
}

struct Inner {
    config: ReporterConfig,
    layout: RankLayout,
    session_id: Uuid,
    shared: Arc<Shared>,
    sequencer: Mutex<Sequencer>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    detector: DetectorSettings,
}

/// Emitter for one (run, rank). Cheap to clone; all clones share one worker.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("rank", &self.inner.config.rank)
            .field("namespace", &self.inner.config.output_namespace)
            .field("session_id", &self.inner.session_id)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// Recover any prior state in the namespace and start the background worker.
    ///
    /// Must be called inside a Tokio runtime. Only configuration and
    /// namespace creation errors are returned; everything later degrades
    /// into health flags.
    pub async fn start(config: ReporterConfig) -> TraincardResult<Self> {
        config.validate()?;
        let layout = RunLayout::new(&config.output_namespace).rank(config.rank);
        layout.ensure_dir()?;

        let reducer = Reducer::new(ReducerPolicy::from_config(&config));
        let store = SnapshotStore::new(&layout);
        let (recovery, journal, repaired) = {
            let layout = layout.clone();
            let reducer = reducer.clone();
            let store = store.clone();
            let world_size = config.world_size;
            tokio::task::spawn_blocking(move || {
                let stale = store.cleanup_stale_temps();
                if stale > 0 {
                    debug!(count = stale, "Removed stale snapshot temp files");
                }
                let recovery = ResumeMerger::new(layout.clone(), reducer, world_size).recover();
                let (journal, repaired) = match JournalWriter::open(&layout.events_path()) {
                    Ok((writer, repaired)) => (Some(writer), repaired),
                    Err(e) => {
                        warn!(path = %layout.events_path().display(), "Journal unavailable at start: {}", e);
                        (None, 0)
                    }
                };
                (recovery, journal, repaired)
            })
            .await
            .map_err(|e| TraincardError::Other(anyhow::anyhow!("recovery task failed: {e}")))?
        };
        if repaired > 0 {
            info!(rank = config.rank, bytes = repaired, "Repaired torn journal tail");
        }

        let session_id = Uuid::new_v4();
        let session = recovery.session_event(session_id, config.world_size);
        let step = recovery.state.step;
        let shared = Arc::new(Shared::new(recovery.state));

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let worker = FlushWorker::new(
            rx,
            Arc::clone(&shared),
            reducer,
            layout.events_path(),
            journal,
            store,
            FlushSchedule::from_config(&config, tokio::time::Instant::now(), step),
            RetryPolicy::from_config(&config),
        );
        let handle = tokio::spawn(worker.run());

        // The channel is empty, so the opening event always fits.
        let next_sequence = session.sequence + 1;
        if tx.try_send(Command::Event(session)).is_err() {
            warn!(rank = config.rank, "Failed to enqueue session event");
        }

        info!(
            rank = config.rank,
            world_size = config.world_size,
            namespace = %config.output_namespace.display(),
            %session_id,
            resumed = recovery.prior.is_some(),
            "Reporter started"
        );

        let reporter = Self {
            inner: Arc::new(Inner {
                detector: DetectorSettings::from_config(&config),
                config,
                layout,
                session_id,
                shared,
                sequencer: Mutex::new(Sequencer {
                    tx,
                    next_sequence,
                    latest_step: None,
                    metric_steps: HashMap::new(),
                }),
                worker: tokio::sync::Mutex::new(Some(handle)),
                closed: AtomicBool::new(false),
            }),
        };
        if reporter.inner.config.handle_signals {
            reporter.watch_signals();
        }
        Ok(reporter)
    }

    #[must_use]
    pub fn config(&self) -> &ReporterConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn rank(&self) -> u32 {
        self.inner.config.rank
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Path of the raw journal, for tools that want full-resolution history.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.inner.layout.events_path()
    }

    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.inner.layout.snapshot_path()
    }

    /// Record a scalar metric. A step below an earlier step of the same
    /// name in this process is kept but flagged non-monotonic.
    pub fn metric(&self, name: &str, value: f64, step: u64) {
        self.metric_with_tags(name, value, step, BTreeMap::new());
    }

    pub fn metric_with_tags(&self, name: &str, value: f64, step: u64, tags: BTreeMap<String, String>) {
        let name = name.trim();
        if name.is_empty() {
            warn!("Metric without a name ignored");
            return;
        }
        self.enqueue(|seq| {
            let previous = seq.metric_steps.get(name).copied();
            let non_monotonic = previous.is_some_and(|prev| step < prev);
            if non_monotonic {
                debug!(metric = name, step, previous, "Non-monotonic metric step");
            }
            let payload = EventPayload::Metric { name: name.to_string(), value, tags, non_monotonic };
            (Some(step), payload)
        });
    }

    pub fn log(&self, line: &str) {
        self.log_with_level(LogLevel::Info, line);
    }

    pub fn log_with_level(&self, level: LogLevel, line: &str) {
        let (line, truncated) = truncate_line(line, self.inner.config.max_log_line_chars);
        self.enqueue(|seq| (seq.latest_step, EventPayload::Log { line, level, truncated }));
    }

    /// Request a phase change. Invalid transitions are recorded and clamped
    /// by the reducer; `Done` and `Failed` are reached through `finish` and
    /// `failure` only.
    pub fn phase(&self, phase: Phase) {
        self.enqueue(|seq| (seq.latest_step, EventPayload::Phase { phase }));
    }

    /// Record a checkpoint. Re-recording a path replaces its metadata.
    pub fn checkpoint(&self, path: &str, metadata: BTreeMap<String, serde_json::Value>) {
        if path.trim().is_empty() {
            warn!("Checkpoint without a path ignored");
            return;
        }
        let path = path.to_string();
        self.enqueue(|seq| {
            (seq.latest_step, EventPayload::Checkpoint { path, metadata, size_bytes: None })
        });
    }

    /// Partial telemetry update; only the keys present overwrite.
    pub fn system(&self, mut stats: SystemStats) {
        if stats.sanitize() {
            debug!("Non-finite telemetry values dropped");
        }
        if stats.is_empty() {
            return;
        }
        self.enqueue(|_| (None, EventPayload::System { stats }));
    }

    pub fn heartbeat(&self) {
        self.enqueue(|seq| (seq.latest_step, EventPayload::Heartbeat));
    }

    pub fn epoch(&self, epoch: u64) {
        self.enqueue(|seq| (seq.latest_step, EventPayload::Epoch { epoch }));
    }

    /// Capture a top-level failure. The run becomes FAILED and the worker
    /// flushes immediately.
    pub fn failure(&self, exception_type: &str, message: &str, stack: Option<&str>) {
        let report = FailureReport {
            exception_type: exception_type.to_string(),
            message: message.to_string(),
            stack: stack.map(|s| truncate_line(s, MAX_STACK_CHARS).0),
        };
        self.enqueue(|seq| (seq.latest_step, EventPayload::Failure { report }));
    }

    /// Current compacted state with a fresh liveness overlay.
    #[must_use]
    pub fn get_state(&self) -> RunState {
        let mut state = self.inner.shared.snapshot();
        state.liveness = Some(detect(&state, Utc::now(), &self.inner.detector));
        state
    }

    /// Wait until every event enqueued before this call is durable and snapshotted.
    pub async fn flush(&self) -> TraincardResult<()> {
        let (ack, done) = oneshot::channel();
        let tx = self.sender();
        tx.send(Command::Flush(ack)).await.map_err(|_| TraincardError::Closed)?;
        done.await.map_err(|_| TraincardError::Closed)
    }

    /// Mark the run DONE, drain the queue and perform the final flush.
    /// Idempotent; concurrent callers all return after the flush.
    pub async fn finish(&self) {
        self.shutdown(true).await;
    }

    /// Best-effort final flush on external termination, without marking DONE.
    pub async fn interrupt(&self) {
        self.shutdown(false).await;
    }

    /// Flush on SIGINT/SIGTERM, then exit if `exit_on_signal` is set.
    pub fn watch_signals(&self) {
        // A weak handle so the watcher does not keep the queue open.
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let name = wait_for_signal().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let reporter = Self { inner };
            warn!(signal = name, rank = reporter.rank(), "Termination signal received, flushing");
            reporter.interrupt().await;
            if reporter.inner.config.exit_on_signal {
                std::process::exit(if name == "SIGTERM" { 143 } else { 130 });
            }
        });
    }

    async fn shutdown(&self, finish: bool) {
        let mut worker = self.inner.worker.lock().await;
        let Some(handle) = worker.take() else {
            return;
        };

        if finish {
            self.enqueue_required(EventPayload::Finish).await;
        }
        self.inner.closed.store(true, Ordering::Release);

        let (ack, done) = oneshot::channel();
        let command = if finish { Command::Finish(ack) } else { Command::Interrupt(ack) };
        if self.sender().send(command).await.is_ok() {
            let _ = done.await;
        }
        if let Err(e) = handle.await {
            warn!(rank = self.rank(), "Flush worker ended abnormally: {}", e);
        }
        info!(rank = self.rank(), finish, "Reporter closed");
    }

    fn sender(&self) -> mpsc::Sender<Command> {
        self.lock_sequencer().tx.clone()
    }

    fn lock_sequencer(&self) -> std::sync::MutexGuard<'_, Sequencer> {
        self.inner.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp and enqueue; a full or closed queue drops the event.
    fn enqueue<F>(&self, build: F)
    where
        F: FnOnce(&mut Sequencer) -> (Option<u64>, EventPayload),
    {
        if !self.try_enqueue(build) {
            self.inner.shared.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn try_enqueue<F>(&self, build: F) -> bool
    where
        F: FnOnce(&mut Sequencer) -> (Option<u64>, EventPayload),
    {
        let mut seq = self.lock_sequencer();
        let (step, payload) = build(&mut seq);
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        let sequence = seq.next_sequence;
        let event = Event::new(sequence, self.inner.config.rank, step, payload);
        let kind = event.kind();
        let metric_step = match (&event.payload, step) {
            (EventPayload::Metric { name, .. }, Some(step)) => Some((name.clone(), step)),
            _ => None,
        };
        match seq.tx.try_send(Command::Event(event)) {
            Ok(()) => {
                seq.next_sequence += 1;
                if let Some((name, step)) = metric_step {
                    seq.observe_metric(name, step);
                }
                true
            }
            Err(e) => {
                let reason = if matches!(e, TrySendError::Full(_)) { "queue full" } else { "worker stopped" };
                debug!(sequence, kind, reason, "Event dropped");
                false
            }
        }
    }

    /// Enqueue an event that must not be dropped, waiting for queue space.
    async fn enqueue_required(&self, payload: EventPayload) {
        loop {
            let attempt = payload.clone();
            if self.try_enqueue(|seq| (seq.latest_step, attempt)) || self.sender().is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Cut `line` to `max_chars` characters, appending a marker when it was cut.
fn truncate_line(line: &str, max_chars: usize) -> (String, bool) {
    match line.char_indices().nth(max_chars) {
        None => (line.to_string(), false),
        Some((cut, _)) => {
            let dropped = line[cut..].chars().count();
            (format!("{} ...[truncated {dropped} chars]", &line[..cut]), true)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!("Cannot watch SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::LivenessStatus;
    use crate::state::DiagnosticKind;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> ReporterConfig {
        ReporterConfig::new(temp.path().join("run"))
    }

    #[test]
    fn test_truncate_line_marks_cut() {
        let (line, truncated) = truncate_line("abcdefghij", 4);
        assert!(truncated);
        assert_eq!(line, "abcd ...[truncated 6 chars]");

        let (line, truncated) = truncate_line("short", 10);
        assert!(!truncated);
        assert_eq!(line, "short");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let (line, truncated) = truncate_line("ééééé", 2);
        assert!(truncated);
        assert!(line.starts_with("éé "));
    }

    #[tokio::test]
    async fn test_finish_makes_everything_visible() {
        let temp = TempDir::new().unwrap();
        let reporter = Reporter::start(config(&temp)).await.unwrap();
        reporter.phase(Phase::Train);
        for step in 0..10u32 {
            reporter.metric("loss", 1.0 / f64::from(step + 1), u64::from(step));
        }
        reporter.finish().await;

        let state = reporter.get_state();
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.metrics["loss"].len(), 10);
        assert_eq!(state.liveness.unwrap().status, LivenessStatus::Finished);

        let on_disk = SnapshotStore::new(&RunLayout::new(temp.path().join("run")).rank(0))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(on_disk.phase, Phase::Done);
        assert_eq!(on_disk.metrics["loss"].len(), 10);
    }

    #[tokio::test]
    async fn test_finish_is_idempotent_and_closes() {
        let temp = TempDir::new().unwrap();
        let reporter = Reporter::start(config(&temp)).await.unwrap();
        reporter.finish().await;
        reporter.finish().await;

        reporter.metric("loss", 1.0, 1);
        assert_eq!(reporter.get_state().health.dropped_events, 1);
        assert!(reporter.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_metric_regression_is_flagged() {
        let temp = TempDir::new().unwrap();
        let reporter = Reporter::start(config(&temp)).await.unwrap();
        reporter.metric("loss", 1.0, 50);
        reporter.metric("loss", 0.9, 10);
        reporter.flush().await.unwrap();

        let state = reporter.get_state();
        let points = &state.metrics["loss"].points;
        assert_eq!(points[1].step, 50);
        assert_eq!(points[1].raw_step, 10);
        assert!(state.diagnostics.iter().any(|d| d.kind == DiagnosticKind::NonMonotonicStep));
        reporter.finish().await;
    }

    #[tokio::test]
    async fn test_long_log_line_is_truncated() {
        let temp = TempDir::new().unwrap();
        let cfg = ReporterConfig { max_log_line_chars: 16, ..config(&temp) };
        let reporter = Reporter::start(cfg).await.unwrap();
        reporter.log(&"x".repeat(100));
        reporter.finish().await;

        let state = reporter.get_state();
        let line = state.logs.back().unwrap();
        assert!(line.truncated);
        assert!(line.line.contains("[truncated 84 chars]"));
    }

    #[tokio::test]
    async fn test_dropped_metric_does_not_raise_step_high_water_mark() {
        let temp = TempDir::new().unwrap();
        let cfg = ReporterConfig { queue_capacity: 1, ..config(&temp) };
        let reporter = Reporter::start(cfg).await.unwrap();
        // The session event still fills the queue, so this one is dropped.
        reporter.metric("loss", 1.0, 100);
        reporter.flush().await.unwrap();

        reporter.metric("loss", 0.5, 10);
        reporter.flush().await.unwrap();

        let state = reporter.get_state();
        assert_eq!(state.health.dropped_events, 1);
        let points = &state.metrics["loss"].points;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].raw_step, 10);
        assert!(!points[0].non_monotonic);
        assert!(!state.diagnostics.iter().any(|d| d.kind == DiagnosticKind::NonMonotonicStep));
        reporter.finish().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let temp = TempDir::new().unwrap();
        let cfg = ReporterConfig { queue_capacity: 1, ..config(&temp) };
        let reporter = Reporter::start(cfg).await.unwrap();
        // The current-thread runtime cannot run the worker between these calls.
        for step in 0..20 {
            reporter.metric("loss", 1.0, step);
        }
        assert!(reporter.get_state().health.dropped_events > 0);
        reporter.finish().await;
    }
}
