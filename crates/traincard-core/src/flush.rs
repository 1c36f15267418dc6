//! Flush scheduling and the per-rank background task.
//!
//! The worker is the only place that touches the journal or the snapshot
//! files. Each drained batch is appended durably first and applied second.
//! The worker keeps two folds: the shared state every event reaches, and a
//! durable state that only confirmed appends reach. Snapshots are written
//! from the durable fold, so `latest.json` never runs ahead of the journal
//! even after persistence degrades.

use crate::config::ReporterConfig;
use crate::error::{TraincardError, TraincardResult};
use crate::event::{Event, EventPayload};
use crate::journal::JournalWriter;
use crate::reducer::Reducer;
use crate::snapshot::SnapshotStore;
use crate::state::{DiagnosticKind, RunState};
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Max events appended in one group commit.
const MAX_BATCH: usize = 512;

/// Why a snapshot flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Interval,
    Steps,
    Failure,
    Requested,
    Finish,
    Interrupt,
    Closed,
}

/// `elapsed ≥ interval` OR `steps ≥ step_interval`, whichever comes first.
#[derive(Debug, Clone)]
pub struct FlushSchedule {
    interval: Duration,
    step_interval: u64,
    last_flush: Instant,
    step_at_last_flush: u64,
}

impl FlushSchedule {
    #[must_use]
    pub fn new(interval: Duration, step_interval: u64, now: Instant, step: u64) -> Self {
        Self { interval, step_interval: step_interval.max(1), last_flush: now, step_at_last_flush: step }
    }

    #[must_use]
    pub fn from_config(config: &ReporterConfig, now: Instant, step: u64) -> Self {
        Self::new(config.flush_interval_duration(), config.flush_step_interval, now, step)
    }

    #[must_use]
    pub fn due(&self, now: Instant, step: u64) -> Option<FlushTrigger> {
        if now >= self.next_deadline() {
            Some(FlushTrigger::Interval)
        } else if step.abs_diff(self.step_at_last_flush) >= self.step_interval {
            // A restart resets steps; a large jump back counts as progress too.
            Some(FlushTrigger::Steps)
        } else {
            None
        }
    }

    #[must_use]
    pub fn next_deadline(&self) -> Instant {
        self.last_flush + self.interval
    }

    pub fn mark_flushed(&mut self, now: Instant, step: u64) {
        self.last_flush = now;
        self.step_at_last_flush = step;
    }
}

/// Foreground → background messages.
#[derive(Debug)]
pub(crate) enum Command {
    Event(Event),
    Flush(oneshot::Sender<()>),
    Finish(oneshot::Sender<()>),
    Interrupt(oneshot::Sender<()>),
}

/// State shared between the `Reporter` handles and the worker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: RwLock<RunState>,
    pub(crate) dropped_events: AtomicU64,
}

impl Shared {
    pub(crate) fn new(state: RunState) -> Self {
        Self { state: RwLock::new(state), dropped_events: AtomicU64::new(0) }
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state with the foreground drop counter folded into `health`.
    pub(crate) fn snapshot(&self) -> RunState {
        let mut state = self.read().clone();
        state.health.dropped_events = self.dropped_events.load(Ordering::Relaxed);
        state
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) attempts: u32,
    pub(crate) backoff: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &ReporterConfig) -> Self {
        Self { attempts: config.durability_retries.max(1), backoff: config.retry_backoff() }
    }

    /// Run `op` until it succeeds or the attempts are used up, doubling the delay each time.
    pub(crate) async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> TraincardResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TraincardResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && e.is_transient() => {
                    let delay = self.backoff.saturating_mul(1u32 << (attempt - 1).min(16));
                    warn!(attempt, max_attempts = self.attempts, ?delay, "{} failed: {}", what, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run blocking filesystem work off the async threads.
async fn blocking<T, F>(f: F) -> TraincardResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> TraincardResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TraincardError::Durability(format!("background I/O task failed: {e}")))?
}

/// Size of a checkpoint file, or the total size of a checkpoint directory.
#[must_use]
pub fn checkpoint_size(path: &Path) -> Option<u64> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.is_file() {
        return Some(meta.len());
    }
    let total = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(std::fs::Metadata::is_file)
        .map(|m| m.len())
        .sum();
    Some(total)
}

fn resolve_checkpoint_sizes(batch: &mut [Event]) {
    for event in batch {
        if let EventPayload::Checkpoint { path, size_bytes, .. } = &mut event.payload {
            if size_bytes.is_none() {
                *size_bytes = checkpoint_size(Path::new(path));
            }
        }
    }
}

pub(crate) struct FlushWorker {
    rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    reducer: Reducer,
    journal_path: PathBuf,
    journal: Arc<Mutex<Option<JournalWriter>>>,
    store: SnapshotStore,
    schedule: FlushSchedule,
    retry: RetryPolicy,
    rank: u32,
    /// Fold of the events the journal confirmed; the only state published.
    durable: RunState,
    flushed_sequence: u64,
    /// Durable sequence of the last "held in memory" diagnostic.
    reported_lag: Option<u64>,
}

impl FlushWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rx: mpsc::Receiver<Command>,
        shared: Arc<Shared>,
        reducer: Reducer,
        journal_path: PathBuf,
        journal: Option<JournalWriter>,
        store: SnapshotStore,
        schedule: FlushSchedule,
        retry: RetryPolicy,
    ) -> Self {
        let (rank, durable) = {
            let state = shared.read();
            (state.rank, state.without_overlays())
        };
        Self {
            rx,
            shared,
            reducer,
            journal_path,
            journal: Arc::new(Mutex::new(journal)),
            store,
            schedule,
            retry,
            rank,
            durable,
            flushed_sequence: 0,
            reported_lag: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(rank = self.rank, "Flush worker started");
        loop {
            let deadline = self.schedule.next_deadline();
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        self.flush(FlushTrigger::Closed).await;
                        break;
                    };
                    if self.handle(command).await {
                        break;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    self.flush_if_due(false).await;
                }
            }
        }
        debug!(rank = self.rank, "Flush worker stopped");
    }

    /// Returns `true` once the worker should stop.
    async fn handle(&mut self, command: Command) -> bool {
        let mut next = Some(command);
        while let Some(command) = next.take() {
            match command {
                Command::Event(event) => {
                    let mut batch = vec![event];
                    while batch.len() < MAX_BATCH {
                        match self.rx.try_recv() {
                            Ok(Command::Event(event)) => batch.push(event),
                            Ok(other) => {
                                next = Some(other);
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                    let saw_failure = self.persist_batch(batch).await;
                    self.flush_if_due(saw_failure).await;
                }
                Command::Flush(ack) => {
                    self.flush(FlushTrigger::Requested).await;
                    let _ = ack.send(());
                }
                Command::Finish(ack) => {
                    self.shutdown(FlushTrigger::Finish).await;
                    let _ = ack.send(());
                    return true;
                }
                Command::Interrupt(ack) => {
                    self.shared.write().health.record(
                        DiagnosticKind::Interrupted,
                        "termination requested; final flush may be incomplete",
                    );
                    self.shutdown(FlushTrigger::Interrupt).await;
                    let _ = ack.send(());
                    return true;
                }
            }
        }
        false
    }

    /// Stop accepting commands, persist whatever was already queued, then flush.
    async fn shutdown(&mut self, trigger: FlushTrigger) {
        self.rx.close();
        let mut leftovers = Vec::new();
        let mut acks = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Event(event) => leftovers.push(event),
                Command::Flush(ack) | Command::Finish(ack) | Command::Interrupt(ack) => acks.push(ack),
            }
        }
        for chunk in leftovers.chunks(MAX_BATCH) {
            self.persist_batch(chunk.to_vec()).await;
        }
        self.flush(trigger).await;
        for ack in acks {
            let _ = ack.send(());
        }
        info!(rank = self.rank, ?trigger, "Final flush complete");
    }

    /// Durably append `batch`, then apply it. Events whose append failed reach
    /// the shared state only. Returns whether the batch held a failure event.
    async fn persist_batch(&mut self, batch: Vec<Event>) -> bool {
        let batch = match blocking(move || {
            let mut batch = batch;
            resolve_checkpoint_sizes(&mut batch);
            Ok(batch)
        })
        .await
        {
            Ok(batch) => Arc::new(batch),
            Err(e) => {
                warn!(rank = self.rank, "Checkpoint size resolution failed: {}", e);
                return false;
            }
        };

        let journal = Arc::clone(&self.journal);
        let path = self.journal_path.clone();
        let appended = self
            .retry
            .run("journal append", || {
                let journal = Arc::clone(&journal);
                let path = path.clone();
                let batch = Arc::clone(&batch);
                blocking(move || {
                    let mut guard = journal.lock().unwrap_or_else(PoisonError::into_inner);
                    if guard.is_none() {
                        let (writer, _) = JournalWriter::open(&path)?;
                        *guard = Some(writer);
                    }
                    match guard.as_mut() {
                        Some(writer) => writer.append_batch(&batch),
                        None => Err(TraincardError::Durability("journal unavailable".to_string())),
                    }
                })
            })
            .await;

        let confirmed = appended.is_ok();
        let mut state = self.shared.write();
        if let Err(e) = appended {
            state.health.journal_failures += 1;
            self.degrade(&mut state, format!("journal append failed: {e}"));
        }
        let mut saw_failure = false;
        for event in batch.iter() {
            saw_failure |= matches!(event.payload, EventPayload::Failure { .. });
            self.reducer.apply(&mut state, event);
            if confirmed {
                self.reducer.apply(&mut self.durable, event);
            }
        }
        saw_failure
    }

    fn degrade(&self, state: &mut RunState, message: String) {
        if !state.health.persistence_degraded {
            warn!(rank = self.rank, "Persistence degraded: {}", message);
        }
        state.health.persistence_degraded = true;
        state.health.last_error = Some(message.clone());
        state.health.record(DiagnosticKind::PersistenceDegraded, message);
    }

    async fn flush_if_due(&mut self, saw_failure: bool) {
        let step = self.shared.read().step;
        let trigger = if saw_failure {
            Some(FlushTrigger::Failure)
        } else {
            self.schedule.due(Instant::now(), step)
        };
        if let Some(trigger) = trigger {
            self.flush(trigger).await;
        }
    }

    /// Publish the durable fold with the current health attached.
    fn publishable(&mut self) -> RunState {
        let current = self.shared.snapshot();
        let mut state = self.durable.clone();
        state.health = current.health;
        // Liveness depends on the reader's clock and is never persisted.
        state.liveness = None;

        let durable_sequence = self.durable.last_sequence;
        if current.last_sequence > durable_sequence && self.reported_lag != Some(durable_sequence) {
            self.reported_lag = Some(durable_sequence);
            let message = format!(
                "snapshot held at durable sequence {durable_sequence}; events up to {} are in memory only",
                current.last_sequence
            );
            warn!(rank = self.rank, "{}", message);
            state.health.record(DiagnosticKind::PersistenceDegraded, message.clone());
            self.shared.write().health.record(DiagnosticKind::PersistenceDegraded, message);
        }
        state
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        let step = self.shared.read().step;
        if self.durable.last_sequence == self.flushed_sequence && trigger == FlushTrigger::Interval {
            self.schedule.mark_flushed(Instant::now(), step);
            return;
        }

        let state = self.publishable();
        let sequence = state.last_sequence;
        let state = Arc::new(state);
        let store = self.store.clone();
        let written = self
            .retry
            .run("snapshot write", || {
                let store = store.clone();
                let state = Arc::clone(&state);
                blocking(move || {
                    store.write(&state)?;
                    store.write_checkpoints(&state.checkpoints, Utc::now())
                })
            })
            .await;

        self.schedule.mark_flushed(Instant::now(), step);
        let mut shared = self.shared.write();
        match written {
            Ok(()) => {
                self.flushed_sequence = sequence;
                shared.health.flush_count += 1;
                shared.health.last_flush_at = Some(Utc::now());
                debug!(rank = self.rank, sequence, ?trigger, "Snapshot flushed");
            }
            Err(e) => {
                shared.health.snapshot_failures += 1;
                self.degrade(&mut shared, format!("snapshot write failed: {e}"));
            }
        }
    }
}
