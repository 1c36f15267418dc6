//! Startup recovery of a prior process' state in the same namespace.
//!
//! Prefers `latest.json` plus the journal tail after its `last_sequence`,
//! falls back to a full journal replay, and as a last resort starts fresh.
//! History is never renumbered or deleted: the new process only appends,
//! and its opening `Session` event marks the break.

use crate::event::{Event, EventPayload, RecoverySource, ResumeInfo};
use crate::journal::read_journal;
use crate::layout::RankLayout;
use crate::reducer::Reducer;
use crate::snapshot::load_snapshot;
use crate::state::{PersistenceHealth, RunState};
use tracing::{info, warn};
use uuid::Uuid;

pub const RECOVERY_FAILED_REASON: &str = "state recovery failed";

/// What was found from the previous process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorRun {
    pub source: RecoverySource,
    /// `last_sequence` of the snapshot used, 0 if none.
    pub snapshot_sequence: u64,
    /// Journal events applied on top of the snapshot (or from scratch).
    pub replayed_events: usize,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Recovery {
    pub state: RunState,
    /// First sequence number the new process may use.
    pub next_sequence: u64,
    pub prior: Option<PriorRun>,
}

impl Recovery {
    /// Whether this process continues an earlier one.
    #[must_use]
    pub fn is_resume(&self) -> bool {
        self.prior.is_some()
    }

    /// The event that opens the new process lifetime.
    #[must_use]
    pub fn session_event(&self, session_id: Uuid, world_size: u32) -> Event {
        let resume = self.prior.as_ref().map(|prior| {
            let restart_count = self.state.restart_count + 1;
            let reason = if prior.source.is_lossy() {
                RECOVERY_FAILED_REASON.to_string()
            } else {
                format!("restart {restart_count}")
            };
            ResumeInfo { restart_count, reason, recovery: prior.source, notes: prior.notes.clone() }
        });
        Event::new(
            self.next_sequence,
            self.state.rank,
            None,
            EventPayload::Session { session_id, world_size, resume },
        )
    }
}

pub struct ResumeMerger {
    layout: RankLayout,
    reducer: Reducer,
    world_size: u32,
}

impl ResumeMerger {
    #[must_use]
    pub fn new(layout: RankLayout, reducer: Reducer, world_size: u32) -> Self {
        Self { layout, reducer, world_size }
    }

    /// Recover whatever a prior process left behind. Never fails: the worst
    /// case is a fresh state with a `Failed` recovery source.
    #[must_use]
    pub fn recover(&self) -> Recovery {
        let rank = self.layout.rank();
        let fresh = || RunState::new(rank, self.world_size);
        if !self.layout.has_prior_run() {
            return Recovery { state: fresh(), next_sequence: 1, prior: None };
        }

        let mut notes = Vec::new();
        let snapshot_path = self.layout.snapshot_path();
        let snapshot = match load_snapshot(&snapshot_path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(rank, path = %snapshot_path.display(), "Snapshot unreadable, falling back to journal: {}", e);
                notes.push(format!("snapshot unreadable: {e}"));
                None
            }
        };
        let snapshot_failed = !notes.is_empty();

        let events_path = self.layout.events_path();
        let (events, journal_max) = match read_journal(&events_path) {
            Ok(scan) => {
                if scan.skipped_lines > 0 {
                    notes.push(format!("{} unreadable journal line(s) skipped", scan.skipped_lines));
                }
                if scan.torn_tail {
                    notes.push("torn journal tail discarded".to_string());
                }
                let max = scan.max_sequence();
                (Some(scan.events), max)
            }
            Err(e) => {
                warn!(rank, path = %events_path.display(), "Journal unreadable: {}", e);
                notes.push(format!("journal unreadable: {e}"));
                (None, 0)
            }
        };

        let (mut state, source, snapshot_sequence, replayed_events) = match (snapshot, events) {
            (Some(snapshot), events) => {
                let base = snapshot.last_sequence;
                let tail: Vec<&Event> = events
                    .iter()
                    .flatten()
                    .filter(|e| e.sequence > base)
                    .collect();
                let source = if tail.is_empty() {
                    RecoverySource::Snapshot
                } else {
                    RecoverySource::SnapshotWithJournalTail
                };
                let replayed = tail.len();
                (self.reducer.replay_onto(snapshot, tail), source, base, replayed)
            }
            (None, Some(events)) if !events.is_empty() => {
                let state = self.reducer.replay(rank, self.world_size, &events);
                (state, RecoverySource::JournalReplay, 0, events.len())
            }
            (None, Some(_)) if !snapshot_failed => {
                // Files exist but nothing was ever made durable.
                return Recovery { state: fresh(), next_sequence: 1, prior: None };
            }
            (None, _) => (fresh(), RecoverySource::Failed, 0, 0),
        };

        // Health and liveness belong to the process that produced them.
        state.health = PersistenceHealth::default();
        state.liveness = None;
        state.world_size = self.world_size;

        let next_sequence = state.last_sequence.max(journal_max) + 1;
        info!(
            rank,
            ?source,
            snapshot_sequence,
            replayed_events,
            restart_count = state.restart_count,
            "Recovered prior run state"
        );
        Recovery {
            state,
            next_sequence,
            prior: Some(PriorRun { source, snapshot_sequence, replayed_events, notes }),
        }
    }
}
