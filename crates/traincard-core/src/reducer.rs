//! Deterministic event → state reduction.
//!
//! The reducer reads nothing but the prior state, the event and its policy:
//! no wall clock, no I/O. Replaying a journal in `sequence` order from an
//! empty state therefore reproduces the compacted state exactly.

use crate::config::{BestCheckpointPolicy, BestMode, ReporterConfig};
use crate::detector::is_oom_signature;
use crate::event::{Event, EventPayload, FailureReport, ResumeInfo};
use crate::phase::Phase;
use crate::state::{
    CheckpointRecord, Diagnostic, DiagnosticKind, DiscontinuityMarker, FailureContext,
    FailureRecord, HeartbeatRecord, LogLine, MetricPoint, MetricSeries, PhaseTransition, RunState,
    SessionRecord, MAX_PHASE_HISTORY,
};
use crate::system::SystemSnapshot;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ReducerPolicy {
    pub metric_retention: usize,
    pub log_retention: usize,
    pub best_checkpoint: BestCheckpointPolicy,
    /// Device memory fraction at which a failure is flagged as probable OOM.
    pub memory_pressure_fraction: f64,
}

impl Default for ReducerPolicy {
    fn default() -> Self {
        Self::from_config(&ReporterConfig::default())
    }
}

impl ReducerPolicy {
    #[must_use]
    pub fn from_config(config: &ReporterConfig) -> Self {
        Self {
            metric_retention: config.metric_retention.max(2),
            log_retention: config.log_retention.max(1),
            best_checkpoint: config.best_checkpoint.clone(),
            memory_pressure_fraction: config.memory_pressure_fraction,
        }
    }
}

/// What `Reducer::apply` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    /// Sequence already covered by the state.
    Duplicate,
    /// Arrived after finish/failure and before a new session.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct Reducer {
    policy: ReducerPolicy,
}

impl Reducer {
    #[must_use]
    pub fn new(policy: ReducerPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &ReducerPolicy {
        &self.policy
    }

    /// `reduce(state, event) -> state'`
    #[must_use]
    pub fn reduce(&self, mut state: RunState, event: &Event) -> RunState {
        self.apply(&mut state, event);
        state
    }

    /// Replay events from an empty state, ordered by `sequence`.
    #[must_use]
    pub fn replay<'a, I>(&self, rank: u32, world_size: u32, events: I) -> RunState
    where
        I: IntoIterator<Item = &'a Event>,
    {
        self.replay_onto(RunState::new(rank, world_size), events)
    }

    /// Replay events on top of an existing state; already-covered sequences are skipped.
    #[must_use]
    pub fn replay_onto<'a, I>(&self, mut state: RunState, events: I) -> RunState
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut ordered: Vec<&Event> = events.into_iter().collect();
        ordered.sort_by_key(|e| e.sequence);
        for event in ordered {
            self.apply(&mut state, event);
        }
        state
    }

    pub fn apply(&self, state: &mut RunState, event: &Event) -> Applied {
        if event.sequence <= state.last_sequence {
            return Applied::Duplicate;
        }

        let ts = event.timestamp;
        state.last_sequence = event.sequence;
        state.event_count += 1;
        state.started_at.get_or_insert(ts);
        state.updated_at = Some(state.updated_at.map_or(ts, |prev| prev.max(ts)));

        if state.finalized && !matches!(event.payload, EventPayload::Session { .. }) {
            state.push_diagnostic(Diagnostic {
                kind: DiagnosticKind::IgnoredAfterFinish,
                message: format!("{} event ignored: run is {}", event.kind(), state.phase),
                timestamp: ts,
                sequence: Some(event.sequence),
            });
            return Applied::Ignored;
        }

        if let Some(step) = event.step {
            if let Some(marker) = state.discontinuities.last_mut() {
                if marker.step.is_none() {
                    marker.step = Some(step);
                }
            }
        }

        match &event.payload {
            EventPayload::Metric { name, value, tags, non_monotonic } => {
                self.apply_metric(state, event, name, *value, tags, *non_monotonic);
            }
            EventPayload::Log { line, level, truncated } => {
                state.logs.push_back(LogLine {
                    timestamp: ts,
                    level: *level,
                    line: line.clone(),
                    truncated: *truncated,
                });
                state.log_lines_total += 1;
                while state.logs.len() > self.policy.log_retention {
                    state.logs.pop_front();
                }
            }
            EventPayload::Phase { phase } => {
                let resolution = Phase::resolve(state.phase, *phase);
                state.phase = resolution.displayed;
                push_transition(state, event, *phase, resolution.displayed, resolution.valid);
                if let Some(warning) = resolution.warning {
                    state.push_diagnostic(Diagnostic {
                        kind: DiagnosticKind::InvalidPhase,
                        message: warning,
                        timestamp: ts,
                        sequence: Some(event.sequence),
                    });
                }
            }
            EventPayload::Checkpoint { path, metadata, size_bytes } => {
                let record = CheckpointRecord {
                    path: path.clone(),
                    step: event.step,
                    timestamp: ts,
                    size_bytes: *size_bytes,
                    metadata: metadata.clone(),
                    is_best: false,
                    sequence: event.sequence,
                };
                match state.checkpoints.iter_mut().find(|c| c.path == *path) {
                    Some(existing) => *existing = record,
                    None => state.checkpoints.push(record),
                }
                mark_best(&mut state.checkpoints, &self.policy.best_checkpoint);
            }
            EventPayload::System { stats } => {
                state
                    .system
                    .entry(event.rank)
                    .or_insert_with(|| SystemSnapshot::new(ts))
                    .merge(stats, ts);
            }
            EventPayload::Heartbeat => {
                state.heartbeats.insert(
                    event.rank,
                    HeartbeatRecord { rank: event.rank, timestamp: ts, last_step: event.step },
                );
                state.last_progress_at = Some(ts);
            }
            EventPayload::Epoch { epoch } => state.epoch = *epoch,
            EventPayload::Failure { report } => self.apply_failure(state, event, report),
            EventPayload::Finish => {
                state.phase = Phase::Done;
                push_transition(state, event, Phase::Done, Phase::Done, true);
                state.finalized = true;
            }
            EventPayload::Session { session_id, world_size, resume } => {
                state.world_size = *world_size;
                if let Some(resume) = resume {
                    apply_resume(state, ts, event.sequence, resume);
                }
                state.sessions.push(SessionRecord {
                    session_id: *session_id,
                    started_at: ts,
                    first_sequence: event.sequence,
                    restart_count: state.restart_count,
                });
            }
        }
        Applied::Applied
    }

    fn apply_metric(
        &self,
        state: &mut RunState,
        event: &Event,
        name: &str,
        value: f64,
        tags: &BTreeMap<String, String>,
        flagged: bool,
    ) {
        let ts = event.timestamp;
        let raw_step = event.step.unwrap_or(state.step);
        let series = state.metrics.entry(name.to_string()).or_default();

        let previous = series.session_max_step;
        let step = previous.map_or(raw_step, |prev| prev.max(raw_step));
        let non_monotonic = flagged || previous.is_some_and(|prev| raw_step < prev);
        series.session_max_step = Some(step);
        series.tags.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        let discontinuity = series.pending_break.take();

        let same_step = series.points.last_mut().filter(|last| {
            !non_monotonic
                && discontinuity.is_none()
                && !last.non_monotonic
                && last.raw_step == raw_step
                && last.step == step
        });
        if let Some(last) = same_step {
            last.value = value;
            last.timestamp = ts;
        } else {
            series.points.push(MetricPoint { step, raw_step, value, timestamp: ts, non_monotonic, discontinuity });
            series.total_points += 1;
            thin_series(series, self.policy.metric_retention);
        }

        state.step = state.step.max(step);
        state.last_progress_at = Some(ts);

        if non_monotonic {
            state.push_diagnostic(Diagnostic {
                kind: DiagnosticKind::NonMonotonicStep,
                message: format!("{name}: step {raw_step} after {}; displayed at {step}", previous.unwrap_or(step)),
                timestamp: ts,
                sequence: Some(event.sequence),
            });
        }
    }

    fn apply_failure(&self, state: &mut RunState, event: &Event, report: &FailureReport) {
        let mut oom_evidence = Vec::new();
        let text = format!(
            "{}\n{}\n{}",
            report.exception_type,
            report.message,
            report.stack.as_deref().unwrap_or_default()
        );
        if is_oom_signature(&text) {
            oom_evidence.push("failure text matches an out-of-memory signature".to_string());
        }
        let system = state.system.get(&event.rank).cloned();
        if let Some(peak) = system.as_ref().and_then(SystemSnapshot::peak_device_memory_fraction) {
            if peak >= self.policy.memory_pressure_fraction {
                oom_evidence.push(format!("device memory at {:.0}% of capacity", peak * 100.0));
            }
        }

        let last_metrics = state
            .metrics
            .iter()
            .filter_map(|(name, series)| {
                let value = series.latest()?.value;
                value.is_finite().then(|| (name.clone(), value))
            })
            .collect();
        let step = event.step.unwrap_or(state.step);

        state.failure = Some(FailureRecord {
            exception_type: report.exception_type.clone(),
            message: report.message.clone(),
            stack: report.stack.clone(),
            step,
            timestamp: event.timestamp,
            oom_suspected: !oom_evidence.is_empty(),
            oom_evidence,
            context: FailureContext {
                phase: state.phase,
                step: state.step,
                epoch: state.epoch,
                last_metrics,
                system,
            },
        });
        state.phase = Phase::Failed;
        push_transition(state, event, Phase::Failed, Phase::Failed, true);
        state.finalized = true;
    }
}

fn apply_resume(state: &mut RunState, ts: DateTime<Utc>, sequence: u64, resume: &ResumeInfo) {
    state.restart_count = resume.restart_count;
    state.discontinuities.push(DiscontinuityMarker {
        step: None,
        timestamp: ts,
        reason: resume.reason.clone(),
        restart_count: resume.restart_count,
    });
    for series in state.metrics.values_mut() {
        series.pending_break = Some(resume.reason.clone());
        series.session_max_step = None;
    }
    if let Some(failure) = state.failure.take() {
        state.prior_failures.push(failure);
    }
    state.phase = Phase::Init;
    state.finalized = false;
    state.step = 0;

    if resume.recovery.is_lossy() {
        state.push_diagnostic(Diagnostic {
            kind: DiagnosticKind::StateRecovery,
            message: format!("{}: prior history could not be recovered", resume.reason),
            timestamp: ts,
            sequence: Some(sequence),
        });
    }
    for note in &resume.notes {
        state.push_diagnostic(Diagnostic {
            kind: DiagnosticKind::StateRecovery,
            message: note.clone(),
            timestamp: ts,
            sequence: Some(sequence),
        });
    }
}

fn push_transition(state: &mut RunState, event: &Event, requested: Phase, displayed: Phase, valid: bool) {
    state.phase_history.push(PhaseTransition {
        sequence: event.sequence,
        timestamp: event.timestamp,
        requested,
        displayed,
        valid,
    });
    if state.phase_history.len() > MAX_PHASE_HISTORY {
        let excess = state.phase_history.len() - MAX_PHASE_HISTORY;
        state.phase_history.drain(..excess);
    }
}

/// Recompute `is_best`: best key value wins, ties go to the earliest
/// timestamp, then the lowest sequence. Records without the key never win.
pub(crate) fn mark_best(checkpoints: &mut [CheckpointRecord], policy: &BestCheckpointPolicy) {
    let score = |c: &CheckpointRecord| {
        c.metadata.get(&policy.key).and_then(serde_json::Value::as_f64).filter(|v| v.is_finite())
    };

    let mut best: Option<(usize, f64)> = None;
    for (idx, record) in checkpoints.iter().enumerate() {
        let Some(value) = score(record) else { continue };
        let better = match best {
            None => true,
            Some((best_idx, best_value)) => {
                let improves = match policy.mode {
                    BestMode::Min => value < best_value,
                    BestMode::Max => value > best_value,
                };
                #[allow(clippy::float_cmp)]
                let ties = value == best_value;
                let incumbent = &checkpoints[best_idx];
                improves
                    || (ties
                        && (record.timestamp, record.sequence)
                            < (incumbent.timestamp, incumbent.sequence))
            }
        };
        if better {
            best = Some((idx, value));
        }
    }

    for (idx, record) in checkpoints.iter_mut().enumerate() {
        record.is_best = best.is_some_and(|(best_idx, _)| best_idx == idx);
    }
}

/// Halve the interior of a series until it fits `limit`.
///
/// The first point, the last point and every discontinuity point are always kept.
fn thin_series(series: &mut MetricSeries, limit: usize) {
    while series.points.len() > limit {
        let before = series.points.len();
        let last = before - 1;
        let mut index = 0usize;
        let mut interior = 0usize;
        series.points.retain(|point| {
            let i = index;
            index += 1;
            if i == 0 || i == last || point.discontinuity.is_some() {
                return true;
            }
            interior += 1;
            interior % 2 == 0
        });
        let removed = before - series.points.len();
        if removed == 0 {
            break;
        }
        series.thinned_points += removed as u64;
    }
}
