//! The compacted run state.
//!
//! `RunState` is what `latest.json` holds and what a renderer consumes.
//! Everything except the `liveness` and `health` overlays is produced by
//! the reducer, so replaying the journal reproduces it exactly.

use crate::detector::LivenessReport;
use crate::event::LogLevel;
use crate::phase::Phase;
use crate::serde_util::lossy_f64;
use crate::system::SystemSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

pub const STATE_FORMAT_VERSION: u32 = 1;
pub const MAX_DIAGNOSTICS: usize = 200;
pub const MAX_PHASE_HISTORY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Display step, never below the previous point of the same session.
    pub step: u64,
    /// Step as reported by the caller.
    pub raw_step: u64,
    #[serde(with = "lossy_f64")]
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub non_monotonic: bool,
    /// Set on the first point after a resume boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discontinuity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub points: Vec<MetricPoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Points ever appended, including ones thinned out since.
    pub total_points: u64,
    /// Points removed by downsampling.
    #[serde(default)]
    pub thinned_points: u64,
    /// Highest display step in the current process lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_max_step: Option<u64>,
    /// Resume reason waiting for this series' next point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_break: Option<String>,
}

impl MetricSeries {
    #[must_use]
    pub fn latest(&self) -> Option<&MetricPoint> {
        self.points.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub is_best: bool,
    /// Sequence of the event that last wrote this record.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub rank: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub line: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub requested: Phase,
    pub displayed: Phase,
    pub valid: bool,
}

/// Explicit break in every metric series at a resume boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscontinuityMarker {
    /// Step of the first step-bearing event after the restart.
    pub step: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub restart_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub first_sequence: u64,
    pub restart_count: u32,
}

/// State of the run captured when the failure was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub phase: Phase,
    pub step: u64,
    pub epoch: u64,
    /// Latest finite value of every metric.
    pub last_metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub exception_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    pub oom_suspected: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub oom_evidence: Vec<String>,
    pub context: FailureContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    InvalidPhase,
    NonMonotonicStep,
    LogTruncated,
    IgnoredAfterFinish,
    StateRecovery,
    PersistenceDegraded,
    DroppedEvents,
    Interrupted,
}

/// A user-visible note about observability quality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Persistence health, maintained by the background task rather than the reducer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceHealth {
    /// Sticky once a durable write exhausted its retries.
    pub persistence_degraded: bool,
    pub dropped_events: u64,
    pub journal_failures: u64,
    pub snapshot_failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<DateTime<Utc>>,
    pub flush_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl PersistenceHealth {
    pub fn record(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        push_bounded(
            &mut self.diagnostics,
            Diagnostic { kind, message: message.into(), timestamp: Utc::now(), sequence: None },
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub format_version: u32,
    pub rank: u32,
    pub world_size: u32,
    pub phase: Phase,
    #[serde(default)]
    pub phase_history: Vec<PhaseTransition>,
    pub step: u64,
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Timestamp of the last metric or heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    /// Highest applied sequence; sequences start at 1.
    pub last_sequence: u64,
    pub event_count: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSeries>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRecord>,
    #[serde(default)]
    pub system: BTreeMap<u32, SystemSnapshot>,
    #[serde(default)]
    pub heartbeats: BTreeMap<u32, HeartbeatRecord>,
    #[serde(default)]
    pub logs: VecDeque<LogLine>,
    pub log_lines_total: u64,
    pub restart_count: u32,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    #[serde(default)]
    pub discontinuities: Vec<DiscontinuityMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_failures: Vec<FailureRecord>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    /// Set by finish or failure; later events are ignored until a new session.
    pub finalized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<LivenessReport>,
    #[serde(default)]
    pub health: PersistenceHealth,
}

impl RunState {
    #[must_use]
    pub fn new(rank: u32, world_size: u32) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            rank,
            world_size,
            phase: Phase::Init,
            phase_history: Vec::new(),
            step: 0,
            epoch: 0,
            started_at: None,
            updated_at: None,
            last_progress_at: None,
            last_sequence: 0,
            event_count: 0,
            metrics: BTreeMap::new(),
            checkpoints: Vec::new(),
            system: BTreeMap::new(),
            heartbeats: BTreeMap::new(),
            logs: VecDeque::new(),
            log_lines_total: 0,
            restart_count: 0,
            sessions: Vec::new(),
            discontinuities: Vec::new(),
            failure: None,
            prior_failures: Vec::new(),
            diagnostics: Vec::new(),
            finalized: false,
            liveness: None,
            health: PersistenceHealth::default(),
        }
    }

    #[must_use]
    pub fn latest_metric(&self, name: &str) -> Option<&MetricPoint> {
        self.metrics.get(name).and_then(MetricSeries::latest)
    }

    #[must_use]
    pub fn best_checkpoint(&self) -> Option<&CheckpointRecord> {
        self.checkpoints.iter().find(|c| c.is_best)
    }

    #[must_use]
    pub fn heartbeat(&self, rank: u32) -> Option<&HeartbeatRecord> {
        self.heartbeats.get(&rank)
    }

    /// Wall-clock span covered by the applied events.
    #[must_use]
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.updated_at? - self.started_at?)
    }

    /// The reducer-owned part of the state, without read-time overlays.
    #[must_use]
    pub fn without_overlays(&self) -> Self {
        Self { liveness: None, health: PersistenceHealth::default(), ..self.clone() }
    }

    pub(crate) fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        push_bounded(&mut self.diagnostics, diagnostic);
    }
}

fn push_bounded(list: &mut Vec<Diagnostic>, diagnostic: Diagnostic) {
    list.push(diagnostic);
    if list.len() > MAX_DIAGNOSTICS {
        let excess = list.len() - MAX_DIAGNOSTICS;
        list.drain(..excess);
    }
}
