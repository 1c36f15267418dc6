//! The immutable journal record.
//!
//! `sequence` is the only ordering authority; timestamps are advisory.

use crate::phase::Phase;
use crate::serde_util::lossy_f64;
use crate::system::SystemStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    #[must_use]
    pub fn new(sequence: u64, rank: u32, step: Option<u64>, payload: EventPayload) -> Self {
        Self { sequence, timestamp: Utc::now(), rank, step, payload }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Metric and heartbeat events prove the loop is making progress.
    #[must_use]
    pub fn is_progress(&self) -> bool {
        matches!(self.payload, EventPayload::Metric { .. } | EventPayload::Heartbeat)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Metric {
        name: String,
        #[serde(with = "lossy_f64")]
        value: f64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        tags: BTreeMap<String, String>,
        /// Raw step regressed within this process lifetime.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        non_monotonic: bool,
    },
    Log {
        line: String,
        #[serde(default)]
        level: LogLevel,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        truncated: bool,
    },
    Phase {
        phase: Phase,
    },
    Checkpoint {
        path: String,
        #[serde(default)]
        metadata: BTreeMap<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },
    System {
        stats: SystemStats,
    },
    Heartbeat,
    Epoch {
        epoch: u64,
    },
    Failure {
        report: FailureReport,
    },
    Finish,
    /// Opens every process lifetime.
    Session {
        session_id: Uuid,
        world_size: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<ResumeInfo>,
    },
}

impl EventPayload {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metric { .. } => "metric",
            Self::Log { .. } => "log",
            Self::Phase { .. } => "phase",
            Self::Checkpoint { .. } => "checkpoint",
            Self::System { .. } => "system",
            Self::Heartbeat => "heartbeat",
            Self::Epoch { .. } => "epoch",
            Self::Failure { .. } => "failure",
            Self::Finish => "finish",
            Self::Session { .. } => "session",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

/// Explicit failure capture from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub exception_type: String,
    pub message: String,
    /// Truncated stack snippet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// How the state of a prior process in the namespace was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    Snapshot,
    SnapshotWithJournalTail,
    JournalReplay,
    Failed,
}

impl RecoverySource {
    /// Whether prior history was lost during recovery.
    #[must_use]
    pub fn is_lossy(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Resume bookkeeping carried by the opening `Session` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub restart_count: u32,
    pub reason: String,
    pub recovery: RecoverySource,
    /// Problems met while recovering, surfaced as diagnostics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}
