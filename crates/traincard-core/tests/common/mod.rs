//! Shared helpers for traincard-core integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use tempfile::TempDir;
use traincard_core::{Event, EventPayload, ReporterConfig, RunLayout, RunState, SnapshotStore};

/// Fixed test epoch plus `secs`.
pub fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Config for one rank writing under `temp/run`.
pub fn test_config(temp: &TempDir, rank: u32, world_size: u32) -> ReporterConfig {
    ReporterConfig::new(temp.path().join("run")).with_rank(rank, world_size)
}

pub fn layout(temp: &TempDir) -> RunLayout {
    RunLayout::new(temp.path().join("run"))
}

/// Load a rank's published snapshot, panicking if it is absent.
pub fn load_rank(temp: &TempDir, rank: u32) -> RunState {
    SnapshotStore::new(&layout(temp).rank(rank))
        .load()
        .expect("snapshot readable")
        .expect("snapshot present")
}

/// Builds a sequence of events with deterministic timestamps (`t(sequence)`).
pub struct EventScript {
    rank: u32,
    next: u64,
    pub events: Vec<Event>,
}

impl EventScript {
    pub fn new(rank: u32) -> Self {
        Self::starting_at(rank, 1)
    }

    /// Continue numbering after events that were already applied.
    pub fn starting_at(rank: u32, sequence: u64) -> Self {
        Self { rank, next: sequence, events: Vec::new() }
    }

    pub fn at(&mut self, secs: i64, step: Option<u64>, payload: EventPayload) -> &mut Self {
        let event = Event::new(self.next, self.rank, step, payload).with_timestamp(t(secs));
        self.next += 1;
        self.events.push(event);
        self
    }

    pub fn push(&mut self, step: Option<u64>, payload: EventPayload) -> &mut Self {
        let secs = self.next as i64;
        self.at(secs, step, payload)
    }

    pub fn metric(&mut self, name: &str, value: f64, step: u64) -> &mut Self {
        self.push(
            Some(step),
            EventPayload::Metric {
                name: name.to_string(),
                value,
                tags: BTreeMap::new(),
                non_monotonic: false,
            },
        )
    }

    pub fn heartbeat_at(&mut self, secs: i64) -> &mut Self {
        self.at(secs, None, EventPayload::Heartbeat)
    }
}
