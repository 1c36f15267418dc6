//! Restart of a crashed process in the same namespace.
//!
//! Each "process" gets its own runtime. Dropping a runtime without calling
//! `finish` stands in for a hard kill: the worker is never polled again.

mod common;

use common::{load_rank, test_config};
use tempfile::TempDir;
use tokio::runtime::{Builder, Runtime};
use traincard_core::{
    read_journal, DiagnosticKind, EventPayload, Reducer, ReducerPolicy, RecoverySource, Reporter,
    ReporterConfig, RunState,
};

fn runtime() -> Runtime {
    Builder::new_current_thread().enable_all().build().unwrap()
}

/// Run A: loss at steps 0..100 made durable, then five more steps lost to a crash.
fn crashed_run(config: &ReporterConfig) {
    let rt = runtime();
    rt.block_on(async {
        let reporter = Reporter::start(config.clone()).await.unwrap();
        for step in 0..100u64 {
            reporter.metric("loss", 2.0, step);
        }
        reporter.flush().await.unwrap();
        for step in 100..105u64 {
            reporter.metric("loss", 1.9, step);
        }
    });
    drop(rt);
}

/// Run B: the framework restarted from its own checkpoint and counts from 0 again.
fn resumed_run(config: &ReporterConfig) -> RunState {
    let rt = runtime();
    rt.block_on(async {
        let reporter = Reporter::start(config.clone()).await.unwrap();
        for step in 0..50u64 {
            reporter.metric("loss", 1.0, step);
        }
        reporter.finish().await;
        reporter.get_state()
    })
}

fn assert_resumed(state: &RunState) {
    assert_eq!(state.restart_count, 1);
    assert_eq!(state.sessions.len(), 2);
    assert_eq!(state.discontinuities.len(), 1);
    assert_eq!(state.discontinuities[0].step, Some(0));
    assert_eq!(state.discontinuities[0].reason, "restart 1");

    let points = &state.metrics["loss"].points;
    assert_eq!(points.len(), 150);
    // Run A's history is untouched.
    assert!(points[..100].iter().enumerate().all(|(i, p)| p.step == i as u64 && p.discontinuity.is_none()));
    // Run B starts over at step 0 with an explicit break instead of a regression.
    assert_eq!(points[100].step, 0);
    assert_eq!(points[100].discontinuity.as_deref(), Some("restart 1"));
    assert!(points[100..].iter().all(|p| !p.non_monotonic));
    assert_eq!(points[149].step, 49);
    assert!(!state.diagnostics.iter().any(|d| d.kind == DiagnosticKind::NonMonotonicStep));
}

#[test]
fn test_resume_after_crash_from_snapshot() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, 0, 1);

    crashed_run(&config);
    let state = resumed_run(&config);
    assert_resumed(&state);
    assert_resumed(&load_rank(&temp, 0));

    let scan = read_journal(&config.output_namespace.join("rank-0").join("events.jsonl")).unwrap();
    let resume = scan.events.iter().find_map(|e| match &e.payload {
        EventPayload::Session { resume: Some(resume), .. } => Some(resume.clone()),
        _ => None,
    });
    assert_eq!(resume.unwrap().recovery, RecoverySource::Snapshot);
}

#[test]
fn test_resume_with_corrupt_snapshot_replays_journal() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, 0, 1);

    crashed_run(&config);
    let snapshot = config.output_namespace.join("rank-0").join("latest.json");
    std::fs::write(&snapshot, b"{\"format_version\":1,").unwrap();

    let state = resumed_run(&config);
    assert_resumed(&state);
    assert!(state.diagnostics.iter().any(|d| d.kind == DiagnosticKind::StateRecovery));
}

#[test]
fn test_resumed_state_equals_full_replay() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, 0, 1);
    crashed_run(&config);
    let state = resumed_run(&config);

    let scan = read_journal(&config.output_namespace.join("rank-0").join("events.jsonl")).unwrap();
    let replayed = Reducer::new(ReducerPolicy::from_config(&config)).replay(0, 1, &scan.events);
    assert_eq!(replayed.without_overlays(), state.without_overlays());
}

#[test]
fn test_resume_after_torn_journal_tail() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, 0, 1);
    crashed_run(&config);

    let journal = config.output_namespace.join("rank-0").join("events.jsonl");
    let mut bytes = std::fs::read(&journal).unwrap();
    bytes.extend_from_slice(br#"{"sequence":999,"timestamp":"2024-01-01T00:00"#);
    std::fs::write(&journal, bytes).unwrap();
    std::fs::remove_file(config.output_namespace.join("rank-0").join("latest.json")).unwrap();

    let state = resumed_run(&config);
    assert_resumed(&state);

    let scan = read_journal(&journal).unwrap();
    assert!(!scan.torn_tail);
    assert_eq!(scan.skipped_lines, 0);
}
