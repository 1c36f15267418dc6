//! Journal appends that keep failing: the run continues in memory and the
//! published snapshot stays at the last confirmed append.

mod common;

use common::{layout, load_rank, test_config};
use tempfile::TempDir;
use traincard_core::{DiagnosticKind, Phase, Reporter, ReporterConfig, RunState};

fn fragile_config(temp: &TempDir) -> ReporterConfig {
    ReporterConfig { durability_retries: 1, retry_backoff_ms: 1, ..test_config(temp, 0, 1) }
}

/// Put a directory where the journal file belongs so every append fails.
fn block_journal(temp: &TempDir) {
    let events = layout(temp).rank(0).events_path();
    if events.exists() {
        std::fs::remove_file(&events).unwrap();
    }
    std::fs::create_dir_all(&events).unwrap();
}

fn has_diagnostic(state: &RunState, kind: DiagnosticKind, needle: &str) -> bool {
    state.health.diagnostics.iter().any(|d| d.kind == kind && d.message.contains(needle))
}

#[tokio::test]
async fn test_failed_appends_stay_out_of_the_snapshot() {
    let temp = TempDir::new().unwrap();
    block_journal(&temp);

    let reporter = Reporter::start(fragile_config(&temp)).await.unwrap();
    reporter.phase(Phase::Train);
    for step in 0..5u64 {
        reporter.metric("loss", 1.0, step);
    }
    assert!(reporter.flush().await.is_ok());
    reporter.finish().await;

    let live = reporter.get_state();
    assert_eq!(live.phase, Phase::Done);
    assert_eq!(live.metrics["loss"].len(), 5);
    assert!(live.health.persistence_degraded);
    assert!(live.health.journal_failures >= 1);
    assert!(live.health.last_error.as_deref().unwrap().contains("journal append failed"));
    assert!(has_diagnostic(&live, DiagnosticKind::PersistenceDegraded, "journal append failed"));

    let on_disk = load_rank(&temp, 0);
    assert_eq!(on_disk.last_sequence, 0);
    assert!(on_disk.metrics.is_empty());
    assert_eq!(on_disk.phase, Phase::Init);
    assert!(on_disk.health.persistence_degraded);
    assert!(has_diagnostic(&on_disk, DiagnosticKind::PersistenceDegraded, "in memory only"));
}

#[tokio::test]
async fn test_snapshot_holds_at_last_durable_sequence() {
    let temp = TempDir::new().unwrap();
    let first = Reporter::start(fragile_config(&temp)).await.unwrap();
    first.phase(Phase::Train);
    for step in 0..3u64 {
        first.metric("loss", 2.0, step);
    }
    first.finish().await;
    let durable = load_rank(&temp, 0);
    assert_eq!(durable.metrics["loss"].len(), 3);

    block_journal(&temp);
    let second = Reporter::start(fragile_config(&temp)).await.unwrap();
    second.phase(Phase::Train);
    for step in 3..8u64 {
        second.metric("loss", 1.5, step);
    }
    second.finish().await;

    let live = second.get_state();
    assert_eq!(live.metrics["loss"].len(), 8);
    assert_eq!(live.restart_count, 1);
    assert!(live.health.persistence_degraded);

    let on_disk = load_rank(&temp, 0);
    assert_eq!(on_disk.last_sequence, durable.last_sequence);
    assert_eq!(on_disk.metrics["loss"].len(), 3);
    assert_eq!(on_disk.restart_count, 0);
    assert_eq!(on_disk.phase, Phase::Done);
    assert!(on_disk.health.persistence_degraded);
    assert!(on_disk.health.journal_failures >= 1);
}

#[tokio::test]
async fn test_healthy_run_is_not_degraded() {
    let temp = TempDir::new().unwrap();
    let reporter = Reporter::start(fragile_config(&temp)).await.unwrap();
    reporter.metric("loss", 1.0, 0);
    reporter.finish().await;

    let on_disk = load_rank(&temp, 0);
    assert!(!on_disk.health.persistence_degraded);
    assert_eq!(on_disk.health.journal_failures, 0);
    assert_eq!(on_disk.last_sequence, reporter.get_state().last_sequence);
}
