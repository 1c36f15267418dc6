//! Stall/failure detection.
//!
//! Liveness is a pure function of the latest state and the current wall
//! clock. It is recomputed on every read and never stored as a phase, so a
//! fresh metric or heartbeat clears `Stalled`/`Degraded` by itself.

use crate::config::ReporterConfig;
use crate::phase::Phase;
use crate::state::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower-cased fragments that identify an out-of-memory failure.
pub const OOM_SIGNATURES: &[&str] = &[
    "out of memory",
    "outofmemoryerror",
    "cuda_error_out_of_memory",
    "cublas_status_alloc_failed",
    "resource exhausted",
    "resourceexhaustederror",
    "failed to allocate",
    "memoryerror",
    "oom-kill",
    "oom killer",
];

#[must_use]
pub fn is_oom_signature(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    OOM_SIGNATURES.iter().any(|sig| lowered.contains(sig))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessStatus {
    Training,
    Stalled,
    Degraded,
    Failed,
    /// The run reached DONE through finish.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub status: LivenessStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    /// Ranks whose last sign of life is older than the stall timeout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale_ranks: Vec<u32>,
    #[serde(default)]
    pub oom_suspected: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl LivenessReport {
    fn new(status: LivenessStatus, evaluated_at: DateTime<Utc>) -> Self {
        Self { status, reasons: Vec::new(), stale_ranks: Vec::new(), oom_suspected: false, evaluated_at }
    }

    fn because(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub stall_timeout: Duration,
    /// Percent.
    pub utilization_threshold: f64,
}

impl DetectorSettings {
    #[must_use]
    pub fn from_config(config: &ReporterConfig) -> Self {
        Self {
            stall_timeout: config.stall_timeout_duration(),
            utilization_threshold: config.utilization_threshold,
        }
    }

    fn older_than_timeout(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - at).to_std().is_ok_and(|age| age > self.stall_timeout)
    }
}

/// Liveness of a single rank's state.
#[must_use]
pub fn detect(state: &RunState, now: DateTime<Utc>, settings: &DetectorSettings) -> LivenessReport {
    match state.phase {
        Phase::Failed => {
            let mut report = LivenessReport::new(LivenessStatus::Failed, now);
            if let Some(failure) = &state.failure {
                report.oom_suspected = failure.oom_suspected;
                report.reasons.push(format!("{}: {}", failure.exception_type, failure.message));
            }
            return report;
        }
        Phase::Done => return LivenessReport::new(LivenessStatus::Finished, now),
        _ => {}
    }

    let Some(reference) = state.last_progress_at.or(state.started_at) else {
        return LivenessReport::new(LivenessStatus::Training, now).because("no events applied yet");
    };
    if !settings.older_than_timeout(reference, now) {
        return LivenessReport::new(LivenessStatus::Training, now);
    }

    let silent_for = (now - reference).num_seconds();
    let telemetry = state.system.get(&state.rank);
    let telemetry_stale =
        telemetry.is_none_or(|snap| settings.older_than_timeout(snap.updated_at, now));
    let devices_idle =
        telemetry.and_then(|snap| snap.all_devices_below(settings.utilization_threshold));

    if telemetry_stale || devices_idle != Some(false) {
        let detail = if telemetry_stale {
            "telemetry stale or absent".to_string()
        } else if devices_idle.is_none() {
            "no device utilization reported".to_string()
        } else {
            format!("device utilization below {}%", settings.utilization_threshold)
        };
        let mut report = LivenessReport::new(LivenessStatus::Stalled, now)
            .because(format!("no metric or heartbeat for {silent_for}s"))
            .because(detail);
        report.stale_ranks.push(state.rank);
        return report;
    }

    LivenessReport::new(LivenessStatus::Training, now)
        .because(format!("no metric or heartbeat for {silent_for}s but devices are busy"))
}

/// Liveness across ranks. `None` means the rank's state could not be read.
#[must_use]
pub fn detect_global<'a, I>(ranks: I, now: DateTime<Utc>, settings: &DetectorSettings) -> LivenessReport
where
    I: IntoIterator<Item = (u32, Option<&'a RunState>)>,
{
    let mut failed = Vec::new();
    let mut stale = Vec::new();
    let mut live = Vec::new();
    let mut finished = 0usize;
    let mut canonical: Option<LivenessReport> = None;
    let mut oom_suspected = false;
    let mut total = 0usize;

    for (rank, state) in ranks {
        total += 1;
        let Some(state) = state else {
            stale.push(rank);
            continue;
        };
        let report = detect(state, now, settings);
        match report.status {
            LivenessStatus::Failed => {
                oom_suspected |= report.oom_suspected;
                failed.push((rank, report.reasons.first().cloned().unwrap_or_default()));
            }
            LivenessStatus::Finished => finished += 1,
            _ => {
                let last_seen = state.last_progress_at.or(state.started_at);
                match last_seen {
                    Some(at) if !settings.older_than_timeout(at, now) => live.push(rank),
                    _ => stale.push(rank),
                }
            }
        }
        if rank == 0 {
            canonical = Some(report);
        }
    }

    if !failed.is_empty() {
        let mut report = LivenessReport::new(LivenessStatus::Failed, now);
        report.oom_suspected = oom_suspected;
        report.reasons = failed.iter().map(|(rank, why)| format!("rank {rank} failed: {why}")).collect();
        return report;
    }
    if total > 0 && finished == total {
        return LivenessReport::new(LivenessStatus::Finished, now);
    }
    if !stale.is_empty() && !live.is_empty() {
        let mut report = LivenessReport::new(LivenessStatus::Degraded, now);
        report.reasons = stale.iter().map(|rank| format!("rank {rank} heartbeat is stale")).collect();
        report.stale_ranks = stale;
        return report;
    }
    if !stale.is_empty() {
        let rank0_stalled =
            canonical.as_ref().is_none_or(|r| r.status == LivenessStatus::Stalled);
        if rank0_stalled {
            let mut report = LivenessReport::new(LivenessStatus::Stalled, now)
                .because("no rank reported progress within the stall timeout");
            report.stale_ranks = stale;
            return report;
        }
    }
    canonical.unwrap_or_else(|| LivenessReport::new(LivenessStatus::Training, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FailureContext, FailureRecord, HeartbeatRecord};
    use crate::system::{SystemSnapshot, SystemStats};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn settings() -> DetectorSettings {
        DetectorSettings { stall_timeout: Duration::from_secs(60), utilization_threshold: 5.0 }
    }

    fn state_with_progress(rank: u32, last_progress: i64, util: Option<Vec<f64>>) -> RunState {
        let mut state = RunState::new(rank, 2);
        state.phase = Phase::Train;
        state.started_at = Some(t(0));
        state.last_progress_at = Some(t(last_progress));
        state.heartbeats.insert(rank, HeartbeatRecord { rank, timestamp: t(last_progress), last_step: None });
        if let Some(util) = util {
            let mut snap = SystemSnapshot::new(t(last_progress));
            snap.merge(&SystemStats { device_utilization: Some(util), ..Default::default() }, t(last_progress));
            state.system.insert(rank, snap);
        }
        state
    }

    #[test]
    fn test_oom_signatures() {
        assert!(is_oom_signature("RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB"));
        assert!(is_oom_signature("ResourceExhaustedError: OOM when allocating tensor"));
        assert!(!is_oom_signature("ValueError: shapes do not match"));
    }

    #[test]
    fn test_stalled_when_silent_and_idle() {
        let state = state_with_progress(0, 0, Some(vec![0.0, 0.0]));
        let report = detect(&state, t(61), &settings());
        assert_eq!(report.status, LivenessStatus::Stalled);
    }

    #[test]
    fn test_busy_devices_are_not_stalled() {
        let mut state = state_with_progress(0, 0, Some(vec![97.0]));
        // Telemetry is fresh even though progress events stopped.
        state.system.get_mut(&0).unwrap().updated_at = t(50);
        let report = detect(&state, t(61), &settings());
        assert_eq!(report.status, LivenessStatus::Training);
    }

    #[test]
    fn test_stale_telemetry_counts_as_absent() {
        let state = state_with_progress(0, 0, Some(vec![97.0]));
        let report = detect(&state, t(120), &settings());
        assert_eq!(report.status, LivenessStatus::Stalled);
    }

    #[test]
    fn test_within_timeout_is_training() {
        let state = state_with_progress(0, 0, Some(vec![0.0]));
        assert_eq!(detect(&state, t(59), &settings()).status, LivenessStatus::Training);
    }

    #[test]
    fn test_failed_is_reported_with_oom_flag() {
        let mut state = state_with_progress(0, 0, None);
        state.phase = Phase::Failed;
        state.failure = Some(FailureRecord {
            exception_type: "RuntimeError".to_string(),
            message: "CUDA out of memory".to_string(),
            stack: None,
            step: 10,
            timestamp: t(1),
            oom_suspected: true,
            oom_evidence: vec![],
            context: FailureContext {
                phase: Phase::Train,
                step: 10,
                epoch: 0,
                last_metrics: Default::default(),
                system: None,
            },
        });
        let report = detect(&state, t(1000), &settings());
        assert_eq!(report.status, LivenessStatus::Failed);
        assert!(report.oom_suspected);
    }

    #[test]
    fn test_global_degraded_names_stale_rank() {
        let rank0 = state_with_progress(0, 95, Some(vec![90.0]));
        let rank1 = state_with_progress(1, 30, Some(vec![90.0]));
        let report = detect_global([(0, Some(&rank0)), (1, Some(&rank1))], t(100), &settings());
        assert_eq!(report.status, LivenessStatus::Degraded);
        assert_eq!(report.stale_ranks, vec![1]);
    }

    #[test]
    fn test_global_missing_rank_is_degraded() {
        let rank0 = state_with_progress(0, 95, None);
        let report = detect_global([(0, Some(&rank0)), (1, None)], t(100), &settings());
        assert_eq!(report.status, LivenessStatus::Degraded);
        assert_eq!(report.stale_ranks, vec![1]);
    }

    #[test]
    fn test_global_all_silent_is_stalled() {
        let rank0 = state_with_progress(0, 0, Some(vec![0.0]));
        let rank1 = state_with_progress(1, 0, Some(vec![0.0]));
        let report = detect_global([(0, Some(&rank0)), (1, Some(&rank1))], t(100), &settings());
        assert_eq!(report.status, LivenessStatus::Stalled);
        assert_eq!(report.stale_ranks, vec![0, 1]);
    }
}
