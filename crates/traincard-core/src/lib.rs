//! Traincard Core
//!
//! Crash-safe observability for training runs:
//! - Non-blocking event emission (`Reporter`)
//! - Append-only JSONL journal per (run, rank)
//! - Deterministic reduction into a compacted `RunState`
//! - Scheduled, atomic `latest.json` snapshots
//! - Resume of a prior process' state with explicit discontinuities
//! - Read-only multi-rank aggregation and stall/failure detection

pub mod aggregate;
pub mod config;
pub mod detector;
pub mod emitter;
pub mod error;
pub mod event;
pub mod flush;
pub mod journal;
pub mod layout;
pub mod logging;
pub mod phase;
pub mod reducer;
pub mod resume;
mod serde_util;
pub mod snapshot;
pub mod state;
pub mod system;

pub use aggregate::{GlobalView, MetricSpread, RankAggregator, RankRead, RankView};
pub use config::{BestCheckpointPolicy, BestMode, ReporterConfig};
pub use detector::{detect, detect_global, is_oom_signature, DetectorSettings, LivenessReport, LivenessStatus};
pub use emitter::Reporter;
pub use error::{TraincardError, TraincardResult};
pub use event::{Event, EventPayload, FailureReport, LogLevel, RecoverySource, ResumeInfo};
pub use flush::{checkpoint_size, FlushSchedule, FlushTrigger};
pub use journal::{read_journal, JournalScan, JournalWriter};
pub use layout::{RankLayout, RunLayout};
pub use logging::init_logging;
pub use phase::{Phase, PhaseResolution};
pub use reducer::{Applied, Reducer, ReducerPolicy};
pub use resume::{PriorRun, Recovery, ResumeMerger};
pub use snapshot::{load_snapshot, CheckpointManifest, SnapshotStore, StagedSnapshot};
pub use state::{
    CheckpointRecord, Diagnostic, DiagnosticKind, DiscontinuityMarker, FailureRecord, MetricPoint,
    MetricSeries, PersistenceHealth, RunState,
};
pub use system::{SystemSnapshot, SystemStats};
