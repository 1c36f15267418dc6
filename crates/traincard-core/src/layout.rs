use crate::error::TraincardResult;
use std::path::{Path, PathBuf};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const SNAPSHOT_FILE: &str = "latest.json";
pub const CHECKPOINTS_FILE: &str = "checkpoints.json";

/// Filesystem layout of a run namespace.
///
/// Each rank owns `<root>/rank-<n>/` exclusively:
/// `events.jsonl`, `latest.json` and `checkpoints.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn rank(&self, rank: u32) -> RankLayout {
        RankLayout { rank, dir: self.root.join(format!("rank-{rank}")) }
    }
}

/// Paths owned by a single (run, rank).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankLayout {
    rank: u32,
    dir: PathBuf,
}

impl RankLayout {
    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    #[must_use]
    pub fn checkpoints_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINTS_FILE)
    }

    pub fn ensure_dir(&self) -> TraincardResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Whether anything from a prior process exists in this namespace.
    #[must_use]
    pub fn has_prior_run(&self) -> bool {
        self.snapshot_path().exists() || self.events_path().exists()
    }
}
