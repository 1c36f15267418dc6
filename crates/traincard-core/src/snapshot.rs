//! Crash-safe `latest.json` and `checkpoints.json` writes.
//!
//! Writes go to a uniquely named temp file in the same directory, are
//! fsynced, then renamed over the target. A reader sees either the old
//! file or the new one, never a mix.

use crate::error::{TraincardError, TraincardResult};
use crate::layout::RankLayout;
use crate::state::{CheckpointRecord, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Contents of `checkpoints.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<String>,
    pub checkpoints: Vec<CheckpointRecord>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    snapshot_path: PathBuf,
    checkpoints_path: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(layout: &RankLayout) -> Self {
        Self {
            dir: layout.dir().to_path_buf(),
            snapshot_path: layout.snapshot_path(),
            checkpoints_path: layout.checkpoints_path(),
        }
    }

    #[must_use]
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Write the serialized state to a durable temp file without publishing it.
    pub fn stage(&self, state: &RunState) -> TraincardResult<StagedSnapshot> {
        let json = serde_json::to_vec_pretty(state)?;
        stage_bytes(&self.dir, &self.snapshot_path, &json)
    }

    pub fn write(&self, state: &RunState) -> TraincardResult<()> {
        self.stage(state)?.commit()
    }

    pub fn write_checkpoints(&self, checkpoints: &[CheckpointRecord], at: DateTime<Utc>) -> TraincardResult<()> {
        let manifest = CheckpointManifest {
            updated_at: at,
            best: checkpoints.iter().find(|c| c.is_best).map(|c| c.path.clone()),
            checkpoints: checkpoints.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        stage_bytes(&self.dir, &self.checkpoints_path, &json)?.commit()
    }

    /// Load `latest.json`. `Ok(None)` when no snapshot exists yet.
    pub fn load(&self) -> TraincardResult<Option<RunState>> {
        load_snapshot(&self.snapshot_path)
    }

    /// Remove temp files left behind by interrupted writes.
    pub fn cleanup_stale_temps(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.contains(".tmp.") && fs::remove_file(entry.path()).is_ok() {
                debug!(file = name, "Removed stale snapshot temp file");
                removed += 1;
            }
        }
        removed
    }
}

/// A fully written temp file waiting to be renamed over its target.
#[derive(Debug)]
pub struct StagedSnapshot {
    temp_path: PathBuf,
    target: PathBuf,
    dir: PathBuf,
}

impl StagedSnapshot {
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Atomically publish the staged file.
    pub fn commit(self) -> TraincardResult<()> {
        if let Err(e) = fs::rename(&self.temp_path, &self.target) {
            let _ = fs::remove_file(&self.temp_path);
            return Err(TraincardError::Durability(format!(
                "failed to rename {} over {}: {e}",
                self.temp_path.display(),
                self.target.display()
            )));
        }
        sync_dir(&self.dir);
        Ok(())
    }
}

/// Read a snapshot written by any rank. Decoding failures are `CorruptState`.
pub fn load_snapshot(path: &Path) -> TraincardResult<Option<RunState>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| TraincardError::CorruptState(format!("{}: {e}", path.display())))
}

fn stage_bytes(dir: &Path, target: &Path, bytes: &[u8]) -> TraincardResult<StagedSnapshot> {
    fs::create_dir_all(dir)?;
    let file_name = target.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot");
    let temp_path = dir.join(format!("{file_name}.tmp.{}", Uuid::new_v4()));

    let written = File::create(&temp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(StagedSnapshot { temp_path, target: target.to_path_buf(), dir: dir.to_path_buf() })
}

/// Make the rename itself durable. Not every platform can open a directory.
fn sync_dir(dir: &Path) {
    match File::open(dir).and_then(|d| d.sync_all()) {
        Ok(()) => {}
        Err(e) if cfg!(unix) => warn!(dir = %dir.display(), "Directory fsync failed: {}", e),
        Err(_) => {}
    }
}
