//! Training phase state machine.
//!
//! ```text
//! INIT → TRAIN ⇄ EVAL
//!          ⇅
//!         SAVE
//! any  → DONE    (finish only)
//! any  → FAILED  (failure capture only)
//! ```

use crate::error::TraincardError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Init,
    Train,
    Eval,
    Save,
    Done,
    Failed,
}

impl Phase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self → next` is an edge of the machine reachable via `phase()`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Train)
                | (Self::Train, Self::Eval | Self::Save)
                | (Self::Eval | Self::Save, Self::Train)
        )
    }

    /// The phase every valid path passes through right before `self`.
    fn predecessor(self) -> Option<Self> {
        match self {
            Self::Init => None,
            Self::Train => Some(Self::Init),
            Self::Eval | Self::Save | Self::Done | Self::Failed => Some(Self::Train),
        }
    }

    /// Resolve a `phase()` request against the current displayed phase.
    #[must_use]
    pub fn resolve(current: Self, requested: Self) -> PhaseResolution {
        if current.is_terminal() {
            return PhaseResolution::rejected(
                current,
                format!("phase {requested} ignored: run is already {current}"),
            );
        }
        if requested.is_terminal() {
            let via = if requested == Self::Done { "finish()" } else { "failure()" };
            return PhaseResolution::rejected(
                current,
                format!("phase {requested} is only reachable through {via}"),
            );
        }
        if current == requested || current.can_transition_to(requested) {
            return PhaseResolution { displayed: requested, valid: true, warning: None };
        }

        let displayed = match requested.predecessor() {
            Some(prev) if prev == current || current.can_transition_to(prev) => prev,
            _ => current,
        };
        PhaseResolution::rejected(
            displayed,
            format!("invalid phase transition {current} -> {requested}; displaying {displayed}"),
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Train => "TRAIN",
            Self::Eval => "EVAL",
            Self::Save => "SAVE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

impl FromStr for Phase {
    type Err = TraincardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "init" => Ok(Self::Init),
            "train" | "training" => Ok(Self::Train),
            "eval" | "evaluate" | "evaluation" => Ok(Self::Eval),
            "save" | "saving" => Ok(Self::Save),
            "done" | "finished" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(TraincardError::Validation(format!("unknown phase: {other}"))),
        }
    }
}

/// Outcome of resolving a requested phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResolution {
    pub displayed: Phase,
    pub valid: bool,
    pub warning: Option<String>,
}

impl PhaseResolution {
    fn rejected(displayed: Phase, warning: String) -> Self {
        Self { displayed, valid: false, warning: Some(warning) }
    }
}
