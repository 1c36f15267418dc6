use thiserror::Error;

pub type TraincardResult<T> = std::result::Result<T, TraincardError>;

/// Errors surfaced by the observability core.
///
/// None of these ever reach the caller of an emitter operation: emitter
/// calls are infallible and failures inside the background task degrade
/// into health flags on the run state.
#[derive(Debug, Error)]
pub enum TraincardError {
    /// Malformed or non-monotonic input. Warn and coerce, never reject.
    #[error("validation error: {0}")]
    Validation(String),

    /// Journal append or snapshot write failed after retries.
    #[error("durability error: {0}")]
    Durability(String),

    /// A persisted snapshot or journal could not be decoded.
    #[error("corrupt state: {0}")]
    CorruptState(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The reporter was already finished or its background task is gone.
    #[error("reporter is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TraincardError {
    /// Whether a retry of the same I/O operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Durability(_))
    }
}
