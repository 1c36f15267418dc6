use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lifecycle points a training loop can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    TrainBegin,
    TrainEnd,
    EpochBegin,
    EpochEnd,
    StepEnd,
    Log,
    Evaluate,
    Save,
    Error,
}

/// An exception surfaced by the training loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookError {
    pub exception_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Whatever the framework knows at the hook. Every field is optional; the
/// adapter uses what is present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
    /// Global optimizer step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    /// Fractional epoch as most trainers track it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<f64>,
    /// Logged or evaluated values. Non-numeric entries are only echoed to the log.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, serde_json::Value>,
    /// The trainer's output directory; checkpoints live under it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_epochs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HookError>,
}

impl HookPayload {
    #[must_use]
    pub fn at_step(step: u64) -> Self {
        Self { step: Some(step), ..Self::default() }
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch: f64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, exception_type: &str, message: &str, stack: Option<&str>) -> Self {
        self.error = Some(HookError {
            exception_type: exception_type.to_string(),
            message: message.to_string(),
            stack: stack.map(str::to_string),
        });
        self
    }

    /// Numeric entries of `values`, in key order. Booleans are not numbers here.
    pub fn numeric_values(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values
            .iter()
            .filter_map(|(key, value)| value.as_f64().map(|v| (key.as_str(), v)))
    }
}

/// One framework integration. Implementations translate their framework's
/// lifecycle into `Reporter` calls and never fail the training loop.
#[async_trait]
pub trait FrameworkAdapter: Send + Sync {
    fn framework(&self) -> &'static str;

    async fn on_event(&self, kind: HookKind, payload: &HookPayload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_values_skip_strings_and_bools() {
        let payload = HookPayload::at_step(3)
            .with_value("loss", 1.5)
            .with_value("epoch_label", "warmup")
            .with_value("grad_clipped", true)
            .with_value("tokens", 4096);

        let numeric: Vec<(&str, f64)> = payload.numeric_values().collect();
        assert_eq!(numeric, vec![("loss", 1.5), ("tokens", 4096.0)]);
    }

    #[test]
    fn test_payload_from_framework_json() {
        let payload: HookPayload = serde_json::from_value(json!({
            "step": 12,
            "epoch": 0.5,
            "values": {"loss": 0.25},
            "output_dir": "/out",
        }))
        .unwrap();
        assert_eq!(payload.step, Some(12));
        assert_eq!(payload.output_dir, Some(PathBuf::from("/out")));
        assert!(payload.error.is_none());
    }
}
