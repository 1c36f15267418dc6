//! Trainer-callback adapter.
//!
//! Maps the lifecycle of a Hugging-Face-style `Trainer` onto a `Reporter`:
//!
//! ```text
//! train_begin  → phase TRAIN, "Training started" log line
//! epoch_begin  → epoch counter, phase TRAIN, log line
//! log          → numeric values as metrics, periodic telemetry, formatted log line
//! evaluate     → phase EVAL, numeric values as metrics
//! save         → phase SAVE, checkpoint <output_dir>/checkpoint-<step>, phase TRAIN
//! step_end     → heartbeat
//! train_end    → finish
//! error        → failure capture
//! ```

use crate::hooks::{FrameworkAdapter, HookKind, HookPayload};
use crate::sampler::{HostSampler, SystemSampler};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use traincard_core::{Phase, Reporter, ReporterConfig, TraincardResult};

const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Where the reporter writes when only the trainer's output directory is known.
#[must_use]
pub fn default_namespace(training_output_dir: &Path) -> PathBuf {
    training_output_dir.join("_traincard")
}

pub struct TrainerCallbackAdapter {
    reporter: Reporter,
    sampler: Arc<dyn SystemSampler>,
    /// `None` disables telemetry sampling.
    sample_interval: Option<Duration>,
    last_sample: Mutex<Option<Instant>>,
}

impl TrainerCallbackAdapter {
    #[must_use]
    pub fn new(reporter: Reporter) -> Self {
        Self {
            reporter,
            sampler: Arc::new(HostSampler::new()),
            sample_interval: Some(DEFAULT_SAMPLE_INTERVAL),
            last_sample: Mutex::new(None),
        }
    }

    /// Start a reporter under `default_namespace(training_output_dir)` and wrap it.
    pub async fn start(training_output_dir: &Path, rank: u32, world_size: u32) -> TraincardResult<Self> {
        let config = ReporterConfig::new(default_namespace(training_output_dir)).with_rank(rank, world_size);
        Ok(Self::new(Reporter::start(config).await?))
    }

    /// Sample telemetry with `sampler` at most once per `interval` of log hooks.
    /// Replaces the default `HostSampler`. A zero interval disables sampling.
    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn SystemSampler>, interval: Duration) -> Self {
        self.sampler = sampler;
        self.sample_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    #[must_use]
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    fn sample_if_due(&self) {
        let Some(interval) = self.sample_interval else {
            return;
        };
        let now = Instant::now();
        {
            let mut last = self.last_sample.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.is_some_and(|at| now.duration_since(at) < interval) {
                return;
            }
            *last = Some(now);
        }
        self.reporter.system(self.sampler.sample());
    }

    fn record_values(&self, payload: &HookPayload, step: u64) {
        for (key, value) in payload.numeric_values() {
            self.reporter.metric(key, value, step);
        }
    }

    fn on_train_begin(&self, payload: &HookPayload) {
        self.reporter.phase(Phase::Train);
        let epochs = payload.num_epochs.map_or_else(|| "?".to_string(), |n| n.to_string());
        let batch = payload.batch_size.map_or_else(|| "?".to_string(), |n| n.to_string());
        self.reporter.log(&format!("Training started: {epochs} epochs, batch {batch}"));
    }

    fn on_log(&self, payload: &HookPayload, step: u64) {
        if payload.values.is_empty() {
            return;
        }
        self.record_values(payload, step);
        self.sample_if_due();
        self.reporter.log(&format!("[step {step}] {}", format_values(&payload.values)));
    }

    fn on_evaluate(&self, payload: &HookPayload, step: u64) {
        self.reporter.phase(Phase::Eval);
        if payload.values.is_empty() {
            return;
        }
        self.record_values(payload, step);
        self.reporter.log(&format!("Eval: {}", format_values(&payload.values)));
    }

    fn on_save(&self, payload: &HookPayload, step: u64) {
        self.reporter.phase(Phase::Save);
        let dir = payload.output_dir.clone().unwrap_or_default();
        let path = dir.join(format!("checkpoint-{step}"));
        let path = path.to_string_lossy();

        let mut metadata = BTreeMap::from([("step".to_string(), serde_json::Value::from(step))]);
        if let Some(epoch) = payload.epoch {
            metadata.insert("epoch".to_string(), serde_json::Value::from(epoch));
        }
        self.reporter.checkpoint(&path, metadata);
        self.reporter.log(&format!("Checkpoint saved: {path}"));
        self.reporter.phase(Phase::Train);
    }
}

impl std::fmt::Debug for TrainerCallbackAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerCallbackAdapter")
            .field("reporter", &self.reporter)
            .field("sample_interval", &self.sample_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FrameworkAdapter for TrainerCallbackAdapter {
    fn framework(&self) -> &'static str {
        "trainer-callback"
    }

    async fn on_event(&self, kind: HookKind, payload: &HookPayload) {
        let step = payload.step.unwrap_or(0);
        debug!(hook = ?kind, step, "Trainer hook");
        match kind {
            HookKind::TrainBegin => self.on_train_begin(payload),
            HookKind::TrainEnd => self.reporter.finish().await,
            HookKind::EpochBegin => {
                let epoch = epoch_number(payload.epoch);
                self.reporter.epoch(epoch);
                self.reporter.phase(Phase::Train);
                self.reporter.log(&format!("Epoch {epoch} started"));
            }
            HookKind::EpochEnd => {
                self.reporter.log(&format!("Epoch {} ended", epoch_number(payload.epoch)));
            }
            HookKind::StepEnd => self.reporter.heartbeat(),
            HookKind::Log => self.on_log(payload, step),
            HookKind::Evaluate => self.on_evaluate(payload, step),
            HookKind::Save => self.on_save(payload, step),
            HookKind::Error => match &payload.error {
                Some(error) => {
                    self.reporter.failure(&error.exception_type, &error.message, error.stack.as_deref());
                }
                None => self.reporter.failure("Error", "training loop reported an error", None),
            },
        }
    }
}

fn epoch_number(epoch: Option<f64>) -> u64 {
    epoch.filter(|e| e.is_finite() && *e > 0.0).map_or(0, |e| e.round() as u64)
}

/// `key=value` pairs in key order; floats with four decimals.
fn format_values(values: &BTreeMap<String, serde_json::Value>) -> String {
    let mut line = String::new();
    for (i, (key, value)) in values.iter().enumerate() {
        if i > 0 {
            line.push_str(", ");
        }
        let _ = match value {
            serde_json::Value::Number(n) if n.is_f64() => {
                write!(line, "{key}={:.4}", n.as_f64().unwrap_or_default())
            }
            serde_json::Value::String(s) => write!(line, "{key}={s}"),
            other => write!(line, "{key}={other}"),
        };
    }
    line
}
