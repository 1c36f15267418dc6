//! Reporter configuration.
//!
//! Every option has a default so a config file only needs the keys it
//! changes. Durations are expressed in seconds as floats, matching the
//! way training scripts usually pass them.

use crate::error::{TraincardError, TraincardResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which direction of a checkpoint metadata field counts as "best".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BestMode {
    #[default]
    Min,
    Max,
}

/// Comparison key used to recompute `is_best` over the checkpoint list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestCheckpointPolicy {
    /// Metadata field compared across checkpoints.
    #[serde(default = "default_best_key")]
    pub key: String,
    #[serde(default)]
    pub mode: BestMode,
}

fn default_best_key() -> String {
    "eval_loss".to_string()
}

impl Default for BestCheckpointPolicy {
    fn default() -> Self {
        Self { key: default_best_key(), mode: BestMode::Min }
    }
}

/// Configuration for one (run, rank) reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Root of the run namespace; each rank writes under `rank-<n>/`.
    pub output_namespace: PathBuf,
    /// Seconds between scheduled snapshot flushes.
    pub flush_interval: f64,
    /// Step progress that forces a flush before the interval elapses.
    pub flush_step_interval: u64,
    pub rank: u32,
    pub world_size: u32,
    /// Seconds without metric or heartbeat before a rank counts as stalled.
    pub stall_timeout: f64,
    /// Max points kept per metric series in the snapshot.
    pub metric_retention: usize,
    /// Max log lines kept in the snapshot ring buffer.
    pub log_retention: usize,
    /// Log lines longer than this are truncated with a marker.
    pub max_log_line_chars: usize,
    /// Device utilization (percent) below which a silent rank is stalled.
    pub utilization_threshold: f64,
    /// Fraction of device memory in use that makes an OOM probable.
    pub memory_pressure_fraction: f64,
    /// Capacity of the foreground → background event queue.
    pub queue_capacity: usize,
    /// Attempts per durable write before persistence is marked degraded.
    pub durability_retries: u32,
    /// Base delay of the exponential retry backoff, in milliseconds.
    pub retry_backoff_ms: u64,
    pub best_checkpoint: BestCheckpointPolicy,
    /// Seconds the aggregator waits for one rank's snapshot.
    pub aggregator_read_timeout: f64,
    /// Seconds a rank's latest metric value stays eligible for spread statistics.
    pub freshness_window: f64,
    /// Install SIGINT/SIGTERM watchers that trigger the final flush.
    pub handle_signals: bool,
    /// Exit the process once the signal-triggered flush completes.
    pub exit_on_signal: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            output_namespace: default_output_namespace(),
            flush_interval: 5.0,
            flush_step_interval: 50,
            rank: 0,
            world_size: 1,
            stall_timeout: 300.0,
            metric_retention: 10_000,
            log_retention: 500,
            max_log_line_chars: 4096,
            utilization_threshold: 5.0,
            memory_pressure_fraction: 0.95,
            queue_capacity: 8192,
            durability_retries: 3,
            retry_backoff_ms: 50,
            best_checkpoint: BestCheckpointPolicy::default(),
            aggregator_read_timeout: 2.0,
            freshness_window: 300.0,
            handle_signals: false,
            exit_on_signal: true,
        }
    }
}

/// `$TMPDIR/traincard/<pid>`
fn default_output_namespace() -> PathBuf {
    std::env::temp_dir().join("traincard").join(std::process::id().to_string())
}

/// Upper bound for any duration option: one year.
const MAX_SECONDS: f64 = 365.0 * 24.0 * 3600.0;

/// Never panics; out-of-range values saturate and NaN becomes zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_SECONDS)).unwrap_or(Duration::ZERO)
}

fn check_seconds(name: &str, value: f64) -> TraincardResult<()> {
    if value.is_finite() && value > 0.0 && value <= MAX_SECONDS {
        Ok(())
    } else {
        Err(TraincardError::Config(format!(
            "{name} must be > 0 and <= {MAX_SECONDS} seconds, got {value}"
        )))
    }
}

impl ReporterConfig {
    #[must_use]
    pub fn new(output_namespace: impl Into<PathBuf>) -> Self {
        Self { output_namespace: output_namespace.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_output(mut self, output_namespace: impl Into<PathBuf>) -> Self {
        self.output_namespace = output_namespace.into();
        self
    }

    #[must_use]
    pub fn with_rank(mut self, rank: u32, world_size: u32) -> Self {
        self.rank = rank;
        self.world_size = world_size;
        self
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load_from_file(path: &Path) -> TraincardResult<Self> {
        if !path.exists() {
            return Err(TraincardError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> TraincardResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the environment.
    ///
    /// `TRAINCARD_*` keys win over the generic launcher variables
    /// (`RANK`, `WORLD_SIZE`) that distributed launchers export.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> TraincardResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k));

        if let Some(dir) = first(&["TRAINCARD_OUTPUT"]) {
            self.output_namespace = PathBuf::from(dir);
        }
        if let Some(v) = first(&["TRAINCARD_FLUSH_INTERVAL"]) {
            self.flush_interval = parse_env("TRAINCARD_FLUSH_INTERVAL", &v)?;
        }
        if let Some(v) = first(&["TRAINCARD_STALL_TIMEOUT"]) {
            self.stall_timeout = parse_env("TRAINCARD_STALL_TIMEOUT", &v)?;
        }
        if let Some(v) = first(&["TRAINCARD_RANK", "RANK"]) {
            self.rank = parse_env("RANK", &v)?;
        }
        if let Some(v) = first(&["TRAINCARD_WORLD_SIZE", "WORLD_SIZE"]) {
            self.world_size = parse_env("WORLD_SIZE", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> TraincardResult<()> {
        check_seconds("flush_interval", self.flush_interval)?;
        check_seconds("stall_timeout", self.stall_timeout)?;
        check_seconds("aggregator_read_timeout", self.aggregator_read_timeout)?;
        check_seconds("freshness_window", self.freshness_window)?;
        if self.flush_step_interval == 0 {
            return Err(TraincardError::Config("flush_step_interval must be >= 1".to_string()));
        }
        if self.world_size == 0 {
            return Err(TraincardError::Config("world_size must be >= 1".to_string()));
        }
        if self.rank >= self.world_size {
            return Err(TraincardError::Config(format!(
                "rank {} out of range for world_size {}",
                self.rank, self.world_size
            )));
        }
        if self.metric_retention < 2 {
            return Err(TraincardError::Config("metric_retention must be >= 2".to_string()));
        }
        if self.log_retention == 0 {
            return Err(TraincardError::Config("log_retention must be >= 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(TraincardError::Config("queue_capacity must be >= 1".to_string()));
        }
        if self.durability_retries == 0 {
            return Err(TraincardError::Config("durability_retries must be >= 1".to_string()));
        }
        if self.best_checkpoint.key.trim().is_empty() {
            return Err(TraincardError::Config("best_checkpoint.key is required".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn flush_interval_duration(&self) -> Duration {
        secs(self.flush_interval)
    }

    #[must_use]
    pub fn stall_timeout_duration(&self) -> Duration {
        secs(self.stall_timeout)
    }

    #[must_use]
    pub fn aggregator_read_timeout_duration(&self) -> Duration {
        secs(self.aggregator_read_timeout)
    }

    #[must_use]
    pub fn freshness_window_duration(&self) -> Duration {
        secs(self.freshness_window)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> TraincardResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TraincardError::Config(format!("{key}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_step_interval, 50);
        assert_eq!(config.best_checkpoint.key, "eval_loss");
        assert!(config.output_namespace.to_string_lossy().contains("traincard"));
    }

    #[test]
    fn test_load_partial_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("traincard.toml");
        std::fs::write(
            &path,
            r#"
flush_interval = 1.5
rank = 1
world_size = 4

[best_checkpoint]
key = "accuracy"
mode = "max"
"#,
        )
        .unwrap();

        let config = ReporterConfig::load_from_file(&path).unwrap();
        assert!((config.flush_interval - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.rank, 1);
        assert_eq!(config.world_size, 4);
        assert_eq!(config.best_checkpoint.mode, BestMode::Max);
        assert_eq!(config.log_retention, 500);
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = ReporterConfig::load_from_file(&temp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, TraincardError::Config(_)));
    }

    #[test]
    fn test_rank_must_be_below_world_size() {
        let config = ReporterConfig::default().with_rank(2, 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        let huge = ReporterConfig { stall_timeout: 1e20, ..ReporterConfig::default() };
        assert!(matches!(huge.validate(), Err(TraincardError::Config(_))));

        let infinite = ReporterConfig { aggregator_read_timeout: f64::INFINITY, ..ReporterConfig::default() };
        assert!(matches!(infinite.validate(), Err(TraincardError::Config(_))));

        let negative = ReporterConfig { freshness_window: -1.0, ..ReporterConfig::default() };
        assert!(negative.validate().is_err());

        let nan = ReporterConfig { flush_interval: f64::NAN, ..ReporterConfig::default() };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_duration_accessors_saturate() {
        let config = ReporterConfig {
            stall_timeout: 1e20,
            aggregator_read_timeout: f64::INFINITY,
            freshness_window: f64::NAN,
            ..ReporterConfig::default()
        };
        assert_eq!(config.stall_timeout_duration(), Duration::from_secs(31_536_000));
        assert_eq!(config.aggregator_read_timeout_duration(), Duration::from_secs(31_536_000));
        assert_eq!(config.freshness_window_duration(), Duration::ZERO);
    }

    #[test]
    fn test_env_overrides_prefer_traincard_keys() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RANK", "3"),
            ("WORLD_SIZE", "8"),
            ("TRAINCARD_RANK", "1"),
            ("TRAINCARD_OUTPUT", "/data/run-7"),
        ]);
        let mut config = ReporterConfig::default();
        config.apply_env_from(|k| env.get(k).map(|v| (*v).to_string())).unwrap();

        assert_eq!(config.rank, 1);
        assert_eq!(config.world_size, 8);
        assert_eq!(config.output_namespace, PathBuf::from("/data/run-7"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = ReporterConfig::default();
        let result = config.apply_env_from(|k| (k == "WORLD_SIZE").then(|| "many".to_string()));
        assert!(result.is_err());
    }
}
