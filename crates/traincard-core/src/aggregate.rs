//! Read-only view across every rank of a run.
//!
//! Each rank's `latest.json` is read concurrently under one deadline. A read
//! that fails or times out falls back to the last good value for that rank;
//! a rank that was never read contributes to the degraded signal instead of
//! failing the whole view.

use crate::config::ReporterConfig;
use crate::detector::{detect, detect_global, DetectorSettings, LivenessReport};
use crate::layout::RunLayout;
use crate::snapshot::load_snapshot;
use crate::state::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankRead {
    /// Read successfully during this refresh.
    Fresh,
    /// This refresh failed; showing the previous good read.
    Cached,
    /// Never read successfully.
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankView {
    pub rank: u32,
    pub state: Option<RunState>,
    pub read: RankRead,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Timestamp of the rank's own heartbeat record, not of its last metric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<LivenessReport>,
}

/// Spread of one metric's latest values across ranks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpread {
    pub metric: String,
    pub ranks: Vec<u32>,
    pub count: usize,
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalView {
    pub evaluated_at: DateTime<Utc>,
    pub world_size: u32,
    /// Rank 0's state with the run-level liveness overlay.
    pub canonical: Option<RunState>,
    pub ranks: BTreeMap<u32, RankView>,
    pub liveness: LivenessReport,
    /// How long a rank's latest metric value stays eligible for `spread`.
    pub freshness_window: Duration,
}

impl GlobalView {
    #[must_use]
    pub fn rank(&self, rank: u32) -> Option<&RankView> {
        self.ranks.get(&rank)
    }

    /// `metric_spread` as of the refresh, over the configured freshness window.
    #[must_use]
    pub fn spread(&self, name: &str) -> Option<MetricSpread> {
        self.metric_spread(name, self.evaluated_at, self.freshness_window)
    }

    /// Ranks whose latest `name` value was reported within `window` of `now`.
    #[must_use]
    pub fn metric_spread(&self, name: &str, now: DateTime<Utc>, window: Duration) -> Option<MetricSpread> {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let samples: Vec<(u32, f64)> = self
            .ranks
            .values()
            .filter_map(|view| {
                let point = view.state.as_ref()?.latest_metric(name)?;
                let fresh = now.signed_duration_since(point.timestamp) <= window;
                (fresh && point.value.is_finite()).then_some((view.rank, point.value))
            })
            .collect();
        if samples.is_empty() {
            return None;
        }

        let count = samples.len();
        let n = count as f64;
        let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / n;
        let variance = samples.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n;
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, v)| (lo.min(*v), hi.max(*v)));
        Some(MetricSpread {
            metric: name.to_string(),
            ranks: samples.iter().map(|(rank, _)| *rank).collect(),
            count,
            mean,
            variance,
            std_dev: variance.sqrt(),
            min,
            max,
        })
    }
}

pub struct RankAggregator {
    layout: RunLayout,
    world_size: u32,
    read_timeout: Duration,
    freshness_window: Duration,
    settings: DetectorSettings,
    cache: BTreeMap<u32, RunState>,
}

impl RankAggregator {
    #[must_use]
    pub fn new(layout: RunLayout, config: &ReporterConfig) -> Self {
        Self {
            layout,
            world_size: config.world_size.max(1),
            read_timeout: config.aggregator_read_timeout_duration(),
            freshness_window: config.freshness_window_duration(),
            settings: DetectorSettings::from_config(config),
            cache: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ReporterConfig) -> Self {
        Self::new(RunLayout::new(&config.output_namespace), config)
    }

    pub async fn refresh(&mut self) -> GlobalView {
        self.refresh_at(Utc::now()).await
    }

    /// Read every rank and evaluate liveness as of `now`.
    pub async fn refresh_at(&mut self, now: DateTime<Utc>) -> GlobalView {
        let deadline = tokio::time::Instant::now() + self.read_timeout;
        let reads: Vec<_> = (0..self.world_size)
            .map(|rank| {
                let path = self.layout.rank(rank).snapshot_path();
                (rank, tokio::task::spawn_blocking(move || load_snapshot(&path)))
            })
            .collect();

        let mut ranks = BTreeMap::new();
        for (rank, read) in reads {
            let outcome = match tokio::time::timeout_at(deadline, read).await {
                Ok(Ok(Ok(Some(state)))) => Ok(state),
                Ok(Ok(Ok(None))) => Err("no snapshot yet".to_string()),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(e)) => Err(format!("read task failed: {e}")),
                Err(_) => Err(format!("read timed out after {:?}", self.read_timeout)),
            };

            let (state, read, error) = match outcome {
                Ok(state) => {
                    self.cache.insert(rank, state.clone());
                    (Some(state), RankRead::Fresh, None)
                }
                Err(error) => match self.cache.get(&rank) {
                    Some(cached) => {
                        debug!(rank, %error, "Using previous snapshot");
                        (Some(cached.clone()), RankRead::Cached, Some(error))
                    }
                    None => (None, RankRead::Missing, Some(error)),
                },
            };
            if read == RankRead::Missing {
                warn!(rank, error = error.as_deref().unwrap_or_default(), "Rank snapshot unavailable");
            }

            let liveness = state.as_ref().map(|s| detect(s, now, &self.settings));
            let last_heartbeat = state.as_ref().and_then(|s| s.heartbeat(rank)).map(|h| h.timestamp);
            ranks.insert(rank, RankView { rank, state, read, error, last_heartbeat, liveness });
        }

        let liveness = detect_global(
            ranks.values().map(|view| (view.rank, view.state.as_ref())),
            now,
            &self.settings,
        );
        let canonical = ranks.get(&0).and_then(|view| view.state.clone()).map(|mut state| {
            state.liveness = Some(liveness.clone());
            state
        });

        GlobalView {
            evaluated_at: now,
            world_size: self.world_size,
            canonical,
            ranks,
            liveness,
            freshness_window: self.freshness_window,
        }
    }
}
