//! System telemetry: partial updates merged into a latest-only snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A partial telemetry sample. Only `Some` fields overwrite the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    /// Per-device utilization in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_utilization: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_memory_used_gb: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_memory_total_gb: Option<Vec<f64>>,
    /// Per-device temperature in degrees Celsius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_temperature: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_used_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_total_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_read_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_write_mbps: Option<f64>,
    /// Keys the typed fields do not cover.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SystemStats {
    /// Build stats from a loosely-typed mapping (`{"cpu_percent": 12.0, ...}`).
    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::Value::Object(map))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Drop values JSON cannot represent. Returns true if anything was removed.
    pub fn sanitize(&mut self) -> bool {
        fn scalar(slot: &mut Option<f64>) -> bool {
            let bad = slot.is_some_and(|v| !v.is_finite());
            if bad {
                *slot = None;
            }
            bad
        }
        fn array(slot: &mut Option<Vec<f64>>) -> bool {
            let bad = slot.as_ref().is_some_and(|v| v.iter().any(|x| !x.is_finite()));
            if bad {
                *slot = None;
            }
            bad
        }

        let mut dropped = false;
        dropped |= array(&mut self.device_utilization);
        dropped |= array(&mut self.device_memory_used_gb);
        dropped |= array(&mut self.device_memory_total_gb);
        dropped |= array(&mut self.device_temperature);
        dropped |= scalar(&mut self.cpu_percent);
        dropped |= scalar(&mut self.ram_used_gb);
        dropped |= scalar(&mut self.ram_total_gb);
        dropped |= scalar(&mut self.disk_read_mbps);
        dropped |= scalar(&mut self.disk_write_mbps);
        dropped
    }
}

/// Latest-known telemetry for one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    #[serde(flatten)]
    pub stats: SystemStats,
    pub updated_at: DateTime<Utc>,
}

impl SystemSnapshot {
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { stats: SystemStats::default(), updated_at: at }
    }

    /// Overwrite only the keys present in `update`.
    pub fn merge(&mut self, update: &SystemStats, at: DateTime<Utc>) {
        fn put<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }

        let s = &mut self.stats;
        put(&mut s.device_utilization, &update.device_utilization);
        put(&mut s.device_memory_used_gb, &update.device_memory_used_gb);
        put(&mut s.device_memory_total_gb, &update.device_memory_total_gb);
        put(&mut s.device_temperature, &update.device_temperature);
        put(&mut s.cpu_percent, &update.cpu_percent);
        put(&mut s.ram_used_gb, &update.ram_used_gb);
        put(&mut s.ram_total_gb, &update.ram_total_gb);
        put(&mut s.disk_read_mbps, &update.disk_read_mbps);
        put(&mut s.disk_write_mbps, &update.disk_write_mbps);
        for (key, value) in &update.extra {
            s.extra.insert(key.clone(), value.clone());
        }
        self.updated_at = at;
    }

    /// Highest used/total memory ratio across devices, if both arrays are known.
    #[must_use]
    pub fn peak_device_memory_fraction(&self) -> Option<f64> {
        let used = self.stats.device_memory_used_gb.as_ref()?;
        let total = self.stats.device_memory_total_gb.as_ref()?;
        used.iter()
            .zip(total)
            .filter(|(_, t)| **t > 0.0)
            .map(|(u, t)| u / t)
            .fold(None, |acc: Option<f64>, f| Some(acc.map_or(f, |a| a.max(f))))
    }

    /// True when every reported device is below `threshold` percent.
    /// `None` when no device utilization is known.
    #[must_use]
    pub fn all_devices_below(&self, threshold: f64) -> Option<bool> {
        let util = self.stats.device_utilization.as_ref()?;
        if util.is_empty() {
            return None;
        }
        Some(util.iter().all(|u| *u < threshold))
    }
}
