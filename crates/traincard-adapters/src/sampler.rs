//! System telemetry sources.
//!
//! `HostSampler` covers CPU, RAM and this process's disk throughput. Device
//! probing is vendor-specific, so device fields come from whatever
//! `SystemSampler` the host plugs in.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use sysinfo::{get_current_pid, Pid, ProcessesToUpdate, System};
use traincard_core::SystemStats;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

pub trait SystemSampler: Send + Sync {
    /// Take one sample. Fields the source cannot read stay `None`.
    fn sample(&self) -> SystemStats;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

impl SystemSampler for NoopSampler {
    fn sample(&self) -> SystemStats {
        SystemStats::default()
    }
}

/// Host telemetry read through `sysinfo`. Device fields stay `None`.
pub struct HostSampler {
    counters: Mutex<HostCounters>,
}

struct HostCounters {
    system: System,
    pid: Option<Pid>,
    last_refresh: Instant,
}

impl HostSampler {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; the first one only primes it.
        system.refresh_cpu_usage();
        let pid = get_current_pid().ok();
        if let Some(pid) = pid {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }
        Self { counters: Mutex::new(HostCounters { system, pid, last_refresh: Instant::now() }) }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for HostSampler {
    fn sample(&self) -> SystemStats {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let HostCounters { system, pid, last_refresh } = &mut *counters;
        system.refresh_cpu_usage();
        system.refresh_memory();
        let elapsed = last_refresh.elapsed().as_secs_f64();
        *last_refresh = Instant::now();

        let mut stats = SystemStats {
            cpu_percent: Some(round_to(f64::from(system.global_cpu_usage()), 100.0)),
            ..SystemStats::default()
        };
        let total = system.total_memory();
        if total > 0 {
            stats.ram_used_gb = Some(round_to(system.used_memory() as f64 / GIB, 100.0));
            stats.ram_total_gb = Some(round_to(total as f64 / GIB, 100.0));
        }

        // Disk counters are per refresh, so divide by the time since the last one.
        if let Some(pid) = *pid {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid).filter(|_| elapsed > 0.0) {
                let usage = process.disk_usage();
                stats.disk_read_mbps = Some(round_to(usage.read_bytes as f64 / MIB / elapsed, 10.0));
                stats.disk_write_mbps = Some(round_to(usage.written_bytes as f64 / MIB / elapsed, 10.0));
            }
        }
        stats
    }
}

impl std::fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSampler").finish_non_exhaustive()
    }
}

fn round_to(value: f64, scale: f64) -> f64 {
    (value * scale).round() / scale
}

/// Adapts a closure into a sampler.
pub struct FnSampler<F> {
    sample: F,
}

impl<F> FnSampler<F>
where
    F: Fn() -> SystemStats + Send + Sync,
{
    pub fn new(sample: F) -> Self {
        Self { sample }
    }
}

impl<F> SystemSampler for FnSampler<F>
where
    F: Fn() -> SystemStats + Send + Sync,
{
    fn sample(&self) -> SystemStats {
        (self.sample)()
    }
}

impl<F> std::fmt::Debug for FnSampler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSampler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_sampler_calls_closure() {
        let sampler = FnSampler::new(|| SystemStats { cpu_percent: Some(55.0), ..Default::default() });
        assert_eq!(sampler.sample().cpu_percent, Some(55.0));
        assert!(NoopSampler.sample().is_empty());
    }

    #[test]
    fn test_host_sampler_reads_cpu_and_memory() {
        let sampler = HostSampler::new();
        let stats = sampler.sample();

        let total = stats.ram_total_gb.unwrap();
        assert!(total > 0.0);
        assert!(stats.ram_used_gb.unwrap() <= total);
        assert!(stats.cpu_percent.is_some_and(f64::is_finite));
        assert!(stats.device_utilization.is_none());
        assert!(stats.device_memory_used_gb.is_none());
    }

    #[test]
    fn test_round_to() {
        assert!((round_to(12.3456, 100.0) - 12.35).abs() < 1e-12);
        assert!((round_to(0.04, 10.0) - 0.0).abs() < 1e-12);
    }
}
