//! Host resource sampling: CPU, RAM, and NVIDIA accelerators when present.
//!
//! CPU and RAM come from `sysinfo` and are required; the sampler refuses to
//! start without them. Accelerator telemetry is best-effort and degrades to an
//! empty list. Sampling runs on its own task so a slow driver query never
//! stalls the reconciliation loop.

use std::time::{Duration, Instant};
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Utilization of one accelerator device.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorStats {
    pub index: u32,
    pub utilization_percent: f32,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

impl AcceleratorStats {
    pub fn memory_percent(&self) -> f32 {
        if self.memory_total_mib == 0 {
            return 0.0;
        }
        self.memory_used_mib as f32 / self.memory_total_mib as f32 * 100.0
    }
}

/// Point-in-time host load. Recreated every cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub accelerators: Vec<AcceleratorStats>,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("CPU/RAM statistics are not supported on this platform")]
    Unsupported,

    #[error("host reports no memory information")]
    NoMemoryInfo,

    #[error("accelerator query failed: {0}")]
    Accelerator(String),
}

/// Samples CPU and RAM usage, plus accelerators through the probe.
pub struct ResourceSampler {
    system: System,
    accelerators: AcceleratorProbe,
    cpu_refreshed_at: Instant,
}

impl ResourceSampler {
    /// Create a sampler. Fails when the host cannot report CPU/RAM at all,
    /// which is a fatal environment error at startup.
    pub fn new(accelerators: AcceleratorProbe) -> Result<Self, SamplerError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(SamplerError::Unsupported);
        }

        let mut system = System::new();
        system.refresh_memory();
        if system.total_memory() == 0 {
            return Err(SamplerError::NoMemoryInfo);
        }
        // CPU usage is a delta between two refreshes; prime the first one.
        system.refresh_cpu_usage();

        Ok(Self {
            system,
            accelerators,
            cpu_refreshed_at: Instant::now(),
        })
    }

    /// Take a fresh snapshot. Never fails; accelerator problems yield an empty list.
    pub async fn sample(&mut self) -> ResourceSnapshot {
        // Two CPU refreshes closer than this yield a meaningless delta.
        let since = self.cpu_refreshed_at.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since).await;
        }
        self.system.refresh_cpu_usage();
        self.cpu_refreshed_at = Instant::now();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_usage();
        let total = self.system.total_memory();
        let ram_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f32 / total as f32 * 100.0
        };

        let accelerators = match self.accelerators.query().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::debug!(error = %e, "accelerator telemetry unavailable");
                Vec::new()
            }
        };

        ResourceSnapshot {
            cpu_percent,
            ram_percent,
            accelerators,
        }
    }
}

/// Queries NVIDIA devices through `nvidia-smi`.
///
/// A missing binary disables the probe for the rest of the run so hosts
/// without a GPU do not pay for a failed spawn every cycle.
pub struct AcceleratorProbe {
    program: String,
    timeout: Duration,
    enabled: bool,
}

impl AcceleratorProbe {
    pub fn nvidia_smi() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            timeout: Duration::from_secs(2),
            enabled: true,
        }
    }

    /// A probe that never reports devices.
    pub fn disabled() -> Self {
        Self {
            program: String::new(),
            timeout: Duration::ZERO,
            enabled: false,
        }
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn query(&mut self) -> Result<Vec<AcceleratorStats>, SamplerError> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let run = Command::new(&self.program)
            .args([
                "--query-gpu=index,utilization.gpu,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Err(_) => return Err(SamplerError::Accelerator("query timed out".to_string())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(program = %self.program, "no accelerator tooling found, GPU stats disabled");
                self.enabled = false;
                return Ok(Vec::new());
            }
            Ok(Err(e)) => return Err(SamplerError::Accelerator(e.to_string())),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(SamplerError::Accelerator(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `index, util, used, total` CSV rows.
fn parse_nvidia_smi(text: &str) -> Result<Vec<AcceleratorStats>, SamplerError> {
    let mut stats = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [index, util, used, total] = *fields.as_slice() else {
            return Err(SamplerError::Accelerator(format!("unexpected row: {line}")));
        };
        let bad = |field: &str| SamplerError::Accelerator(format!("bad value {field:?} in {line:?}"));
        stats.push(AcceleratorStats {
            index: index.parse().map_err(|_| bad(index))?,
            utilization_percent: util.parse().map_err(|_| bad(util))?,
            memory_used_mib: used.parse().map_err(|_| bad(used))?,
            memory_total_mib: total.parse().map_err(|_| bad(total))?,
        });
    }
    Ok(stats)
}

/// Run the sampler on its own task, publishing the latest snapshot every `interval`.
///
/// The task ends when every receiver has been dropped.
pub fn spawn_sampling(
    mut sampler: ResourceSampler,
    interval: Duration,
) -> (watch::Receiver<ResourceSnapshot>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(ResourceSnapshot::default());

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = sampler.sample().await;
            if tx.send(snapshot).is_err() {
                tracing::debug!("resource sampling stopped, no readers left");
                break;
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi_rows() {
        let text = "0, 45, 1234, 8192\n1, 0, 3, 24576\n";
        let stats = parse_nvidia_smi(text).unwrap();
        assert_eq!(
            stats,
            vec![
                AcceleratorStats {
                    index: 0,
                    utilization_percent: 45.0,
                    memory_used_mib: 1234,
                    memory_total_mib: 8192,
                },
                AcceleratorStats {
                    index: 1,
                    utilization_percent: 0.0,
                    memory_used_mib: 3,
                    memory_total_mib: 24576,
                },
            ]
        );
    }

    #[test]
    fn test_parse_nvidia_smi_empty_output() {
        assert!(parse_nvidia_smi("").unwrap().is_empty());
        assert!(parse_nvidia_smi("\n  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_nvidia_smi_rejects_garbage() {
        assert!(parse_nvidia_smi("No devices were found").is_err());
        assert!(parse_nvidia_smi("0, [N/A], 10, 100").is_err());
    }

    #[test]
    fn test_memory_percent() {
        let gpu = AcceleratorStats {
            index: 0,
            utilization_percent: 10.0,
            memory_used_mib: 2048,
            memory_total_mib: 8192,
        };
        assert_eq!(gpu.memory_percent(), 25.0);

        let empty = AcceleratorStats {
            memory_total_mib: 0,
            ..gpu
        };
        assert_eq!(empty.memory_percent(), 0.0);
    }

    #[tokio::test]
    async fn test_missing_probe_binary_disables_probe() {
        let mut probe = AcceleratorProbe {
            program: "definitely-not-nvidia-smi-xyz".to_string(),
            timeout: Duration::from_secs(2),
            enabled: true,
        };
        assert!(probe.query().await.unwrap().is_empty());
        assert!(!probe.is_enabled());
    }

    #[tokio::test]
    async fn test_sample_reports_cpu_and_ram_without_accelerators() {
        let mut sampler = ResourceSampler::new(AcceleratorProbe::disabled()).unwrap();
        let snapshot = sampler.sample().await;
        assert!(snapshot.ram_percent > 0.0 && snapshot.ram_percent <= 100.0);
        assert!(snapshot.cpu_percent >= 0.0);
        assert!(snapshot.accelerators.is_empty());
    }

    #[tokio::test]
    async fn test_first_sample_waits_for_cpu_delta() {
        let mut sampler = ResourceSampler::new(AcceleratorProbe::disabled()).unwrap();
        let created = Instant::now();
        sampler.sample().await;
        assert!(created.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL.saturating_sub(Duration::from_millis(5)));

        // Spaced samples do not wait again.
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        let again = Instant::now();
        sampler.sample().await;
        assert!(again.elapsed() < MINIMUM_CPU_UPDATE_INTERVAL);
    }

    #[tokio::test]
    async fn test_spawn_sampling_publishes_snapshots() {
        let sampler = ResourceSampler::new(AcceleratorProbe::disabled()).unwrap();
        let (mut rx, handle) = spawn_sampling(sampler, Duration::from_millis(20));
        rx.changed().await.unwrap();
        assert!(rx.borrow().ram_percent > 0.0);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
