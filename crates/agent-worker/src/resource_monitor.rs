// Resource monitor backed by `sysinfo`: samples global CPU and memory usage
// until the run ends.

use agent_common::{ChartPoint, ResourceUtilization};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{MonitorResult, ResourceMonitor};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

pub struct SysinfoResourceMonitor {
    interval: Duration,
}

impl SysinfoResourceMonitor {
    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for SysinfoResourceMonitor {
    fn default() -> Self {
        Self::with_interval(SAMPLE_INTERVAL)
    }
}

impl ResourceMonitor for SysinfoResourceMonitor {
    fn start(&self, cancel: CancellationToken) -> oneshot::Receiver<MonitorResult> {
        let (tx, rx) = oneshot::channel();
        let interval = self.interval;
        tokio::spawn(async move {
            let result = sample_until_cancelled(interval, cancel).await;
            let _ = tx.send(result);
        });
        rx
    }
}

async fn sample_until_cancelled(interval: Duration, cancel: CancellationToken) -> MonitorResult {
    let mut system = System::new();
    let started = Instant::now();
    let mut utilization = ResourceUtilization::default();
    let mut errors = Vec::new();

    system.refresh_memory();
    system.refresh_cpu_usage();
    utilization.memory_total = system.total_memory();
    utilization.cpu_total = system.cpus().len() as f64;
    if system.cpus().is_empty() {
        errors.push("no CPU information available".to_string());
    }

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and only primes CPU counters.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        system.refresh_cpu_usage();
        system.refresh_memory();
        let seconds_from_start = started.elapsed().as_secs_f64();
        let cpus_used = f64::from(system.global_cpu_usage()) / 100.0 * utilization.cpu_total;
        utilization.cpu_chart.push(ChartPoint {
            seconds_from_start,
            value: cpus_used,
        });
        utilization.memory_chart.push(ChartPoint {
            seconds_from_start,
            value: system.used_memory() as f64,
        });
    }

    MonitorResult {
        utilization: Some(utilization),
        errors,
    }
}
