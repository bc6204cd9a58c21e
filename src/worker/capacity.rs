//! Host load sampling for heartbeat capacity snapshots.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

/// CPU and memory utilisation, both within 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadSample {
    pub cpu_load: f64,
    pub memory_load: f64,
}

impl LoadSample {
    pub fn new(cpu_load: f64, memory_load: f64) -> Self {
        Self {
            cpu_load: cpu_load.clamp(0.0, 1.0),
            memory_load: memory_load.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
pub trait LoadProbe: Send + Sync + std::fmt::Debug {
    async fn sample(&self) -> LoadSample;
}

/// Reads host utilisation through sysinfo. CPU usage is a delta between
/// refreshes, so the first sample after startup reads as idle.
#[derive(Debug, Clone)]
pub struct SystemLoadProbe {
    system: Arc<Mutex<System>>,
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemLoadProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }

    fn read(system: &Mutex<System>) -> LoadSample {
        let mut sys = system.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = f64::from(sys.global_cpu_usage()) / 100.0;
        let total = sys.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / total as f64
        };
        LoadSample::new(cpu, memory)
    }
}

#[async_trait]
impl LoadProbe for SystemLoadProbe {
    async fn sample(&self) -> LoadSample {
        let system = self.system.clone();
        match tokio::task::spawn_blocking(move || Self::read(&system)).await {
            Ok(sample) => sample,
            Err(e) => {
                debug!(error = %e, "Load sampling task failed; reporting idle");
                LoadSample::default()
            }
        }
    }
}

/// Fixed load, adjustable at runtime
#[derive(Debug, Default)]
pub struct StaticLoadProbe {
    sample: Mutex<LoadSample>,
}

impl StaticLoadProbe {
    pub fn new(sample: LoadSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: LoadSample) {
        *self.sample.lock() = sample;
    }
}

#[async_trait]
impl LoadProbe for StaticLoadProbe {
    async fn sample(&self) -> LoadSample {
        *self.sample.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_clamped() {
        let sample = LoadSample::new(1.7, -0.2);
        assert_eq!(sample.cpu_load, 1.0);
        assert_eq!(sample.memory_load, 0.0);
    }

    #[tokio::test]
    async fn test_system_load_reports_fractions() {
        let sample = SystemLoadProbe::new().sample().await;
        assert!((0.0..=1.0).contains(&sample.cpu_load));
        assert!((0.0..=1.0).contains(&sample.memory_load));
    }

    #[tokio::test]
    async fn test_static_load_can_be_adjusted() {
        let load = StaticLoadProbe::new(LoadSample::new(0.1, 0.2));
        assert_eq!(load.sample().await.cpu_load, 0.1);
        load.set(LoadSample::new(0.9, 0.2));
        assert_eq!(load.sample().await.cpu_load, 0.9);
    }
}
