use std::thread;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, info};

use crate::config::GymConfig;

/// One instantaneous read of host headroom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub available_ram_bytes: u64,
    pub available_cpus: f64,
}

pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceSnapshot;
}

/// Host probe backed by `sysinfo`. Available CPUs are the core count scaled
/// by the idle fraction since the previous sample.
pub struct SystemProbe {
    sys: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        // CPU usage is a delta between two refreshes.
        thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu();
        Self { sys }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> ResourceSnapshot {
        self.sys.refresh_memory();
        self.sys.refresh_cpu();
        let cores = self.sys.cpus().len() as f64;
        let used = f64::from(self.sys.global_cpu_info().cpu_usage()) / 100.0;
        ResourceSnapshot {
            available_ram_bytes: self.sys.available_memory(),
            available_cpus: (1.0 - used).clamp(0.0, 1.0) * cores,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceFloors {
    pub min_ram_bytes: u64,
    pub min_cpus: f64,
}

impl ResourceFloors {
    pub fn from_config(config: &GymConfig) -> Self {
        Self {
            min_ram_bytes: config.min_available_ram_bytes,
            min_cpus: config.min_available_cpus,
        }
    }

    pub fn passes(&self, snapshot: &ResourceSnapshot) -> bool {
        snapshot.available_ram_bytes > self.min_ram_bytes
            && snapshot.available_cpus > self.min_cpus
    }
}

/// Admission policy for new runs. A call admits only after a full window of
/// consecutive passing samples; the first failing sample ends the call.
/// Nothing is remembered between calls.
pub struct ResourceGate {
    probe: Box<dyn ResourceProbe>,
    floors: ResourceFloors,
    samples: u32,
    interval: Duration,
}

impl ResourceGate {
    pub fn new(
        probe: Box<dyn ResourceProbe>,
        floors: ResourceFloors,
        samples: u32,
        interval: Duration,
    ) -> Self {
        Self {
            probe,
            floors,
            samples,
            interval,
        }
    }

    pub fn from_config(probe: Box<dyn ResourceProbe>, config: &GymConfig) -> Self {
        Self::new(
            probe,
            ResourceFloors::from_config(config),
            config.gate_samples,
            config.gate_sample_interval(),
        )
    }

    pub fn admit(&mut self) -> bool {
        for i in 0..self.samples {
            if i > 0 {
                thread::sleep(self.interval);
            }
            let snapshot = self.probe.sample();
            if !self.floors.passes(&snapshot) {
                debug!(
                    sample = i + 1,
                    available_ram_bytes = snapshot.available_ram_bytes,
                    available_cpus = snapshot.available_cpus,
                    "resource floor not met"
                );
                return false;
            }
        }
        info!(samples = self.samples, "resources available, admitting run");
        true
    }
}
