use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "restgym.yml";
pub const BASE_DIR_ENV: &str = "RESTGYM_BASE_DIR";
pub const MIN_DESIRED_RUNS: u32 = 1;
pub const MAX_DESIRED_RUNS: u32 = 20;

const GIB: u64 = 1024 * 1024 * 1024;

/// Tunables for one scheduler invocation. Every field has a default, so an
/// absent config file and an empty one behave the same.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GymConfig {
    pub image_prefix: String,
    pub results_dir: String,
    pub max_attempts: u32,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_probe_attempts: u32,
    pub port_probe_timeout_ms: u64,
    pub min_available_ram_bytes: u64,
    pub min_available_cpus: f64,
    pub gate_samples: u32,
    pub gate_sample_interval_secs: u64,
    pub gate_backoff_secs: u64,
    pub launch_stagger_secs: u64,
    pub warmup_secs: u64,
    pub failed_warmup_secs: u64,
    pub exerciser_settle_secs: u64,
    pub health_interval_secs: u64,
    pub health_checks: u32,
    pub flush_grace_secs: u64,
    pub retry_pause_secs: u64,
    pub container_memory: String,
    pub container_cpus: f64,
    pub target_container_port: u16,
    pub seed: Option<u64>,
}

impl Default for GymConfig {
    fn default() -> Self {
        Self {
            image_prefix: "restgym-".to_string(),
            results_dir: "results".to_string(),
            max_attempts: 5,
            port_range_start: 10_000,
            port_range_end: 60_000,
            port_probe_attempts: 1000,
            port_probe_timeout_ms: 250,
            min_available_ram_bytes: 32 * GIB,
            min_available_cpus: 14.0,
            gate_samples: 10,
            gate_sample_interval_secs: 1,
            gate_backoff_secs: 30,
            launch_stagger_secs: 60,
            warmup_secs: 45,
            failed_warmup_secs: 2,
            exerciser_settle_secs: 1,
            health_interval_secs: 60,
            health_checks: 60,
            flush_grace_secs: 5,
            retry_pause_secs: 2,
            container_memory: "16g".to_string(),
            container_cpus: 8.0,
            target_container_port: 9090,
            seed: None,
        }
    }
}

impl GymConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: GymConfig = if raw.trim().is_empty() {
            GymConfig::default()
        } else {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// An explicit path must exist; otherwise `<root>/restgym.yml` is used
    /// when present and defaults apply when it is not.
    pub fn load_for_root(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default_path = root.join(DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if self.port_range_start >= self.port_range_end {
            problems.push(format!(
                "port range {}..{} is empty",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.port_probe_attempts == 0 {
            problems.push("port_probe_attempts must be at least 1".to_string());
        }
        if self.gate_samples == 0 {
            problems.push("gate_samples must be at least 1".to_string());
        }
        if self.health_checks == 0 {
            problems.push("health_checks must be at least 1".to_string());
        }
        if !(self.container_cpus > 0.0) {
            problems.push("container_cpus must be positive".to_string());
        }
        if self.image_prefix.trim().is_empty() {
            problems.push("image_prefix must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid configuration: {}", problems.join("; ")))
        }
    }

    pub fn results_root(&self, root: &Path) -> PathBuf {
        root.join(&self.results_dir)
    }

    pub fn image_name(&self, id: &str) -> String {
        format!("{}{}", self.image_prefix, id)
    }

    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    pub fn port_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.port_probe_timeout_ms)
    }

    pub fn gate_sample_interval(&self) -> Duration {
        Duration::from_secs(self.gate_sample_interval_secs)
    }

    pub fn gate_backoff(&self) -> Duration {
        Duration::from_secs(self.gate_backoff_secs)
    }

    pub fn launch_stagger(&self) -> Duration {
        Duration::from_secs(self.launch_stagger_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn failed_warmup(&self) -> Duration {
        Duration::from_secs(self.failed_warmup_secs)
    }

    pub fn exerciser_settle(&self) -> Duration {
        Duration::from_secs(self.exerciser_settle_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn flush_grace(&self) -> Duration {
        Duration::from_secs(self.flush_grace_secs)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_secs(self.retry_pause_secs)
    }
}

/// Experiment root: explicit argument, then `$RESTGYM_BASE_DIR`, then the
/// current directory.
pub fn resolve_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let root = match explicit {
        Some(path) => path.to_path_buf(),
        None => match std::env::var_os(BASE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::current_dir()?,
        },
    };
    root.canonicalize()
        .with_context(|| format!("experiment root {} is not accessible", root.display()))
}

pub fn parse_desired_runs(input: &str) -> Result<u32> {
    let value: i64 = input
        .trim()
        .parse()
        .map_err(|_| anyhow!("Please specify a whole number."))?;
    if value < i64::from(MIN_DESIRED_RUNS) || value > i64::from(MAX_DESIRED_RUNS) {
        return Err(anyhow!(
            "Please specify a number in the range {}-{}.",
            MIN_DESIRED_RUNS,
            MAX_DESIRED_RUNS
        ));
    }
    Ok(value as u32)
}
