// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::enums::{ChoiceStrategy, MemoryPressurePolicy, QueueStrategy, WorkerType},
    scaler::ScalerConfig,
    shm::channel::SLOT_OVERHEAD,
};

/// `minWorkers: int | "max"` — `"max"` resolves to `maxWorkers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MinWorkers {
    Count(usize),
    Keyword(String),
}

impl Default for MinWorkers {
    fn default() -> Self {
        Self::Count(0)
    }
}

impl MinWorkers {
    pub fn resolve(&self, max_workers: usize) -> usize {
        match self {
            Self::Count(n) => *n,
            Self::Keyword(_) => max_workers,
        }
    }
}

/// Fault-tolerance wrapper around dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Failure ratio that opens the circuit.
    #[serde(default = "default_cb_threshold")]
    pub threshold: f64,
    #[serde(rename = "resetTimeout", default = "default_cb_reset", with = "serde_millis")]
    pub reset_timeout: Duration,
    /// Minimum observed calls before the threshold is evaluated.
    #[serde(rename = "volumeThreshold", default = "default_cb_volume")]
    pub volume_threshold: u32,
}

fn default_cb_threshold() -> f64 {
    0.5
}
fn default_cb_reset() -> Duration {
    Duration::from_secs(30)
}
fn default_cb_volume() -> u32 {
    10
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_cb_threshold(),
            reset_timeout: default_cb_reset(),
            volume_threshold: default_cb_volume(),
        }
    }
}

/// Shared-memory fast-path geometry; disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedMemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "slotSize", default = "default_slot_size")]
    pub slot_size: u32,
    #[serde(rename = "slotCount", default = "default_slot_count")]
    pub slot_count: u32,
}

fn default_slot_size() -> u32 {
    4096
}
fn default_slot_count() -> u32 {
    64
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slot_size: default_slot_size(),
            slot_count: default_slot_count(),
        }
    }
}

/// Pool construction options. Key names match the ones the runtime has
/// always published, hence the camelCase renames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(rename = "minWorkers", default)]
    pub min_workers: MinWorkers,

    /// Hard ceiling on handlers; defaults to `cpu_count - 1`.
    #[serde(rename = "maxWorkers", default = "default_max_workers")]
    pub max_workers: usize,

    /// Hard queue ceiling; unbounded when absent.
    #[serde(rename = "maxQueueSize", default)]
    pub max_queue_size: Option<usize>,

    #[serde(rename = "workerType", default)]
    pub worker_type: WorkerType,

    #[serde(rename = "queueStrategy", default)]
    pub queue_strategy: QueueStrategy,

    #[serde(rename = "choiceStrategy", default)]
    pub choice_strategy: ChoiceStrategy,

    /// Per-handler weights for the weighted strategies. Zero is invalid.
    #[serde(rename = "workerWeights", default)]
    pub worker_weights: Vec<u32>,

    #[serde(rename = "defaultWeight", default = "default_weight")]
    pub default_weight: u32,

    /// Max time to await a graceful worker exit (and the cleanup reply)
    /// before force-kill.
    #[serde(
        rename = "workerTerminateTimeout",
        default = "default_terminate_timeout",
        with = "serde_millis"
    )]
    pub worker_terminate_timeout: Duration,

    /// Budget for worker abort listeners during cleanup.
    #[serde(
        rename = "abortListenerTimeout",
        default = "default_abort_listener_timeout",
        with = "serde_millis"
    )]
    pub abort_listener_timeout: Duration,

    /// Ask the transport to surface stdout/stderr as Event frames.
    #[serde(rename = "emitStdStreams", default)]
    pub emit_std_streams: bool,

    /// Base for per-worker debug ports; smallest unused integer >= base.
    #[serde(rename = "debugPortStart", default)]
    pub debug_port_start: Option<u16>,

    #[serde(rename = "circuitBreaker", default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(rename = "enableMetrics", default)]
    pub enable_metrics: bool,

    #[serde(
        rename = "metricsInterval",
        default = "default_metrics_interval",
        with = "serde_millis"
    )]
    pub metrics_interval: Duration,

    /// Cumulative queued-payload ceiling in bytes; unbounded when absent.
    #[serde(rename = "maxQueueMemory", default)]
    pub max_queue_memory: Option<u64>,

    #[serde(rename = "onMemoryPressure", default)]
    pub on_memory_pressure: MemoryPressurePolicy,

    #[serde(default)]
    pub scaling: ScalerConfig,

    #[serde(rename = "sharedMemory", default)]
    pub shared_memory: SharedMemoryConfig,

    /// Worker script identifier, carried into spawn options and crash
    /// diagnostics.
    #[serde(default)]
    pub script: Option<String>,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_weight() -> u32 {
    1
}

fn default_terminate_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_abort_listener_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: MinWorkers::default(),
            max_workers: default_max_workers(),
            max_queue_size: None,
            worker_type: WorkerType::default(),
            queue_strategy: QueueStrategy::default(),
            choice_strategy: ChoiceStrategy::default(),
            worker_weights: Vec::new(),
            default_weight: default_weight(),
            worker_terminate_timeout: default_terminate_timeout(),
            abort_listener_timeout: default_abort_listener_timeout(),
            emit_std_streams: false,
            debug_port_start: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            enable_metrics: false,
            metrics_interval: default_metrics_interval(),
            max_queue_memory: None,
            on_memory_pressure: MemoryPressurePolicy::default(),
            scaling: ScalerConfig::default(),
            shared_memory: SharedMemoryConfig::default(),
            script: None,
        }
    }
}

impl PoolConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: PoolConfig =
            serde_yaml::from_str(&s).context("failed to parse pool config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.max_workers >= 1, "maxWorkers must be >= 1");
        let min = self.min_workers.resolve(self.max_workers);
        ensure!(
            min <= self.max_workers,
            "minWorkers ({min}) must not exceed maxWorkers ({})",
            self.max_workers
        );
        if let MinWorkers::Keyword(kw) = &self.min_workers {
            ensure!(kw == "max", "minWorkers keyword must be \"max\", got {kw:?}");
        }

        // Zero weights would starve a handler forever.
        ensure!(
            self.worker_weights.iter().all(|w| *w > 0),
            "workerWeights must be positive"
        );
        ensure!(self.default_weight > 0, "defaultWeight must be positive");

        if let Some(m) = self.max_queue_size {
            ensure!(m >= 1, "maxQueueSize must be >= 1 when set");
        }

        if self.shared_memory.enabled {
            ensure!(
                self.shared_memory.slot_size as usize > SLOT_OVERHEAD + 8,
                "sharedMemory.slotSize must exceed slot overhead"
            );
            ensure!(
                self.shared_memory.slot_count >= 2,
                "sharedMemory.slotCount must be >= 2"
            );
        }

        ensure!(
            self.scaling.window >= 1,
            "scaling.window must be >= 1"
        );
        ensure!(
            (0.0..=1.0).contains(&self.scaling.hysteresis),
            "scaling.hysteresis must be within [0, 1]"
        );

        Ok(())
    }

    pub fn resolved_min_workers(&self) -> usize {
        self.min_workers.resolve(self.max_workers)
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
pub mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
