// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use workerpool_rs::cfg::{
    config::{MinWorkers, PoolConfig},
    enums::{ChoiceStrategy, MemoryPressurePolicy, QueueStrategy, WorkerType},
};

#[test]
fn test_defaults_validate() -> Result<()> {
    let mut cfg = PoolConfig::default();
    cfg.validate_and_normalize()?;
    assert!(cfg.max_workers >= 1);
    assert_eq!(cfg.resolved_min_workers(), 0);
    assert_eq!(cfg.worker_type, WorkerType::Auto);
    assert_eq!(cfg.queue_strategy, QueueStrategy::Fifo);
    assert_eq!(cfg.worker_terminate_timeout, Duration::from_secs(5));
    assert!(cfg.max_queue_size.is_none());
    Ok(())
}

#[test]
fn test_yaml_wire_keys() -> Result<()> {
    let yaml = r#"
minWorkers: 2
maxWorkers: 8
maxQueueSize: 100
workerType: thread
queueStrategy: priority
choiceStrategy: least-busy
workerTerminateTimeout: 2500
emitStdStreams: true
debugPortStart: 9229
enableMetrics: true
metricsInterval: 1000
maxQueueMemory: 1048576
onMemoryPressure: drop-oldest
circuitBreaker:
  enabled: true
  threshold: 0.4
  resetTimeout: 15000
  volumeThreshold: 20
sharedMemory:
  enabled: true
  slotSize: 2048
  slotCount: 32
"#;
    let mut cfg: PoolConfig = serde_yaml::from_str(yaml)?;
    cfg.validate_and_normalize()?;

    assert_eq!(cfg.resolved_min_workers(), 2);
    assert_eq!(cfg.max_workers, 8);
    assert_eq!(cfg.max_queue_size, Some(100));
    assert_eq!(cfg.worker_type, WorkerType::Thread);
    assert_eq!(cfg.queue_strategy, QueueStrategy::Priority);
    assert_eq!(cfg.choice_strategy, ChoiceStrategy::LeastBusy);
    assert_eq!(cfg.worker_terminate_timeout, Duration::from_millis(2500));
    assert!(cfg.emit_std_streams);
    assert_eq!(cfg.debug_port_start, Some(9229));
    assert_eq!(cfg.metrics_interval, Duration::from_secs(1));
    assert_eq!(cfg.max_queue_memory, Some(1_048_576));
    assert_eq!(cfg.on_memory_pressure, MemoryPressurePolicy::DropOldest);
    assert!(cfg.circuit_breaker.enabled);
    assert_eq!(cfg.circuit_breaker.reset_timeout, Duration::from_secs(15));
    assert_eq!(cfg.circuit_breaker.volume_threshold, 20);
    assert!(cfg.shared_memory.enabled);
    assert_eq!(cfg.shared_memory.slot_size, 2048);
    Ok(())
}

#[test]
fn test_min_workers_max_keyword() -> Result<()> {
    let yaml = "minWorkers: max\nmaxWorkers: 6\n";
    let mut cfg: PoolConfig = serde_yaml::from_str(yaml)?;
    cfg.validate_and_normalize()?;
    assert!(matches!(cfg.min_workers, MinWorkers::Keyword(_)));
    assert_eq!(cfg.resolved_min_workers(), 6);
    Ok(())
}

#[test]
fn test_min_workers_bad_keyword_rejected() {
    let yaml = "minWorkers: most\nmaxWorkers: 6\n";
    let mut cfg: PoolConfig = serde_yaml::from_str(yaml).expect("parses as keyword");
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn test_min_over_max_rejected() {
    let mut cfg = PoolConfig {
        min_workers: MinWorkers::Count(9),
        max_workers: 4,
        ..PoolConfig::default()
    };
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn test_zero_weight_rejected() {
    let mut cfg = PoolConfig {
        worker_weights: vec![2, 0, 1],
        ..PoolConfig::default()
    };
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn test_degenerate_slot_size_rejected() {
    let mut cfg = PoolConfig::default();
    cfg.shared_memory.enabled = true;
    cfg.shared_memory.slot_size = 12;
    assert!(cfg.validate_and_normalize().is_err());
}
