// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use workerpool_rs::scaler::{AdaptiveScaler, LoadSample, ScaleAction, ScalerConfig};

fn cfg() -> ScalerConfig {
    ScalerConfig {
        window: 5,
        hysteresis: 0.6,
        cooldown_ms: 0,
        queue_depth_per_worker: 4.0,
        latency_threshold_ms: 1_000,
        utilization_high: 0.8,
        utilization_low: 0.2,
    }
}

fn overloaded() -> LoadSample {
    LoadSample {
        queue_depth: 20,
        busy_workers: 2,
        total_workers: 2,
        p95_latency: Duration::from_millis(10),
        avg_utilisation: 1.0,
    }
}

fn idle() -> LoadSample {
    LoadSample {
        queue_depth: 0,
        busy_workers: 0,
        total_workers: 4,
        p95_latency: Duration::ZERO,
        avg_utilisation: 0.0,
    }
}

fn steady() -> LoadSample {
    LoadSample {
        queue_depth: 1,
        busy_workers: 2,
        total_workers: 4,
        p95_latency: Duration::from_millis(50),
        avg_utilisation: 0.5,
    }
}

#[test]
fn test_scale_up_needs_hysteresis() {
    let mut scaler = AdaptiveScaler::new(cfg(), 1, 10);
    // ceil(5 * 0.6) = 3 consecutive samples required.
    assert_eq!(scaler.evaluate(overloaded()).action, ScaleAction::None);
    assert_eq!(scaler.evaluate(overloaded()).action, ScaleAction::None);
    let decision = scaler.evaluate(overloaded());
    assert_eq!(decision.action, ScaleAction::Up);
    assert!(decision.count >= 1 && decision.count <= 4);
    assert!(decision.confidence > 0.0 && decision.confidence <= 1.0);
}

#[test]
fn test_scale_up_bounded_by_four() {
    let mut scaler = AdaptiveScaler::new(cfg(), 1, 100);
    let mut sample = overloaded();
    sample.queue_depth = 10_000;
    for _ in 0..2 {
        let _ = scaler.evaluate(sample);
    }
    let decision = scaler.evaluate(sample);
    assert_eq!(decision.action, ScaleAction::Up);
    assert_eq!(decision.count, 4);
}

#[test]
fn test_scale_up_honours_max_workers() {
    let mut scaler = AdaptiveScaler::new(cfg(), 1, 2);
    for _ in 0..2 {
        let _ = scaler.evaluate(overloaded());
    }
    // total == max: no headroom.
    let decision = scaler.evaluate(overloaded());
    assert_eq!(decision.action, ScaleAction::None);
}

#[test]
fn test_scale_down_needs_all_conditions() {
    let mut scaler = AdaptiveScaler::new(cfg(), 1, 10);
    let mut sample = idle();
    sample.queue_depth = 1;
    for _ in 0..5 {
        // A non-empty queue vetoes the down direction.
        assert_eq!(scaler.evaluate(sample).action, ScaleAction::None);
    }
}

#[test]
fn test_scale_down_bounded_by_two_and_min_workers() {
    let mut scaler = AdaptiveScaler::new(cfg(), 1, 10);
    for _ in 0..2 {
        let _ = scaler.evaluate(idle());
    }
    let decision = scaler.evaluate(idle());
    assert_eq!(decision.action, ScaleAction::Down);
    assert_eq!(decision.count, 2);

    // At the floor, nothing to shrink.
    let mut scaler = AdaptiveScaler::new(cfg(), 4, 10);
    for _ in 0..2 {
        let _ = scaler.evaluate(idle());
    }
    assert_eq!(scaler.evaluate(idle()).action, ScaleAction::None);
}

#[test]
fn test_direction_change_resets_streak() {
    let mut scaler = AdaptiveScaler::new(cfg(), 1, 10);
    let _ = scaler.evaluate(overloaded());
    let _ = scaler.evaluate(overloaded());
    let _ = scaler.evaluate(steady());
    // Streak broken: two more ups are not enough.
    let _ = scaler.evaluate(overloaded());
    assert_eq!(scaler.evaluate(overloaded()).action, ScaleAction::None);
}

#[test]
fn test_cooldown_gates_successive_decisions() {
    let mut config = cfg();
    config.cooldown_ms = 60_000;
    let mut scaler = AdaptiveScaler::new(config, 1, 100);
    for _ in 0..2 {
        let _ = scaler.evaluate(overloaded());
    }
    assert_eq!(scaler.evaluate(overloaded()).action, ScaleAction::Up);
    // Same pressure immediately after: cooldown holds the line.
    for _ in 0..5 {
        assert_eq!(scaler.evaluate(overloaded()).action, ScaleAction::None);
    }
}
