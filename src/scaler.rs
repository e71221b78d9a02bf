// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Adaptive scaling: turns periodic load snapshots into bounded grow or
//! shrink decisions, with hysteresis and a cooldown so the pool never
//! thrashes around a threshold.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Scaling thresholds; the embedded defaults match the runtime's stock
/// tuning and every field can be overridden from the pool config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerConfig {
    /// Sliding window length, in samples.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Fraction of the window that must agree before a decision fires.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,
    /// Minimum gap between two decisions, in milliseconds.
    #[serde(rename = "cooldownPeriod", default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Scale up when `queue_depth / total_workers` exceeds this.
    #[serde(rename = "queueDepthPerWorker", default = "default_queue_depth_per_worker")]
    pub queue_depth_per_worker: f64,
    /// Scale up when the p95 latency exceeds this, in milliseconds.
    #[serde(rename = "latencyThreshold", default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    /// Scale up above this average utilisation.
    #[serde(rename = "utilizationHigh", default = "default_utilization_high")]
    pub utilization_high: f64,
    /// Scale down below this average utilisation.
    #[serde(rename = "utilizationLow", default = "default_utilization_low")]
    pub utilization_low: f64,
}

fn default_window() -> usize {
    5
}
fn default_hysteresis() -> f64 {
    0.6
}
fn default_cooldown_ms() -> u64 {
    10_000
}
fn default_queue_depth_per_worker() -> f64 {
    4.0
}
fn default_latency_threshold_ms() -> u64 {
    1_000
}
fn default_utilization_high() -> f64 {
    0.8
}
fn default_utilization_low() -> f64 {
    0.2
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            hysteresis: default_hysteresis(),
            cooldown_ms: default_cooldown_ms(),
            queue_depth_per_worker: default_queue_depth_per_worker(),
            latency_threshold_ms: default_latency_threshold_ms(),
            utilization_high: default_utilization_high(),
            utilization_low: default_utilization_low(),
        }
    }
}

/// One evaluation-tick snapshot of pool load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSample {
    pub queue_depth: usize,
    pub busy_workers: usize,
    pub total_workers: usize,
    pub p95_latency: Duration,
    pub avg_utilisation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    None,
    Up,
    Down,
}

/// The scaler's verdict for one tick.
#[derive(Debug, Clone)]
pub struct ScaleDecision {
    pub action: ScaleAction,
    pub count: usize,
    pub reason: String,
    /// Fraction of the window agreeing with the decision, in `[0, 1]`.
    pub confidence: f64,
}

impl ScaleDecision {
    fn none(reason: impl Into<String>) -> Self {
        Self {
            action: ScaleAction::None,
            count: 0,
            reason: reason.into(),
            confidence: 0.0,
        }
    }
}

const MAX_SCALE_UP: usize = 4;
const MAX_SCALE_DOWN: usize = 2;

pub struct AdaptiveScaler {
    cfg: ScalerConfig,
    min_workers: usize,
    max_workers: usize,
    window: VecDeque<ScaleAction>,
    last_decision_at: Option<Instant>,
}

impl AdaptiveScaler {
    pub fn new(cfg: ScalerConfig, min_workers: usize, max_workers: usize) -> Self {
        Self {
            cfg,
            min_workers,
            max_workers,
            window: VecDeque::new(),
            last_decision_at: None,
        }
    }

    /// Classify one sample in isolation: any up-trigger wins; down needs
    /// every down-condition at once.
    fn classify(&self, s: &LoadSample) -> (ScaleAction, &'static str) {
        let workers = s.total_workers.max(1) as f64;
        if s.queue_depth as f64 / workers > self.cfg.queue_depth_per_worker {
            return (ScaleAction::Up, "queue depth per worker over threshold");
        }
        if s.p95_latency > Duration::from_millis(self.cfg.latency_threshold_ms) {
            return (ScaleAction::Up, "p95 latency over threshold");
        }
        if s.avg_utilisation > self.cfg.utilization_high {
            return (ScaleAction::Up, "utilisation high");
        }
        if s.total_workers > 0
            && s.busy_workers == s.total_workers
            && s.queue_depth > 0
        {
            return (ScaleAction::Up, "all workers busy with queue backlog");
        }
        if s.queue_depth == 0
            && s.avg_utilisation < self.cfg.utilization_low
            && s.busy_workers < s.total_workers
        {
            return (ScaleAction::Down, "idle workers with empty queue");
        }
        (ScaleAction::None, "steady")
    }

    /// Feed one snapshot and get the verdict for this tick.
    pub fn evaluate(&mut self, sample: LoadSample) -> ScaleDecision {
        let (direction, reason) = self.classify(&sample);

        if self.window.len() >= self.cfg.window.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(direction);

        if direction == ScaleAction::None {
            return ScaleDecision::none("steady");
        }

        // Hysteresis: the decision needs enough consecutive same-direction
        // samples at the tail of the window.
        let needed =
            ((self.cfg.window.max(1) as f64) * self.cfg.hysteresis).ceil() as usize;
        let consecutive = self
            .window
            .iter()
            .rev()
            .take_while(|a| **a == direction)
            .count();
        if consecutive < needed.max(1) {
            return ScaleDecision::none(format!(
                "hysteresis: {consecutive}/{needed} samples"
            ));
        }

        if let Some(at) = self.last_decision_at
            && at.elapsed() < Duration::from_millis(self.cfg.cooldown_ms)
        {
            return ScaleDecision::none("cooldown");
        }

        let agreeing = self.window.iter().filter(|a| **a == direction).count();
        let confidence = agreeing as f64 / self.window.len().max(1) as f64;

        let decision = match direction {
            ScaleAction::Up => {
                let headroom = self.max_workers.saturating_sub(sample.total_workers);
                if headroom == 0 {
                    return ScaleDecision::none("at max workers");
                }
                let wanted = (sample.queue_depth as f64
                    / self.cfg.queue_depth_per_worker)
                    .ceil() as usize;
                let count = wanted.clamp(1, MAX_SCALE_UP).min(headroom);
                ScaleDecision {
                    action: ScaleAction::Up,
                    count,
                    reason: reason.to_owned(),
                    confidence,
                }
            },
            ScaleAction::Down => {
                let shrinkable = sample.total_workers.saturating_sub(self.min_workers);
                if shrinkable == 0 {
                    return ScaleDecision::none("at min workers");
                }
                let idle = sample.total_workers.saturating_sub(sample.busy_workers);
                let count = idle.clamp(1, MAX_SCALE_DOWN).min(shrinkable);
                ScaleDecision {
                    action: ScaleAction::Down,
                    count,
                    reason: reason.to_owned(),
                    confidence,
                }
            },
            ScaleAction::None => unreachable!("handled above"),
        };

        debug!(
            action = ?decision.action,
            count = decision.count,
            confidence = decision.confidence,
            "scale decision: {}",
            decision.reason
        );
        self.last_decision_at = Some(Instant::now());
        self.window.clear();
        decision
    }
}
