// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::cfg::config::CircuitBreakerConfig;

/// Circuit position. Closed admits, Open rejects, HalfOpen admits probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    total: u32,
    opened_at: Option<Instant>,
}

/// Failure-ratio circuit breaker over task outcomes. Below the volume
/// threshold the ratio is not evaluated; after `reset_timeout` an open
/// circuit lets one probe through.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: f64,
    reset_timeout: Duration,
    volume_threshold: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            reset_timeout: cfg.reset_timeout,
            volume_threshold: cfg.volume_threshold.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                total: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Whether admission may proceed right now.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let reset = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if reset {
                    info!("circuit breaker half-open, admitting a probe");
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            },
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total = inner.total.saturating_add(1);
        if inner.state == CircuitState::HalfOpen {
            info!("circuit breaker closing after successful probe");
            inner.state = CircuitState::Closed;
            inner.failures = 0;
            inner.total = 0;
            inner.opened_at = None;
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total = inner.total.saturating_add(1);
        inner.failures = inner.failures.saturating_add(1);

        if inner.state == CircuitState::HalfOpen {
            warn!("circuit breaker re-opening after failed probe");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }

        if inner.state == CircuitState::Closed
            && inner.total >= self.volume_threshold
            && f64::from(inner.failures) / f64::from(inner.total) >= self.threshold
        {
            warn!(
                failures = inner.failures,
                total = inner.total,
                "circuit breaker opening"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}
