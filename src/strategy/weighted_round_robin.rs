// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::strategy::{HandlerView, WorkerChoiceStrategy};

/// Cycle according to per-handler integer weights: handler `i` is served
/// `weight_i` times per cycle, in runs. Over many selections the
/// distribution converges to `weight_i / Σ weight`. Zero weights are
/// rejected at configuration time.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    weights: Vec<u32>,
    default_weight: u32,
    current: usize,
    served_in_run: u32,
}

impl WeightedRoundRobin {
    pub fn new(weights: Vec<u32>, default_weight: u32) -> Self {
        Self {
            weights,
            default_weight: default_weight.max(1),
            current: 0,
            served_in_run: 0,
        }
    }

    fn weight(&self, index: usize) -> u32 {
        self.weights
            .get(index)
            .copied()
            .unwrap_or(self.default_weight)
            .max(1)
    }
}

impl WorkerChoiceStrategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }

    fn init_handler(&mut self, index: usize, _view: &HandlerView) {
        if self.weights.len() <= index {
            let w = self.default_weight;
            self.weights.resize(index + 1, w);
        }
    }

    fn choose(&mut self, handlers: &[HandlerView]) -> Option<usize> {
        if handlers.is_empty() {
            return None;
        }
        let n = handlers.len();
        // One full sweep: finish the current run, or move on when the run
        // is exhausted or the handler is unavailable.
        for _ in 0..n {
            let idx = self.current % n;
            if self.served_in_run >= self.weight(idx) {
                self.current = (idx + 1) % n;
                self.served_in_run = 0;
                continue;
            }
            let view = &handlers[idx];
            if view.accepting && !view.busy {
                self.served_in_run += 1;
                return Some(idx);
            }
            self.current = (idx + 1) % n;
            self.served_in_run = 0;
        }
        handlers
            .iter()
            .find(|v| v.accepting)
            .map(|v| v.index)
    }
}
