// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::strategy::{HandlerView, WorkerChoiceStrategy};

/// Interleaved weighted round-robin: selections follow the classic IWRR
/// rounds — in round `r` every handler with `weight >= r` is served once —
/// so the weighted distribution emerges interleaved instead of in runs.
#[derive(Debug)]
pub struct InterleavedWeightedRoundRobin {
    weights: Vec<u32>,
    default_weight: u32,
    round: u32,
    position: usize,
}

impl InterleavedWeightedRoundRobin {
    pub fn new(weights: Vec<u32>, default_weight: u32) -> Self {
        Self {
            weights,
            default_weight: default_weight.max(1),
            round: 1,
            position: 0,
        }
    }

    fn weight(&self, index: usize) -> u32 {
        self.weights
            .get(index)
            .copied()
            .unwrap_or(self.default_weight)
            .max(1)
    }

    fn max_weight(&self, n: usize) -> u32 {
        (0..n).map(|i| self.weight(i)).max().unwrap_or(1)
    }
}

impl WorkerChoiceStrategy for InterleavedWeightedRoundRobin {
    fn name(&self) -> &'static str {
        "interleaved-weighted-round-robin"
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
        let max_weight = self.max_weight(n);
        // Bounded walk over (round, position) pairs: one full cycle visits
        // every handler once per round it participates in.
        for _ in 0..n as u32 * max_weight {
            if self.position >= n {
                self.position = 0;
                self.round = if self.round >= max_weight {
                    1
                } else {
                    self.round + 1
                };
            }
            let idx = self.position;
            self.position += 1;

            if self.weight(idx) < self.round {
                continue;
            }
            let view = &handlers[idx];
            if view.accepting && !view.busy {
                return Some(idx);
            }
        }
        handlers
            .iter()
            .find(|v| v.accepting)
            .map(|v| v.index)
    }
}
