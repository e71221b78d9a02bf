// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::strategy::{HandlerView, WorkerChoiceStrategy};

/// Equalise cumulative busy time, weighted by current active count: the
/// score of a handler is its busy time since the strategy first saw it,
/// scaled up by `active + 1`, and the lowest score wins.
#[derive(Debug, Default)]
pub struct FairShare {
    baseline_ns: Vec<u64>,
}

impl FairShare {
    pub fn new() -> Self {
        Self::default()
    }

    fn score(&self, view: &HandlerView) -> u128 {
        let base = self.baseline_ns.get(view.index).copied().unwrap_or(0);
        let busy = u128::from(view.busy_time_ns.saturating_sub(base));
        busy * (view.active as u128 + 1)
    }
}

impl WorkerChoiceStrategy for FairShare {
    fn name(&self) -> &'static str {
        "fair-share"
    }

    fn init_handler(&mut self, index: usize, view: &HandlerView) {
        if self.baseline_ns.len() <= index {
            self.baseline_ns.resize(index + 1, 0);
        }
        self.baseline_ns[index] = view.busy_time_ns;
    }

    fn choose(&mut self, handlers: &[HandlerView]) -> Option<usize> {
        handlers
            .iter()
            .filter(|v| v.accepting)
            .min_by_key(|v| (self.score(v), v.index))
            .map(|v| v.index)
    }
}
