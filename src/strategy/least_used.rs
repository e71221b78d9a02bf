// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::strategy::{HandlerView, WorkerChoiceStrategy};

/// Pick the handler with the fewest completed tasks since this strategy
/// first saw it. The baseline per index is private state, so switching to
/// this strategy at runtime starts every handler from zero.
#[derive(Debug, Default)]
pub struct LeastUsed {
    baseline: Vec<u64>,
}

impl LeastUsed {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerChoiceStrategy for LeastUsed {
    fn name(&self) -> &'static str {
        "least-used"
    }

    fn init_handler(&mut self, index: usize, view: &HandlerView) {
        if self.baseline.len() <= index {
            self.baseline.resize(index + 1, 0);
        }
        self.baseline[index] = view.completed;
    }

    fn choose(&mut self, handlers: &[HandlerView]) -> Option<usize> {
        handlers
            .iter()
            .filter(|v| v.accepting)
            .min_by_key(|v| {
                let base = self.baseline.get(v.index).copied().unwrap_or(0);
                (v.completed.saturating_sub(base), v.index)
            })
            .map(|v| v.index)
    }
}
