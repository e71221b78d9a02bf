// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::strategy::{HandlerView, WorkerChoiceStrategy};

/// Cycle through non-busy handlers by index; when all are busy, return the
/// next index anyway so the caller can queue behind it.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerChoiceStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn init_handler(&mut self, _index: usize, _view: &HandlerView) {}

    fn choose(&mut self, handlers: &[HandlerView]) -> Option<usize> {
        if handlers.is_empty() {
            return None;
        }
        let n = handlers.len();
        for step in 0..n {
            let idx = (self.next + step) % n;
            let view = &handlers[idx];
            if view.accepting && !view.busy {
                self.next = (idx + 1) % n;
                return Some(idx);
            }
        }
        let idx = self.next % n;
        self.next = (idx + 1) % n;
        handlers[idx].accepting.then_some(idx)
    }
}
