// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::strategy::{HandlerView, WorkerChoiceStrategy};

/// Pick the handler with the smallest active-task count; ties break by
/// lowest index.
#[derive(Debug, Default)]
pub struct LeastBusy;

impl LeastBusy {
    pub fn new() -> Self {
        Self
    }
}

impl WorkerChoiceStrategy for LeastBusy {
    fn name(&self) -> &'static str {
        "least-busy"
    }

    fn init_handler(&mut self, _index: usize, _view: &HandlerView) {}

    fn choose(&mut self, handlers: &[HandlerView]) -> Option<usize> {
        handlers
            .iter()
            .filter(|v| v.accepting)
            .min_by_key(|v| (v.active, v.index))
            .map(|v| v.index)
    }
}
