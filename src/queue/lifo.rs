// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{queue::TaskQueue, task::Task};

/// LIFO variant: a dynamic stack.
#[derive(Default)]
pub struct LifoQueue {
    stack: Vec<Task>,
}

impl LifoQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for LifoQueue {
    fn push(&mut self, task: Task) {
        self.stack.push(task);
    }

    fn pop(&mut self) -> Option<Task> {
        self.stack.pop()
    }

    fn len(&self) -> usize {
        self.stack.len()
    }

    fn contains(&self, task_id: u64) -> bool {
        self.stack.iter().any(|t| t.task_id == task_id)
    }

    fn clear(&mut self) {
        self.stack.clear();
    }
}
