// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc};

use crate::{queue::TaskQueue, task::Task};

/// Key extractor for the custom variant; larger keys pop first.
pub type PriorityKeyFn = Arc<dyn Fn(&Task) -> i64 + Send + Sync>;

struct Entry {
    key: i64,
    task_id: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.task_id == other.task_id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on key; ties break by submission order, so the smaller
        // task id must compare greater.
        self.key
            .cmp(&other.key)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

/// Binary max-heap keyed by `(priority, -task_id)`: higher priority wins
/// and same-priority pops in FIFO submission order.
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for PriorityQueue {
    fn push(&mut self, task: Task) {
        self.heap.push(Entry {
            key: i64::from(task.priority),
            task_id: task.task_id,
            task,
        });
    }

    fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|e| e.task)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn contains(&self, task_id: u64) -> bool {
        self.heap.iter().any(|e| e.task_id == task_id)
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Priority queue with a caller-supplied key function, for orderings that
/// live in task metadata rather than the priority field.
pub struct CustomQueue {
    heap: BinaryHeap<Entry>,
    key_fn: PriorityKeyFn,
}

impl CustomQueue {
    pub fn new(key_fn: PriorityKeyFn) -> Self {
        Self {
            heap: BinaryHeap::new(),
            key_fn,
        }
    }
}

impl TaskQueue for CustomQueue {
    fn push(&mut self, task: Task) {
        self.heap.push(Entry {
            key: (self.key_fn)(&task),
            task_id: task.task_id,
            task,
        });
    }

    fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|e| e.task)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn contains(&self, task_id: u64) -> bool {
        self.heap.iter().any(|e| e.task_id == task_id)
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}
