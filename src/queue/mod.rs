// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod fifo;
pub mod lifo;
pub mod priority;
pub mod shared_ring;

use enum_dispatch::enum_dispatch;

use crate::{
    queue::{
        fifo::FifoQueue,
        lifo::LifoQueue,
        priority::{CustomQueue, PriorityQueue},
    },
    task::Task,
};

/// Uniform contract over every in-memory queue variant.
///
/// A task is present iff exactly one `push` has occurred with no subsequent
/// `pop` or `clear`; `pop` on an empty queue returns `None` without
/// blocking; `len` equals the number of live tasks.
#[enum_dispatch]
pub trait TaskQueue {
    /// Append a task.
    fn push(&mut self, task: Task);

    /// Remove and return the next task per the variant's discipline.
    fn pop(&mut self) -> Option<Task>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, task_id: u64) -> bool;

    fn clear(&mut self);
}

/// The queue variants selectable at pool construction.
#[enum_dispatch(TaskQueue)]
pub enum QueueImpl {
    Fifo(FifoQueue),
    Lifo(LifoQueue),
    Priority(PriorityQueue),
    Custom(CustomQueue),
}

impl std::fmt::Debug for QueueImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, len) = match self {
            Self::Fifo(q) => ("Fifo", q.len()),
            Self::Lifo(q) => ("Lifo", q.len()),
            Self::Priority(q) => ("Priority", q.len()),
            Self::Custom(q) => ("Custom", q.len()),
        };
        write!(f, "QueueImpl::{name}(len={len})")
    }
}
