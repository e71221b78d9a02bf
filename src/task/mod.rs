// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod future;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::task::future::FutureShared;

/// Listener invoked for Event frames emitted by a running task and, when
/// std-stream surfacing is enabled, for captured worker output.
pub type EventListener = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Lifecycle of one task. Progresses only forward, with the single
/// exception of `Queued → Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Dispatched,
    AwaitingReply,
    CleaningUp,
    Done,
    Cancelled,
    Failed,
}

/// Per-call options accepted by `Pool::exec`.
#[derive(Default, Clone)]
pub struct ExecOptions {
    /// Scheduling priority; larger wins in the priority queue variant.
    pub priority: i32,
    /// Per-task execution timeout. The clock starts when the task leaves
    /// the queue, not at admission.
    pub timeout: Option<Duration>,
    /// Opaque caller metadata carried on the task.
    pub metadata: Option<serde_json::Value>,
    /// Prefer this handler index when it is idle.
    pub affinity: Option<usize>,
    /// Mark the payload as carrying transport-owned transferables.
    pub transferables: bool,
    /// Event listener for mid-task Event frames.
    pub on_event: Option<EventListener>,
}

impl std::fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOptions")
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("affinity", &self.affinity)
            .field("transferables", &self.transferables)
            .field("has_event_listener", &self.on_event.is_some())
            .finish()
    }
}

/// One admitted task. Owned by the pool while queued; co-owned by the pool
/// and the dispatching handler until a terminal state.
pub struct Task {
    pub task_id: u64,
    pub method: String,
    pub params: Bytes,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub timeout: Option<Duration>,
    pub metadata: Option<serde_json::Value>,
    pub affinity: Option<usize>,
    pub transferables: bool,
    pub on_event: Option<EventListener>,

    pub state: TaskState,
    pub handler_ref: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,

    /// Completion side of the caller's [`future::ResultFuture`].
    pub(crate) shared: Arc<FutureShared>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("method", &self.method)
            .field("params_len", &self.params.len())
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("handler_ref", &self.handler_ref)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        task_id: u64,
        method: impl Into<String>,
        params: Bytes,
        opts: ExecOptions,
        shared: Arc<FutureShared>,
    ) -> Self {
        Self {
            task_id,
            method: method.into(),
            params,
            priority: opts.priority,
            submitted_at: Utc::now(),
            timeout: opts.timeout,
            metadata: opts.metadata,
            affinity: opts.affinity,
            transferables: opts.transferables,
            on_event: opts.on_event,
            state: TaskState::Queued,
            handler_ref: None,
            started_at: None,
            shared,
        }
    }

    /// Queue memory accounting: method + params + a fixed bookkeeping cost.
    pub fn estimated_bytes(&self) -> usize {
        crate::utils::estimate_task_bytes(&self.method, &self.params)
    }

    /// True once `cancel()` fired while the task was still queued; the
    /// dispatch loop drops such tombstones instead of dispatching them.
    pub(crate) fn is_cancelled_in_queue(&self) -> bool {
        self.shared.is_settled()
    }
}
