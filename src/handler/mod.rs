// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The in-pool object owning a single worker transport: correlates
//! in-flight requests by id, runs the cleanup handshake, and reaps the
//! worker on termination or crash.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ErrorKind, ExitDetail, PoolError},
    frame::{
        READY_SIGNAL,
        codec::{Frame, FrameBuilder},
        header::FrameFlags,
        msg_type::MsgType,
        payload::{HeartbeatResBody, TaskErrorBody, TaskRequestBody},
    },
    task::{EventListener, Task, future::FutureShared},
    transport::{SpawnedWorker, Transport, TransportEvent},
};

/// Handler lifecycle. Forward-only, except `cleaning → ready` after a
/// successful cleanup reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Cold,
    Warming,
    Ready,
    Busy,
    Cleaning,
    Terminating,
    Terminated,
}

/// Notifications the handler pushes to the pool's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// Admission queued a task; run a dispatch step.
    Dispatch,
    /// A future settled (any way); the handler may be free again.
    TaskSettled {
        handler_id: usize,
        latency_ns: u64,
        failed: bool,
    },
    /// The worker announced readiness; queued frames were flushed.
    WorkerReady { handler_id: usize },
    /// The worker is gone; the handler must be reaped.
    WorkerExited { handler_id: usize },
}

#[derive(Debug, Default)]
pub struct HandlerStats {
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub busy_time_ns: AtomicU64,
}

struct InFlight {
    task_id: u64,
    shared: Arc<FutureShared>,
    on_event: Option<EventListener>,
    started: Instant,
}

struct CleanupRecord {
    original: PoolError,
    shared: Arc<FutureShared>,
}

pub struct WorkerHandler {
    pub handler_id: usize,
    transport: Arc<dyn Transport>,
    state: Mutex<HandlerState>,

    in_flight: DashMap<u32, InFlight>,
    tracking: DashMap<u32, CleanupRecord>,
    /// Outbound frames buffered until the worker signals readiness.
    ready_q: Mutex<Vec<Bytes>>,

    last_request_id: AtomicU32,
    sequence: AtomicU32,
    pub stats: HandlerStats,

    /// Hard-stop for the read loop; mirrors the transport kill.
    cancel: CancellationToken,
    /// Fired exactly once when the worker exit has been processed.
    exited: CancellationToken,
    exit_detail: Mutex<Option<ExitDetail>>,

    pool_events: mpsc::UnboundedSender<PoolEvent>,
    worker_terminate_timeout: Duration,
    script: Option<String>,
    pub debug_port: Option<u16>,

    last_heartbeat: Mutex<Option<HeartbeatResBody>>,
    heartbeats_missed: AtomicU32,
}

impl std::fmt::Debug for WorkerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandler")
            .field("handler_id", &self.handler_id)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight.len())
            .field("tracking", &self.tracking.len())
            .finish()
    }
}

impl WorkerHandler {
    /// Wrap a freshly spawned worker and start its read loop.
    pub fn spawn(
        handler_id: usize,
        worker: SpawnedWorker,
        pool_events: mpsc::UnboundedSender<PoolEvent>,
        worker_terminate_timeout: Duration,
        script: Option<String>,
        debug_port: Option<u16>,
    ) -> Arc<Self> {
        let SpawnedWorker { transport, events } = worker;
        let handler = Arc::new(Self {
            handler_id,
            transport,
            state: Mutex::new(HandlerState::Warming),
            in_flight: DashMap::new(),
            tracking: DashMap::new(),
            ready_q: Mutex::new(Vec::new()),
            last_request_id: AtomicU32::new(0),
            sequence: AtomicU32::new(0),
            stats: HandlerStats::default(),
            cancel: CancellationToken::new(),
            exited: CancellationToken::new(),
            exit_detail: Mutex::new(None),
            pool_events,
            worker_terminate_timeout,
            script,
            debug_port,
            last_heartbeat: Mutex::new(None),
            heartbeats_missed: AtomicU32::new(0),
        });

        let reader = Arc::clone(&handler);
        tokio::spawn(async move {
            reader.read_loop(events).await;
        });

        handler
    }

    #[inline]
    pub fn state(&self) -> HandlerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: HandlerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Busy iff requests are in flight or a cleanup handshake is running.
    pub fn busy(&self) -> bool {
        !self.in_flight.is_empty() || self.state() == HandlerState::Cleaning
    }

    /// Eligible for new dispatch: not cleaning, terminating, or gone.
    pub fn accepting(&self) -> bool {
        matches!(
            self.state(),
            HandlerState::Cold
                | HandlerState::Warming
                | HandlerState::Ready
                | HandlerState::Busy
        )
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn last_heartbeat(&self) -> Option<HeartbeatResBody> {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn heartbeats_missed(&self) -> u32 {
        self.heartbeats_missed.load(Ordering::Relaxed)
    }

    pub fn exit_detail(&self) -> Option<ExitDetail> {
        self.exit_detail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[inline]
    fn next_seq(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn notify(&self, ev: PoolEvent) {
        let _ = self.pool_events.send(ev);
    }

    /// Dispatch one task to the worker.
    ///
    /// Assigns the next request id, frames a TaskRequest, and either sends
    /// immediately (ready/busy) or queues it until the readiness signal
    /// (cold/warming). Arms the timeout and cancellation watchers; the
    /// timeout clock starts here, when the task has left the queue.
    pub fn exec(self: &Arc<Self>, task: &Task) -> Result<(), PoolError> {
        let state = self.state();
        if !matches!(
            state,
            HandlerState::Cold
                | HandlerState::Warming
                | HandlerState::Ready
                | HandlerState::Busy
        ) {
            return Err(PoolError::new(
                ErrorKind::NoWorkersAvailable,
                format!("handler {} is {state:?}", self.handler_id),
            ));
        }

        let request_id = self.last_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let body = TaskRequestBody::new(task.method.clone(), task.params.clone());
        let mut flags = FrameFlags::empty();
        if task.transferables {
            flags |= FrameFlags::HAS_TRANSFER;
        }
        let frame = FrameBuilder::new(MsgType::TaskRequest, request_id)
            .sequence(self.next_seq())
            .priority(task.priority.clamp(0, 255) as u8)
            .flags(flags)
            .payload(body.encode()?)
            .build()?;
        let encoded = frame.encode();

        let shared = Arc::clone(&task.shared);
        let effective_timeout = task.timeout.or(shared.requested_timeout());

        self.in_flight.insert(
            request_id,
            InFlight {
                task_id: task.task_id,
                shared: Arc::clone(&shared),
                on_event: task.on_event.clone(),
                started: Instant::now(),
            },
        );

        let sent = match state {
            HandlerState::Cold | HandlerState::Warming => {
                self.ready_q
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(encoded);
                // The readiness signal may have landed between the state
                // read and the push; flush again so nothing is stranded.
                if matches!(self.state(), HandlerState::Ready | HandlerState::Busy) {
                    self.flush_ready_q();
                }
                Ok(())
            },
            _ => self.transport.send(encoded, task.transferables),
        };
        if let Err(e) = sent {
            self.in_flight.remove(&request_id);
            return Err(e);
        }

        if matches!(state, HandlerState::Ready | HandlerState::Busy) {
            self.set_state(HandlerState::Busy);
        }

        // Timeout watcher: the clock starts now, on dispatch.
        if let Some(timeout) = effective_timeout {
            let shared = Arc::clone(&shared);
            let done = shared.done_token().clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => {},
                    _ = sleep(timeout) => {
                        shared.abort_with(PoolError::timeout(format!(
                            "task timed out after {timeout:?}"
                        )));
                    },
                }
            });
        }

        // Cancellation watcher: a fired cancel token means the future is
        // already rejected; our job is the cleanup handshake.
        {
            let this = Arc::clone(self);
            let cancel = shared.cancel_token().clone();
            let done = shared.done_token().clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        this.begin_cleanup(request_id);
                    },
                    _ = done.cancelled() => {},
                }
            });
        }

        Ok(())
    }

    /// Move one in-flight record into tracking and open the abort
    /// handshake. The original cancellation/timeout error is preserved on
    /// the record; a missing cleanup reply force-terminates the worker.
    fn begin_cleanup(self: &Arc<Self>, request_id: u32) {
        let Some((_, entry)) = self.in_flight.remove(&request_id) else {
            // Completed (or crashed) before the watcher fired.
            return;
        };
        let original = entry
            .shared
            .settle_error()
            .unwrap_or_else(PoolError::cancelled);
        debug!(
            handler_id = self.handler_id,
            request_id, "starting cleanup: {original}"
        );
        self.tracking.insert(
            request_id,
            CleanupRecord {
                original,
                shared: entry.shared,
            },
        );

        if self.state() == HandlerState::Busy {
            self.set_state(HandlerState::Cleaning);
        }

        let frame = FrameBuilder::new(MsgType::Cleanup, request_id)
            .sequence(self.next_seq())
            .build();
        match frame {
            Ok(frame) => {
                if let Err(e) = self.transport.send(frame.encode(), false) {
                    warn!("cleanup frame send failed: {e}");
                }
            },
            Err(e) => warn!("cleanup frame build failed: {e}"),
        }

        // Cleanup deadline: no reply within the terminate budget is fatal
        // for this worker.
        let this = Arc::clone(self);
        let deadline = self.worker_terminate_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = this.exited.cancelled() => {},
                _ = sleep(deadline) => {
                    if this.tracking.contains_key(&request_id) {
                        warn!(
                            handler_id = this.handler_id,
                            request_id, "cleanup reply overdue, force-terminating worker"
                        );
                        this.set_state(HandlerState::Terminating);
                        this.transport.kill();
                    }
                },
            }
        });
    }

    async fn read_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.on_exit(ExitDetail {
                        exit_code: None,
                        signal: Some(9),
                        script: self.script.clone(),
                    });
                    return;
                },
                ev = events.recv() => match ev {
                    None => {
                        self.on_exit(ExitDetail {
                            exit_code: None,
                            signal: None,
                            script: self.script.clone(),
                        });
                        return;
                    },
                    Some(TransportEvent::Exit(detail)) => {
                        self.on_exit(detail);
                        return;
                    },
                    Some(TransportEvent::Message(bytes)) => self.on_message(bytes),
                },
            }
        }
    }

    fn on_message(self: &Arc<Self>, bytes: Bytes) {
        if bytes.as_ref() == READY_SIGNAL {
            self.on_ready();
            return;
        }
        let frame = match Frame::decode(&bytes) {
            Ok(f) => f,
            Err(e) => {
                // Garbage from the worker is an escalating offence.
                self.escalate_crash(e);
                return;
            },
        };
        let request_id = frame.message_id().unwrap_or_default();
        match frame.msg_type() {
            Ok(MsgType::Event) => {
                if let Some(entry) = self.in_flight.get(&request_id)
                    && let Some(listener) = &entry.on_event
                {
                    listener(frame.payload().clone());
                }
            },
            Ok(MsgType::TaskResponse) => {
                self.complete(request_id, Ok(frame.into_payload()));
            },
            Ok(MsgType::TaskError) => {
                let err = match TaskErrorBody::decode(frame.payload()) {
                    Ok(body) => body.into_error(),
                    Err(e) => {
                        self.escalate_crash(e);
                        return;
                    },
                };
                self.complete(request_id, Err(err));
            },
            Ok(MsgType::CleanupResponse) => self.on_cleanup_response(request_id, frame),
            Ok(MsgType::HeartbeatRes) => {
                match HeartbeatResBody::decode(frame.payload()) {
                    Ok(body) => {
                        self.heartbeats_missed.store(0, Ordering::Relaxed);
                        *self
                            .last_heartbeat
                            .lock()
                            .unwrap_or_else(|e| e.into_inner()) = Some(body);
                    },
                    Err(e) => warn!("bad heartbeat reply: {e}"),
                }
            },
            Ok(other) => debug!("ignoring {other:?} on the pool side"),
            Err(e) => self.escalate_crash(e),
        }
    }

    fn on_ready(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, HandlerState::Cold | HandlerState::Warming) {
                *state = if self.in_flight.is_empty() {
                    HandlerState::Ready
                } else {
                    HandlerState::Busy
                };
            }
        }
        debug!(handler_id = self.handler_id, "worker ready");
        self.flush_ready_q();
        self.notify(PoolEvent::WorkerReady {
            handler_id: self.handler_id,
        });
    }

    fn flush_ready_q(&self) {
        let queued = {
            let mut q = self.ready_q.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *q)
        };
        for frame in queued {
            if let Err(e) = self.transport.send(frame, false) {
                warn!("flush of queued frame failed: {e}");
            }
        }
    }

    fn complete(self: &Arc<Self>, request_id: u32, result: Result<Bytes, PoolError>) {
        let Some((_, entry)) = self.in_flight.remove(&request_id) else {
            if self.tracking.contains_key(&request_id) {
                // Late resolution for a cancelled task: discarded; only the
                // matching cleanup reply clears the tracking entry.
                debug!(request_id, "discarding late resolution for tracked task");
            } else {
                warn!(request_id, "resolution for unknown request id");
            }
            return;
        };

        let latency_ns = entry.started.elapsed().as_nanos() as u64;
        self.stats
            .busy_time_ns
            .fetch_add(latency_ns, Ordering::Relaxed);
        let failed = result.is_err();
        match result {
            Ok(value) => {
                self.stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
                entry.shared.fulfil(value);
            },
            Err(err) => {
                self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
                entry.shared.reject(err);
            },
        }
        debug!(
            handler_id = self.handler_id,
            request_id,
            task_id = entry.task_id,
            "task settled"
        );

        self.after_drain_step();
        self.notify(PoolEvent::TaskSettled {
            handler_id: self.handler_id,
            latency_ns,
            failed,
        });
    }

    fn on_cleanup_response(self: &Arc<Self>, request_id: u32, frame: Frame) {
        let Some((_, record)) = self.tracking.remove(&request_id) else {
            warn!(request_id, "cleanup reply for unknown request id");
            return;
        };
        if !frame.payload().is_empty()
            && let Ok(body) = TaskErrorBody::decode(frame.payload())
        {
            warn!(
                request_id,
                "abort listener reported: {}",
                body.into_error()
            );
        }
        // The future settled when cancel/timeout fired; this is a no-op
        // unless the pool is replaying a tracking record.
        record.shared.reject(record.original.already_handled());
        self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);

        self.after_drain_step();
        self.notify(PoolEvent::TaskSettled {
            handler_id: self.handler_id,
            latency_ns: 0,
            failed: true,
        });
    }

    /// Shared post-settlement state bookkeeping.
    fn after_drain_step(&self) {
        let drained = self.in_flight.is_empty() && self.tracking.is_empty();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            HandlerState::Busy | HandlerState::Cleaning if drained => {
                *state = HandlerState::Ready;
            },
            _ => {},
        }
    }

    /// A protocol violation from the worker is fatal for this handler,
    /// never for the pool.
    fn escalate_crash(self: &Arc<Self>, cause: PoolError) {
        warn!(
            handler_id = self.handler_id,
            "protocol error from worker, terminating: {cause}"
        );
        let crash = PoolError::new(
            ErrorKind::WorkerCrashed,
            format!("worker protocol violation: {}", cause.message()),
        );
        self.reject_all(&crash);
        self.set_state(HandlerState::Terminating);
        self.transport.kill();
    }

    fn reject_all(&self, err: &PoolError) {
        let in_flight: Vec<u32> = self.in_flight.iter().map(|e| *e.key()).collect();
        for rid in in_flight {
            if let Some((_, entry)) = self.in_flight.remove(&rid) {
                entry.shared.reject(err.clone());
                self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let tracked: Vec<u32> = self.tracking.iter().map(|e| *e.key()).collect();
        for rid in tracked {
            if let Some((_, record)) = self.tracking.remove(&rid) {
                record.shared.reject(err.clone());
            }
        }
    }

    fn on_exit(&self, detail: ExitDetail) {
        if self.state() == HandlerState::Terminated {
            return;
        }
        let err = PoolError::new(
            ErrorKind::WorkerTerminated,
            format!(
                "worker exited: exit_code={:?} signal={:?} script={:?}",
                detail.exit_code, detail.signal, detail.script
            ),
        )
        .with_exit(detail.clone());
        self.reject_all(&err);
        *self
            .exit_detail
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(detail);
        self.set_state(HandlerState::Terminated);
        self.exited.cancel();
        self.notify(PoolEvent::WorkerExited {
            handler_id: self.handler_id,
        });
    }

    /// Probe the worker; the monitor counts replies via `last_heartbeat`.
    pub fn request_heartbeat(&self) -> Result<(), PoolError> {
        self.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
        let frame = FrameBuilder::new(MsgType::HeartbeatReq, 0)
            .sequence(self.next_seq())
            .build()?;
        self.transport.send(frame.encode(), false)
    }

    /// Graceful (`force = false`): wait for in-flight work to drain, send
    /// Terminate, await the worker exit. Forced: reject everything first
    /// and kill the transport when the exit misses the budget.
    pub async fn terminate(self: &Arc<Self>, force: bool) -> Result<(), PoolError> {
        if self.state() == HandlerState::Terminated {
            return Ok(());
        }
        self.set_state(HandlerState::Terminating);

        if force {
            self.reject_all(&PoolError::new(
                ErrorKind::WorkerTerminated,
                "worker terminated (forced)",
            ));
        } else {
            let deadline = Instant::now() + self.worker_terminate_timeout;
            while !(self.in_flight.is_empty() && self.tracking.is_empty()) {
                if Instant::now() >= deadline {
                    warn!(
                        handler_id = self.handler_id,
                        "drain timeout: still {} in-flight",
                        self.in_flight.len()
                    );
                    break;
                }
                tokio::select! {
                    _ = self.exited.cancelled() => return Ok(()),
                    _ = sleep(Duration::from_millis(10)) => {},
                }
            }
        }

        let frame = FrameBuilder::new(MsgType::Terminate, 0)
            .sequence(self.next_seq())
            .build()?;
        let _ = self.transport.send(frame.encode(), false);

        tokio::select! {
            _ = self.exited.cancelled() => {},
            _ = sleep(self.worker_terminate_timeout) => {
                warn!(
                    handler_id = self.handler_id,
                    "worker did not exit in time, killing transport"
                );
                self.transport.kill();
                tokio::select! {
                    _ = self.exited.cancelled() => {},
                    _ = sleep(self.worker_terminate_timeout) => {
                        // The transport is wedged; hard-stop the read loop,
                        // which accounts the exit.
                        self.cancel.cancel();
                        self.exited.cancelled().await;
                    },
                }
            },
        }
        Ok(())
    }
}
