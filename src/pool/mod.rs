// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The pool: admission, the single-flighted dispatch loop, worker
//! lifecycle, and result plumbing.

pub mod circuit;
pub mod ports;

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::{
        config::PoolConfig,
        enums::{ChoiceStrategy, MemoryPressurePolicy, QueueStrategy, WorkerType},
    },
    error::{ErrorKind, PoolError},
    handler::{PoolEvent, WorkerHandler},
    pool::{
        circuit::{CircuitBreaker, CircuitState},
        ports::DebugPortAllocator,
    },
    queue::{
        QueueImpl, TaskQueue,
        fifo::FifoQueue,
        lifo::LifoQueue,
        priority::{CustomQueue, PriorityKeyFn, PriorityQueue},
    },
    scaler::{AdaptiveScaler, LoadSample, ScaleAction},
    strategy::{
        ChoiceHint, FairShare, HandlerView, InterleavedWeightedRoundRobin, LeastBusy,
        LeastUsed, RoundRobin, StrategyManager, WeightedRoundRobin,
        WorkerChoiceStrategy,
    },
    task::{ExecOptions, Task, future::ResultFuture},
    transport::{
        TransportFactory, WorkerOptions,
        local::{LocalTransportFactory, SharedMemoryOptions},
    },
    worker::{MethodRegistry, dispatcher::DispatcherConfig},
};

/// Hook invoked before each worker spawn; may override per-worker options.
pub type CreateWorkerHook = Arc<dyn Fn(&mut WorkerOptions) + Send + Sync>;
/// Hook invoked after a worker has been reaped.
pub type TerminateWorkerHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub pending: usize,
    pub active: usize,
    pub circuit_state: CircuitState,
    pub estimated_queue_memory: u64,
}

/// Cumulative counters since pool start.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub tasks_submitted: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    /// Busy time of workers that have already been reaped.
    retired_busy_ns: AtomicU64,
}

/// Aggregated counters: pool-level tallies plus handler busy time (live
/// and retired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub total_busy_time: Duration,
}

struct PoolInner {
    queue: QueueImpl,
    queued_bytes: u64,
}

pub struct Pool {
    cfg: PoolConfig,
    factory: Arc<dyn TransportFactory>,

    inner: Mutex<PoolInner>,
    strategy: Mutex<StrategyManager>,
    handlers: Mutex<Vec<Arc<WorkerHandler>>>,
    next_handler_id: AtomicUsize,
    task_id_gen: AtomicU64,

    events_tx: mpsc::UnboundedSender<PoolEvent>,
    /// Blocks admissions and stops the dispatch loop.
    terminated: CancellationToken,
    /// Resolved when every handler has been reaped after terminate.
    reaped: CancellationToken,
    terminate_started: AtomicBool,
    /// Wakes `wait`-policy admissions when queue memory frees up.
    mem_freed: Notify,

    pub metrics: PoolMetrics,
    circuit: Option<CircuitBreaker>,
    ports: Mutex<Option<DebugPortAllocator>>,
    latencies_ns: Mutex<VecDeque<u64>>,

    on_create_worker: Option<CreateWorkerHook>,
    on_terminate_worker: Option<TerminateWorkerHook>,

    /// Weak self-reference handed to the monitor loop so an abandoned
    /// pool can still drop.
    self_weak: OnceCell<Weak<Pool>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool").field("stats", &stats).finish()
    }
}

/// Pool construction: config plus the pieces that are code, not data.
pub struct PoolBuilder {
    cfg: PoolConfig,
    factory: Option<Arc<dyn TransportFactory>>,
    registry: Option<Arc<MethodRegistry>>,
    on_create_worker: Option<CreateWorkerHook>,
    on_terminate_worker: Option<TerminateWorkerHook>,
    custom_queue_key: Option<PriorityKeyFn>,
}

impl PoolBuilder {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            cfg,
            factory: None,
            registry: None,
            on_create_worker: None,
            on_terminate_worker: None,
            custom_queue_key: None,
        }
    }

    /// Methods served by workers spawned through the default factory.
    pub fn registry(mut self, registry: Arc<MethodRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the transport factory entirely.
    pub fn factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn on_create_worker(mut self, hook: CreateWorkerHook) -> Self {
        self.on_create_worker = Some(hook);
        self
    }

    pub fn on_terminate_worker(mut self, hook: TerminateWorkerHook) -> Self {
        self.on_terminate_worker = Some(hook);
        self
    }

    /// Key function for the `custom` queue strategy.
    pub fn custom_queue_key(mut self, key_fn: PriorityKeyFn) -> Self {
        self.custom_queue_key = Some(key_fn);
        self
    }

    pub fn build(mut self) -> Result<Arc<Pool>, PoolError> {
        self.cfg
            .validate_and_normalize()
            .map_err(|e| PoolError::new(ErrorKind::InvalidParams, e.to_string()))?;

        let factory = match self.factory.take() {
            Some(f) => f,
            None => {
                let registry = self.registry.take().ok_or_else(|| {
                    PoolError::new(
                        ErrorKind::InvalidParams,
                        "a method registry (or explicit factory) is required",
                    )
                })?;
                match self.cfg.worker_type {
                    WorkerType::Auto | WorkerType::Thread => {
                        let mut factory = LocalTransportFactory::new(registry)
                            .with_dispatcher_cfg(DispatcherConfig {
                                abort_listener_timeout: self.cfg.abort_listener_timeout,
                                script: self.cfg.script.clone(),
                            });
                        if self.cfg.shared_memory.enabled {
                            factory = factory.with_shared_memory(SharedMemoryOptions {
                                slot_size: self.cfg.shared_memory.slot_size,
                                slot_count: self.cfg.shared_memory.slot_count,
                            });
                        }
                        Arc::new(factory) as Arc<dyn TransportFactory>
                    },
                    other => {
                        return Err(PoolError::new(
                            ErrorKind::WorkerTypeUnsupported,
                            format!("no built-in factory for workerType {other}"),
                        ));
                    },
                }
            },
        };

        let queue = match self.cfg.queue_strategy {
            QueueStrategy::Fifo => QueueImpl::Fifo(FifoQueue::new()),
            QueueStrategy::Lifo => QueueImpl::Lifo(LifoQueue::new()),
            QueueStrategy::Priority => QueueImpl::Priority(PriorityQueue::new()),
            QueueStrategy::Custom => {
                let key_fn = self.custom_queue_key.take().ok_or_else(|| {
                    PoolError::new(
                        ErrorKind::InvalidParams,
                        "queueStrategy custom requires a key function",
                    )
                })?;
                QueueImpl::Custom(CustomQueue::new(key_fn))
            },
        };

        let strategy: Box<dyn WorkerChoiceStrategy> = match self.cfg.choice_strategy {
            ChoiceStrategy::RoundRobin => Box::new(RoundRobin::new()),
            ChoiceStrategy::LeastBusy => Box::new(LeastBusy::new()),
            ChoiceStrategy::LeastUsed => Box::new(LeastUsed::new()),
            ChoiceStrategy::FairShare => Box::new(FairShare::new()),
            ChoiceStrategy::WeightedRoundRobin => Box::new(WeightedRoundRobin::new(
                self.cfg.worker_weights.clone(),
                self.cfg.default_weight,
            )),
            ChoiceStrategy::InterleavedWeightedRoundRobin => {
                Box::new(InterleavedWeightedRoundRobin::new(
                    self.cfg.worker_weights.clone(),
                    self.cfg.default_weight,
                ))
            },
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ports = self.cfg.debug_port_start.map(DebugPortAllocator::new);

        let circuit = self
            .cfg
            .circuit_breaker
            .enabled
            .then(|| CircuitBreaker::new(&self.cfg.circuit_breaker));

        let pool = Arc::new(Pool {
            cfg: self.cfg,
            factory,
            inner: Mutex::new(PoolInner {
                queue,
                queued_bytes: 0,
            }),
            strategy: Mutex::new(StrategyManager::new(strategy)),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicUsize::new(0),
            task_id_gen: AtomicU64::new(0),
            events_tx,
            terminated: CancellationToken::new(),
            reaped: CancellationToken::new(),
            terminate_started: AtomicBool::new(false),
            mem_freed: Notify::new(),
            metrics: PoolMetrics::default(),
            circuit,
            ports: Mutex::new(ports),
            latencies_ns: Mutex::new(VecDeque::new()),
            on_create_worker: self.on_create_worker,
            on_terminate_worker: self.on_terminate_worker,
            self_weak: OnceCell::new(),
        });
        let _ = pool.self_weak.set(Arc::downgrade(&pool));

        for _ in 0..pool.cfg.resolved_min_workers() {
            if let Err(e) = pool.spawn_handler() {
                warn!("initial worker spawn failed: {e}");
            }
        }

        let runner = Arc::clone(&pool);
        tokio::spawn(async move {
            runner.run_dispatch(events_rx).await;
        });

        if pool.cfg.enable_metrics
            && let Some(weak) = pool.self_weak.get().cloned()
        {
            let interval = pool.cfg.metrics_interval;
            tokio::spawn(async move {
                Pool::run_monitor(weak, interval).await;
            });
        }

        Ok(pool)
    }
}

impl Pool {
    /// Submit one task. Fails synchronously on a terminated pool, a full
    /// queue, or memory pressure under the `reject` policy; under `wait`
    /// it suspends until queued memory frees up.
    pub async fn exec(
        &self,
        method: impl Into<String>,
        params: Bytes,
        opts: ExecOptions,
    ) -> Result<ResultFuture, PoolError> {
        if self.terminated.is_cancelled() {
            return Err(PoolError::pool_terminated());
        }
        if let Some(cb) = &self.circuit
            && !cb.allow()
        {
            return Err(PoolError::new(
                ErrorKind::NoWorkersAvailable,
                "circuit breaker is open",
            ));
        }

        let method = method.into();
        let est = crate::utils::estimate_task_bytes(&method, &params) as u64;
        let task_id = self.task_id_gen.fetch_add(1, Ordering::Relaxed) + 1;
        let (future, shared) = ResultFuture::create();
        let mut pending_task = Some(Task::new(task_id, method, params, opts, shared));

        loop {
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(max) = self.cfg.max_queue_size
                    && inner.queue.len() >= max
                {
                    return Err(PoolError::queue_full(inner.queue.len()));
                }
                match self.cfg.max_queue_memory {
                    Some(limit) if inner.queued_bytes + est > limit => {
                        match self.cfg.on_memory_pressure {
                            MemoryPressurePolicy::Reject => {
                                return Err(PoolError::new(
                                    ErrorKind::LimitExceeded,
                                    format!(
                                        "queued memory {} + {est} exceeds {limit}",
                                        inner.queued_bytes
                                    ),
                                ));
                            },
                            MemoryPressurePolicy::DropOldest => {
                                while inner.queued_bytes + est > limit {
                                    let Some(victim) = inner.queue.pop() else {
                                        break;
                                    };
                                    inner.queued_bytes = inner
                                        .queued_bytes
                                        .saturating_sub(victim.estimated_bytes() as u64);
                                    victim.shared.reject(PoolError::new(
                                        ErrorKind::LimitExceeded,
                                        "dropped under queue memory pressure",
                                    ));
                                    self.metrics
                                        .tasks_cancelled
                                        .fetch_add(1, Ordering::Relaxed);
                                }
                                self.admit(&mut inner, est, &mut pending_task);
                            },
                            MemoryPressurePolicy::Wait => {
                                // Fall through to the notified wait below.
                            },
                        }
                    },
                    _ => self.admit(&mut inner, est, &mut pending_task),
                }
            }

            if pending_task.is_none() {
                break;
            }
            // Wait policy: park until a pop or settle frees memory.
            tokio::select! {
                _ = self.terminated.cancelled() => {
                    return Err(PoolError::pool_terminated());
                },
                _ = self.mem_freed.notified() => {},
            }
        }

        self.metrics.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        let _ = self.events_tx.send(PoolEvent::Dispatch);
        Ok(future)
    }

    fn admit(&self, inner: &mut PoolInner, est: u64, task: &mut Option<Task>) {
        if let Some(task) = task.take() {
            inner.queue.push(task);
            inner.queued_bytes += est;
        }
    }

    /// One pass of the single-flighted dispatch loop: keep pairing queued
    /// tasks with handlers until the queue or the capacity runs out.
    fn dispatch_step(self: &Arc<Self>) {
        loop {
            if self.terminated.is_cancelled() {
                return;
            }

            let handlers: Vec<Arc<WorkerHandler>> = self
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let idle_exists = handlers.iter().any(|h| h.accepting() && !h.busy());
            let can_spawn = handlers.len() < self.cfg.max_workers;
            if !idle_exists && !can_spawn {
                return;
            }

            let Some(mut task) = self.pop_live_task() else {
                return;
            };

            let views: Vec<HandlerView> = handlers
                .iter()
                .enumerate()
                .map(|(index, h)| HandlerView {
                    index,
                    busy: h.busy(),
                    accepting: h.accepting(),
                    active: h.active_count(),
                    completed: h.stats.tasks_completed.load(Ordering::Relaxed),
                    busy_time_ns: h.stats.busy_time_ns.load(Ordering::Relaxed),
                })
                .collect();
            let hint = ChoiceHint {
                affinity: task.affinity,
            };
            let choice = self
                .strategy
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .choose(&views, Some(&hint));

            let handler = match choice {
                Some(idx)
                    if handlers
                        .get(idx)
                        .is_some_and(|h| h.accepting() && !h.busy()) =>
                {
                    Arc::clone(&handlers[idx])
                },
                _ if can_spawn => match self.spawn_handler() {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("worker spawn failed: {e}");
                        task.shared.reject(PoolError::new(
                            ErrorKind::WorkerSpawnFailed,
                            e.message(),
                        ));
                        continue;
                    },
                },
                _ => match handlers.iter().find(|h| h.accepting() && !h.busy()) {
                    Some(h) => Arc::clone(h),
                    None => {
                        // Capacity vanished between the check and the pick;
                        // put the task back and wait for the next event.
                        let mut inner =
                            self.inner.lock().unwrap_or_else(|e| e.into_inner());
                        inner.queued_bytes += task.estimated_bytes() as u64;
                        inner.queue.push(task);
                        return;
                    },
                },
            };

            task.state = crate::task::TaskState::Dispatched;
            task.handler_ref = Some(handler.handler_id);
            task.started_at = Some(chrono::Utc::now());
            debug!(
                task_id = task.task_id,
                handler_id = handler.handler_id,
                "dispatching"
            );
            if let Err(e) = handler.exec(&task) {
                task.shared.reject(e);
            }
        }
    }

    /// Pop the next non-tombstone task, refunding cancelled ones.
    fn pop_live_task(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let task = inner.queue.pop()?;
            inner.queued_bytes = inner
                .queued_bytes
                .saturating_sub(task.estimated_bytes() as u64);
            self.mem_freed.notify_waiters();
            if task.is_cancelled_in_queue() {
                // Cancelled while queued; already rejected at cancel time.
                self.metrics.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            return Some(task);
        }
    }

    fn spawn_handler(&self) -> Result<Arc<WorkerHandler>, PoolError> {
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let debug_port = self
            .ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .and_then(DebugPortAllocator::allocate);

        let mut opts = WorkerOptions {
            handler_id,
            debug_port,
            emit_std_streams: self.cfg.emit_std_streams,
            script: self.cfg.script.clone(),
        };
        if let Some(hook) = &self.on_create_worker {
            hook(&mut opts);
        }

        let spawned = self.factory.spawn(&opts)?;
        let handler = WorkerHandler::spawn(
            handler_id,
            spawned,
            self.events_tx.clone(),
            self.cfg.worker_terminate_timeout,
            opts.script.clone(),
            opts.debug_port,
        );
        info!(handler_id, "worker spawned");
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&handler));
        Ok(handler)
    }

    fn reap(&self, handler_id: usize) {
        let removed = {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            let before = handlers.len();
            handlers.retain(|h| {
                if h.handler_id == handler_id {
                    self.metrics.retired_busy_ns.fetch_add(
                        h.stats.busy_time_ns.load(Ordering::Relaxed),
                        Ordering::Relaxed,
                    );
                    false
                } else {
                    true
                }
            });
            before != handlers.len()
        };
        if !removed {
            return;
        }
        debug!(handler_id, "worker reaped");
        if let Some(hook) = &self.on_terminate_worker {
            hook(handler_id);
        }
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        let live_busy_ns: u64 = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.stats.busy_time_ns.load(Ordering::Relaxed))
            .sum();
        PoolMetricsSnapshot {
            tasks_submitted: self.metrics.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.metrics.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.metrics.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.metrics.tasks_cancelled.load(Ordering::Relaxed),
            total_busy_time: Duration::from_nanos(
                live_busy_ns + self.metrics.retired_busy_ns.load(Ordering::Relaxed),
            ),
        }
    }

    fn release_port(&self, port: Option<u16>) {
        if let Some(port) = port
            && let Some(ports) = self
                .ports
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_mut()
        {
            ports.release(port);
        }
    }

    async fn run_dispatch(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
        loop {
            tokio::select! {
                _ = self.terminated.cancelled() => return,
                ev = events.recv() => {
                    let Some(ev) = ev else { return };
                    match ev {
                        PoolEvent::Dispatch | PoolEvent::WorkerReady { .. } => {},
                        PoolEvent::TaskSettled { latency_ns, failed, .. } => {
                            self.record_settlement(latency_ns, failed);
                        },
                        PoolEvent::WorkerExited { handler_id } => {
                            let port = self
                                .handlers
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .iter()
                                .find(|h| h.handler_id == handler_id)
                                .and_then(|h| h.debug_port);
                            self.reap(handler_id);
                            self.release_port(port);
                        },
                    }
                    self.dispatch_step();
                },
            }
        }
    }

    fn record_settlement(&self, latency_ns: u64, failed: bool) {
        if failed {
            self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.tasks_completed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(cb) = &self.circuit {
            if failed {
                cb.on_failure();
            } else {
                cb.on_success();
            }
        }
        if latency_ns > 0 {
            let mut lat = self.latencies_ns.lock().unwrap_or_else(|e| e.into_inner());
            if lat.len() >= 256 {
                lat.pop_front();
            }
            lat.push_back(latency_ns);
        }
        self.mem_freed.notify_waiters();
    }

    fn p95_latency(&self) -> Duration {
        let lat = self.latencies_ns.lock().unwrap_or_else(|e| e.into_inner());
        if lat.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<u64> = lat.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() * 95).div_ceil(100).saturating_sub(1);
        Duration::from_nanos(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn stats(&self) -> PoolStats {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let total = handlers.len();
        let busy = handlers.iter().filter(|h| h.busy()).count();
        let active: usize = handlers.iter().map(|h| h.active_count()).sum();
        drop(handlers);

        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        PoolStats {
            total,
            busy,
            idle: total - busy,
            pending: inner.queue.len(),
            active,
            circuit_state: self
                .circuit
                .as_ref()
                .map_or(CircuitState::Closed, CircuitBreaker::state),
            estimated_queue_memory: inner.queued_bytes,
        }
    }

    /// Swap the worker-choice strategy at runtime.
    pub fn set_choice_strategy(&self, strategy: Box<dyn WorkerChoiceStrategy>) {
        self.strategy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_strategy(strategy);
    }

    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    /// Terminate the pool. New admissions reject with PoolTerminated,
    /// queued tasks are rejected, every handler is terminated and reaped.
    /// Idempotent: a second call awaits the same completion.
    pub async fn terminate(self: &Arc<Self>, force: bool) {
        if !self.terminate_started.swap(true, Ordering::AcqRel) {
            self.terminated.cancel();

            let this = Arc::clone(self);
            tokio::spawn(async move {
                let drained: Vec<Task> = {
                    let mut inner =
                        this.inner.lock().unwrap_or_else(|e| e.into_inner());
                    let mut out = Vec::with_capacity(inner.queue.len());
                    while let Some(task) = inner.queue.pop() {
                        out.push(task);
                    }
                    inner.queued_bytes = 0;
                    out
                };
                for task in drained {
                    task.shared.reject(PoolError::pool_terminated());
                    this.metrics.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                }
                this.mem_freed.notify_waiters();

                let handlers: Vec<Arc<WorkerHandler>> = {
                    let mut guard =
                        this.handlers.lock().unwrap_or_else(|e| e.into_inner());
                    std::mem::take(&mut *guard)
                };
                for handler in handlers {
                    if let Err(e) = handler.terminate(force).await {
                        warn!(
                            handler_id = handler.handler_id,
                            "handler terminate failed: {e}"
                        );
                    }
                    this.metrics.retired_busy_ns.fetch_add(
                        handler.stats.busy_time_ns.load(Ordering::Relaxed),
                        Ordering::Relaxed,
                    );
                    this.release_port(handler.debug_port);
                    if let Some(hook) = &this.on_terminate_worker {
                        hook(handler.handler_id);
                    }
                }
                info!("pool terminated");
                this.reaped.cancel();
            });
        }
        self.reaped.cancelled().await;
    }

    /// Periodic monitor: heartbeats, unresponsive-worker recycling, and
    /// adaptive scaling. Holds only a weak reference so an abandoned pool
    /// can still drop.
    async fn run_monitor(weak: Weak<Pool>, interval: Duration) {
        let mut scaler = {
            let Some(pool) = weak.upgrade() else { return };
            AdaptiveScaler::new(
                pool.cfg.scaling.clone(),
                pool.cfg.resolved_min_workers(),
                pool.cfg.max_workers,
            )
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else { return };
            if pool.terminated.is_cancelled() {
                return;
            }

            let handlers: Vec<Arc<WorkerHandler>> = pool
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for handler in &handlers {
                if handler.heartbeats_missed() > 2 {
                    warn!(
                        handler_id = handler.handler_id,
                        "worker unresponsive, recycling"
                    );
                    let h = Arc::clone(handler);
                    tokio::spawn(async move {
                        let _ = h.terminate(true).await;
                    });
                    continue;
                }
                if let Err(e) = handler.request_heartbeat() {
                    warn!(handler_id = handler.handler_id, "heartbeat send failed: {e}");
                }
            }

            let stats = pool.stats();
            let sample = LoadSample {
                queue_depth: stats.pending,
                busy_workers: stats.busy,
                total_workers: stats.total,
                p95_latency: pool.p95_latency(),
                avg_utilisation: if stats.total == 0 {
                    0.0
                } else {
                    stats.busy as f64 / stats.total as f64
                },
            };
            let decision = scaler.evaluate(sample);
            match decision.action {
                ScaleAction::Up => {
                    info!(
                        count = decision.count,
                        confidence = decision.confidence,
                        "scaling up: {}",
                        decision.reason
                    );
                    for _ in 0..decision.count {
                        if let Err(e) = pool.spawn_handler() {
                            warn!("scale-up spawn failed: {e}");
                            break;
                        }
                    }
                },
                ScaleAction::Down => {
                    info!(
                        count = decision.count,
                        confidence = decision.confidence,
                        "scaling down: {}",
                        decision.reason
                    );
                    let idle: Vec<Arc<WorkerHandler>> = handlers
                        .iter()
                        .filter(|h| !h.busy() && h.accepting())
                        .take(decision.count)
                        .cloned()
                        .collect();
                    for handler in idle {
                        tokio::spawn(async move {
                            let _ = handler.terminate(false).await;
                        });
                    }
                },
                ScaleAction::None => {},
            }
        }
    }
}
