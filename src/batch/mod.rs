// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Batch executor: fan-out of N sub-tasks through the pool with a
//! concurrency gate, ordered results, throttled progress, pause/resume,
//! and cancellation cascades for short-circuiting collection operations.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use serde_json::Value;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{ErrorKind, PoolError},
    pool::Pool,
    task::ExecOptions,
};

pub type ProgressFn = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// One sub-task of a batch.
#[derive(Debug, Clone)]
pub struct BatchTaskSpec {
    pub method: String,
    pub params: Bytes,
    pub options: ExecOptions,
}

impl BatchTaskSpec {
    pub fn new(method: impl Into<String>, params: Bytes) -> Self {
        Self {
            method: method.into(),
            params,
            options: ExecOptions::default(),
        }
    }
}

#[derive(Clone, Default)]
pub struct BatchOptions {
    /// In-flight ceiling; clamped to `min(concurrency, maxWorkers)`.
    pub concurrency: Option<usize>,
    /// Stop issuing new sub-tasks after the first failure.
    pub fail_fast: bool,
    pub progress: Option<ProgressFn>,
    /// Progress fires at most once per this interval.
    pub progress_throttle: Option<Duration>,
    /// Passed through to every sub-task.
    pub task_timeout: Option<Duration>,
    /// Aborts the whole operation.
    pub batch_timeout: Option<Duration>,
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("concurrency", &self.concurrency)
            .field("fail_fast", &self.fail_fast)
            .field("task_timeout", &self.task_timeout)
            .field("batch_timeout", &self.batch_timeout)
            .finish()
    }
}

/// Per-sub-task outcome, kept in original submission order.
#[derive(Debug, Clone)]
pub struct BatchItemResult {
    pub index: usize,
    pub success: bool,
    pub value: Option<Bytes>,
    pub error: Option<PoolError>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub throughput_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Caller-facing handle for a running batch.
pub struct BatchHandle {
    join: tokio::task::JoinHandle<Result<Vec<BatchItemResult>, PoolError>>,
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl BatchHandle {
    /// Stop issuing new sub-tasks.
    pub fn pause(&self) {
        let _ = self.pause.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause.send(false);
    }

    /// Cancel pending and in-flight sub-tasks.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.pause.send(false);
    }

    pub async fn wait(self) -> Result<Vec<BatchItemResult>, PoolError> {
        self.join.await.unwrap_or_else(|e| {
            Err(PoolError::new(
                ErrorKind::InternalError,
                format!("batch driver panicked: {e}"),
            ))
        })
    }
}

struct BatchState {
    results: Mutex<Vec<Option<BatchItemResult>>>,
    completed: AtomicUsize,
    successes: AtomicUsize,
    failures: AtomicUsize,
    total: usize,
    started: Instant,
    progress: Option<ProgressFn>,
    throttle: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl BatchState {
    fn record(&self, result: BatchItemResult) {
        if result.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        let index = result.index;
        results[index] = Some(result);
    }

    fn emit_progress(&self, force: bool) {
        let Some(progress) = &self.progress else { return };
        {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if !force
                && let Some(at) = *last
                && now.duration_since(at) < self.throttle
            {
                return;
            }
            *last = Some(now);
        }
        let completed = self.completed.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            completed as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(completed);
        let eta = (throughput > 0.0 && remaining > 0)
            .then(|| Duration::from_secs_f64(remaining as f64 / throughput));
        progress(BatchProgress {
            completed,
            total: self.total,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            throughput_per_sec: throughput,
            eta,
        });
    }
}

impl Pool {
    /// Fan out `tasks` through the pool. Results preserve submission
    /// order; see [`BatchOptions`] for the knobs.
    pub fn exec_batch(
        self: &Arc<Self>,
        tasks: Vec<BatchTaskSpec>,
        opts: BatchOptions,
    ) -> BatchHandle {
        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let pool = Arc::clone(self);
        let driver_cancel = cancel.clone();
        let batch_timeout = opts.batch_timeout;
        let join = tokio::spawn(async move {
            let run = drive_batch(pool, tasks, opts, pause_rx, driver_cancel.clone());
            match batch_timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(res) => res,
                    Err(_) => {
                        driver_cancel.cancel();
                        Err(PoolError::timeout(format!(
                            "batch aborted after {limit:?}"
                        )))
                    },
                },
                None => run.await,
            }
        });

        BatchHandle {
            join,
            pause: pause_tx,
            cancel,
        }
    }
}

async fn drive_batch(
    pool: Arc<Pool>,
    tasks: Vec<BatchTaskSpec>,
    opts: BatchOptions,
    mut pause_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Result<Vec<BatchItemResult>, PoolError> {
    let total = tasks.len();
    let max_workers = pool.config().max_workers.max(1);
    let permits = opts.concurrency.unwrap_or(max_workers).clamp(1, max_workers);
    let semaphore = Arc::new(Semaphore::new(permits));

    // Fail-fast stops issuing; user cancel additionally aborts in-flight.
    let stop_issuing = CancellationToken::new();

    let state = Arc::new(BatchState {
        results: Mutex::new((0..total).map(|_| None).collect()),
        completed: AtomicUsize::new(0),
        successes: AtomicUsize::new(0),
        failures: AtomicUsize::new(0),
        total,
        started: Instant::now(),
        progress: opts.progress.clone(),
        throttle: opts.progress_throttle.unwrap_or(Duration::from_millis(100)),
        last_emit: Mutex::new(None),
    });

    let mut set: JoinSet<()> = JoinSet::new();

    for (index, spec) in tasks.into_iter().enumerate() {
        if cancel.is_cancelled() || stop_issuing.is_cancelled() {
            state.record(BatchItemResult {
                index,
                success: false,
                value: None,
                error: Some(PoolError::cancelled()),
                duration: Duration::ZERO,
            });
            continue;
        }

        // Pause gate: issuing stops, in-flight work continues.
        while *pause_rx.borrow() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = pause_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                },
            }
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            state.record(BatchItemResult {
                index,
                success: false,
                value: None,
                error: Some(PoolError::cancelled()),
                duration: Duration::ZERO,
            });
            continue;
        };

        // A failure may have tripped fail-fast while this slot waited on
        // the permit.
        if cancel.is_cancelled() || stop_issuing.is_cancelled() {
            drop(permit);
            state.record(BatchItemResult {
                index,
                success: false,
                value: None,
                error: Some(PoolError::cancelled()),
                duration: Duration::ZERO,
            });
            continue;
        }

        let mut options = spec.options.clone();
        if options.timeout.is_none() {
            options.timeout = opts.task_timeout;
        }

        let issued_at = Instant::now();
        let future = match pool.exec(spec.method, spec.params, options).await {
            Ok(f) => f,
            Err(e) => {
                drop(permit);
                if opts.fail_fast {
                    stop_issuing.cancel();
                }
                state.record(BatchItemResult {
                    index,
                    success: false,
                    value: None,
                    error: Some(e),
                    duration: issued_at.elapsed(),
                });
                state.emit_progress(false);
                continue;
            },
        };

        let state = Arc::clone(&state);
        let stop_issuing = stop_issuing.clone();
        let fail_fast = opts.fail_fast;
        let cancel = cancel.clone();

        // Batch cancel aborts the sub-task; the watcher stands down once
        // the future settles on its own.
        {
            let shared = future.shared_handle();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let done = shared.done_token().clone();
                tokio::select! {
                    biased;
                    _ = done.cancelled() => {},
                    _ = cancel.cancelled() => {
                        shared.abort_with(PoolError::cancelled());
                    },
                }
            });
        }

        set.spawn(async move {
            let _permit = permit;
            let result = future.await;
            let duration = issued_at.elapsed();
            // Fail-fast or cancel tripped while this sub-task was in
            // flight: it ran to completion, but its late outcome is
            // discarded rather than reported.
            let discarded = cancel.is_cancelled() || stop_issuing.is_cancelled();
            match result {
                Ok(value) if !discarded => state.record(BatchItemResult {
                    index,
                    success: true,
                    value: Some(value),
                    error: None,
                    duration,
                }),
                Err(e) if !discarded => {
                    if fail_fast {
                        stop_issuing.cancel();
                    }
                    state.record(BatchItemResult {
                        index,
                        success: false,
                        value: None,
                        error: Some(e),
                        duration,
                    });
                },
                _ => state.record(BatchItemResult {
                    index,
                    success: false,
                    value: None,
                    error: Some(PoolError::new(
                        ErrorKind::Cancelled,
                        "result discarded after batch abort",
                    )),
                    duration,
                }),
            }
            state.emit_progress(false);
        });
    }

    while set.join_next().await.is_some() {}
    state.emit_progress(true);
    debug!(
        total,
        successes = state.successes.load(Ordering::Relaxed),
        failures = state.failures.load(Ordering::Relaxed),
        "batch finished"
    );

    let results = {
        let mut guard = state.results.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    };
    Ok(results
        .into_iter()
        .enumerate()
        .map(|(index, r)| {
            r.unwrap_or(BatchItemResult {
                index,
                success: false,
                value: None,
                error: Some(PoolError::cancelled()),
                duration: Duration::ZERO,
            })
        })
        .collect())
}

/// Options for the parallel-array operations built on `map`.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// Items per sub-task; `ceil(len / chunk_size)` sub-tasks are issued.
    pub chunk_size: Option<usize>,
    pub batch: BatchOptions,
}

const DEFAULT_CHUNK_SIZE: usize = 100;

fn encode_chunk(chunk: &[Value]) -> Result<Bytes, PoolError> {
    serde_json::to_vec(chunk)
        .map(Bytes::from)
        .map_err(|e| PoolError::new(ErrorKind::SerializationFailed, e.to_string()))
}

fn decode_values(bytes: &Bytes) -> Result<Vec<Value>, PoolError> {
    serde_json::from_slice(bytes)
        .map_err(|e| PoolError::new(ErrorKind::DeserializationFailed, e.to_string()))
}

fn decode_bools(bytes: &Bytes) -> Result<Vec<bool>, PoolError> {
    serde_json::from_slice(bytes)
        .map_err(|e| PoolError::new(ErrorKind::DeserializationFailed, e.to_string()))
}

impl Pool {
    /// Apply `method` to every item, chunked: each sub-task receives a
    /// JSON array and returns the mapped array. Element order is
    /// preserved.
    pub async fn map(
        self: &Arc<Self>,
        method: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<Vec<Value>, PoolError> {
        let chunk_size = opts.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        let mut specs = Vec::with_capacity(items.len().div_ceil(chunk_size));
        for chunk in items.chunks(chunk_size) {
            specs.push(BatchTaskSpec::new(method, encode_chunk(chunk)?));
        }
        let results = self.exec_batch(specs, opts.batch).wait().await?;

        let mut out = Vec::with_capacity(items.len());
        for item in results {
            match (item.success, item.value, item.error) {
                (true, Some(bytes), _) => out.extend(decode_values(&bytes)?),
                (_, _, Some(err)) => return Err(err),
                _ => {
                    return Err(PoolError::new(
                        ErrorKind::InternalError,
                        "batch item settled without value or error",
                    ));
                },
            }
        }
        Ok(out)
    }

    /// Evaluate a worker-side predicate per chunk; chunk futures are
    /// issued concurrently and awaited in index order so short-circuiting
    /// callers can cancel the rest as soon as the answer is known.
    async fn predicate_chunks(
        self: &Arc<Self>,
        method: &str,
        items: &[Value],
        opts: &MapOptions,
        mut short_circuit: impl FnMut(usize, &[bool]) -> bool,
    ) -> Result<Vec<bool>, PoolError> {
        let chunk_size = opts.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        let mut futures = Vec::new();
        for chunk in items.chunks(chunk_size) {
            let fut = self
                .exec(
                    method,
                    encode_chunk(chunk)?,
                    ExecOptions {
                        timeout: opts.batch.task_timeout,
                        ..ExecOptions::default()
                    },
                )
                .await?;
            futures.push(fut);
        }

        let mut flags = Vec::with_capacity(items.len());
        let mut satisfied = false;
        let mut iter = futures.into_iter();
        let mut base = 0usize;
        for fut in iter.by_ref() {
            let bytes = fut.await?;
            let chunk_flags = decode_bools(&bytes)?;
            if short_circuit(base, &chunk_flags) {
                satisfied = true;
                flags.extend(chunk_flags);
                break;
            }
            base += chunk_flags.len();
            flags.extend(chunk_flags);
        }
        if satisfied {
            // Cancellation cascade for the chunks we no longer need.
            for fut in iter {
                fut.cancel();
            }
        }
        Ok(flags)
    }

    /// Keep the items whose predicate returned true.
    pub async fn filter(
        self: &Arc<Self>,
        predicate: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<Vec<Value>, PoolError> {
        let flags = self
            .predicate_chunks(predicate, &items, &opts, |_, _| false)
            .await?;
        Ok(items
            .into_iter()
            .zip(flags)
            .filter_map(|(item, keep)| keep.then_some(item))
            .collect())
    }

    /// True once any predicate hit is seen; remaining chunks are cancelled.
    pub async fn some(
        self: &Arc<Self>,
        predicate: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<bool, PoolError> {
        let flags = self
            .predicate_chunks(predicate, &items, &opts, |_, chunk| {
                chunk.iter().any(|b| *b)
            })
            .await?;
        Ok(flags.iter().any(|b| *b))
    }

    /// False once any predicate miss is seen; remaining chunks are
    /// cancelled.
    pub async fn every(
        self: &Arc<Self>,
        predicate: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<bool, PoolError> {
        let flags = self
            .predicate_chunks(predicate, &items, &opts, |_, chunk| {
                chunk.iter().any(|b| !*b)
            })
            .await?;
        Ok(flags.len() == items.len() && flags.iter().all(|b| *b))
    }

    /// First item whose predicate returned true, in element order.
    pub async fn find(
        self: &Arc<Self>,
        predicate: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<Option<Value>, PoolError> {
        let flags = self
            .predicate_chunks(predicate, &items, &opts, |_, chunk| {
                chunk.iter().any(|b| *b)
            })
            .await?;
        Ok(flags
            .iter()
            .position(|b| *b)
            .and_then(|i| items.into_iter().nth(i)))
    }

    /// Count of predicate hits across all items.
    pub async fn count(
        self: &Arc<Self>,
        predicate: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<usize, PoolError> {
        let flags = self
            .predicate_chunks(predicate, &items, &opts, |_, _| false)
            .await?;
        Ok(flags.iter().filter(|b| **b).count())
    }

    /// Split items into `(hits, misses)` preserving order.
    pub async fn partition(
        self: &Arc<Self>,
        predicate: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<(Vec<Value>, Vec<Value>), PoolError> {
        let flags = self
            .predicate_chunks(predicate, &items, &opts, |_, _| false)
            .await?;
        let mut hits = Vec::new();
        let mut misses = Vec::new();
        for (item, keep) in items.into_iter().zip(flags) {
            if keep {
                hits.push(item);
            } else {
                misses.push(item);
            }
        }
        Ok((hits, misses))
    }

    /// Reduce chunks worker-side, then fold the partials with one final
    /// task over `[initial?, partial...]`.
    pub async fn reduce(
        self: &Arc<Self>,
        method: &str,
        items: Vec<Value>,
        initial: Option<Value>,
        opts: MapOptions,
    ) -> Result<Value, PoolError> {
        if items.is_empty() {
            return initial.ok_or_else(|| {
                PoolError::new(
                    ErrorKind::InvalidParams,
                    "reduce of empty input with no initial value",
                )
            });
        }
        let chunk_size = opts.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        let mut specs = Vec::new();
        for chunk in items.chunks(chunk_size) {
            specs.push(BatchTaskSpec::new(method, encode_chunk(chunk)?));
        }
        let results = self.exec_batch(specs, opts.batch.clone()).wait().await?;

        let mut partials = Vec::with_capacity(results.len() + 1);
        if let Some(initial) = initial {
            partials.push(initial);
        }
        for item in results {
            match (item.value, item.error) {
                (Some(bytes), _) => partials.push(
                    serde_json::from_slice(&bytes).map_err(|e| {
                        PoolError::new(ErrorKind::DeserializationFailed, e.to_string())
                    })?,
                ),
                (_, Some(err)) => return Err(err),
                _ => unreachable!("settled batch item has a value or an error"),
            }
        }
        if partials.len() == 1 {
            return Ok(partials.remove(0));
        }

        let fut = self
            .exec(method, encode_chunk(&partials)?, ExecOptions::default())
            .await?;
        let bytes = fut.await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PoolError::new(ErrorKind::DeserializationFailed, e.to_string()))
    }

    /// Group items by a worker-computed key (one string key per item).
    pub async fn group_by(
        self: &Arc<Self>,
        key_method: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<std::collections::HashMap<String, Vec<Value>>, PoolError> {
        let keys = self.map(key_method, items.clone(), opts).await?;
        let mut groups: std::collections::HashMap<String, Vec<Value>> =
            std::collections::HashMap::new();
        for (item, key) in items.into_iter().zip(keys) {
            let key = match key {
                Value::String(s) => s,
                other => other.to_string(),
            };
            groups.entry(key).or_default().push(item);
        }
        Ok(groups)
    }

    /// Map every item to an array and flatten, preserving element order.
    pub async fn flat_map(
        self: &Arc<Self>,
        method: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<Vec<Value>, PoolError> {
        let mapped = self.map(method, items, opts).await?;
        let mut out = Vec::with_capacity(mapped.len());
        for value in mapped {
            match value {
                Value::Array(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        Ok(out)
    }

    /// De-duplicate by a worker-computed key, keeping first occurrences.
    pub async fn unique(
        self: &Arc<Self>,
        key_method: &str,
        items: Vec<Value>,
        opts: MapOptions,
    ) -> Result<Vec<Value>, PoolError> {
        let keys = self.map(key_method, items.clone(), opts).await?;
        let mut seen = std::collections::HashSet::new();
        Ok(items
            .into_iter()
            .zip(keys)
            .filter_map(|(item, key)| seen.insert(key.to_string()).then_some(item))
            .collect())
    }

    /// Index of the first item equal to `needle`. Equality needs no worker
    /// code, so the scan stays local.
    pub fn index_of(&self, needle: &Value, items: &[Value]) -> Option<usize> {
        items.iter().position(|v| v == needle)
    }

    pub fn includes(&self, needle: &Value, items: &[Value]) -> bool {
        self.index_of(needle, items).is_some()
    }
}
