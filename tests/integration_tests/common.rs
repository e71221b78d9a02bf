// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Semaphore;
use workerpool_rs::{
    cfg::config::{MinWorkers, PoolConfig},
    error::{ErrorKind, PoolError},
    pool::{Pool, PoolBuilder},
    task::ExecOptions,
    transport::{SpawnedWorker, Transport, TransportFactory, WorkerOptions},
    worker::MethodRegistry,
};

pub fn json_bytes<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).expect("serialize test payload"))
}

pub fn from_json<T: DeserializeOwned>(bytes: &Bytes) -> T {
    serde_json::from_slice(bytes).expect("deserialize test payload")
}

fn ser_err(e: impl std::fmt::Display) -> PoolError {
    PoolError::new(ErrorKind::SerializationFailed, e.to_string())
}

/// Registry with the arithmetic helpers most tests share.
pub fn math_registry() -> Arc<MethodRegistry> {
    let registry = Arc::new(MethodRegistry::new());

    registry.register_sync("add", |_ctx, params| {
        let v: Vec<i64> =
            serde_json::from_slice(&params).map_err(ser_err)?;
        let sum: i64 = v.iter().sum();
        serde_json::to_vec(&sum).map(Bytes::from).map_err(ser_err)
    });

    registry.register_sync("one", |_ctx, _params| {
        serde_json::to_vec(&1i64).map(Bytes::from).map_err(ser_err)
    });

    registry.register_sync("echo", |_ctx, params| Ok(params));

    registry.register_sync("double", |_ctx, params| {
        let v: Vec<i64> =
            serde_json::from_slice(&params).map_err(ser_err)?;
        let doubled: Vec<i64> = v.iter().map(|x| x * 2).collect();
        serde_json::to_vec(&doubled).map(Bytes::from).map_err(ser_err)
    });

    registry.register_sync("is_even", |_ctx, params| {
        let v: Vec<i64> =
            serde_json::from_slice(&params).map_err(ser_err)?;
        let flags: Vec<bool> = v.iter().map(|x| x % 2 == 0).collect();
        serde_json::to_vec(&flags).map(Bytes::from).map_err(ser_err)
    });

    registry.register_sync("sum_chunk", |_ctx, params| {
        let v: Vec<i64> =
            serde_json::from_slice(&params).map_err(ser_err)?;
        let sum: i64 = v.iter().sum();
        serde_json::to_vec(&sum).map(Bytes::from).map_err(ser_err)
    });

    registry.register_sync("fail", |_ctx, _params| {
        Err(PoolError::new(ErrorKind::ExecutionFailed, "deliberate failure"))
    });

    registry.register("sleep_ms", |_ctx, params| async move {
        let ms: u64 = serde_json::from_slice(&params).map_err(ser_err)?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        serde_json::to_vec(&ms).map(Bytes::from).map_err(ser_err)
    });

    // Runs forever and registers an abort hook that never finishes, so a
    // cleanup can only end with a worker force-kill.
    registry.register("stubborn", |ctx, _params| async move {
        ctx.on_abort(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Bytes::new())
    });

    registry
}

/// Add a gate-controlled method: each invocation waits for one permit on
/// the returned semaphore, then behaves like `add`.
pub fn register_gated_add(registry: &MethodRegistry, name: &str) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    let handle = Arc::clone(&gate);
    registry.register(name, move |_ctx, params| {
        let gate = Arc::clone(&handle);
        async move {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| PoolError::new(ErrorKind::Aborted, e.to_string()))?;
            let v: Vec<i64> =
                serde_json::from_slice(&params).map_err(ser_err)?;
            let sum: i64 = v.iter().sum();
            serde_json::to_vec(&sum).map(Bytes::from).map_err(ser_err)
        }
    });
    gate
}

/// Add a method that appends its parameter to the shared log before
/// returning it, so tests can observe completion order.
pub fn register_recording(
    registry: &MethodRegistry,
    name: &str,
) -> Arc<Mutex<Vec<i64>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = Arc::clone(&log);
    registry.register_sync(name, move |_ctx, params| {
        let value: i64 =
            serde_json::from_slice(&params).map_err(ser_err)?;
        handle.lock().expect("order log").push(value);
        serde_json::to_vec(&value).map(Bytes::from).map_err(ser_err)
    });
    log
}

pub fn pool_config(max_workers: usize) -> PoolConfig {
    PoolConfig {
        min_workers: MinWorkers::Count(0),
        max_workers,
        worker_terminate_timeout: Duration::from_millis(300),
        ..PoolConfig::default()
    }
}

pub fn build_pool(cfg: PoolConfig, registry: Arc<MethodRegistry>) -> Arc<Pool> {
    PoolBuilder::new(cfg)
        .registry(registry)
        .build()
        .expect("pool builds")
}

pub async fn exec_json<T: Serialize>(
    pool: &Arc<Pool>,
    method: &str,
    value: &T,
) -> workerpool_rs::task::future::ResultFuture {
    pool.exec(method, json_bytes(value), ExecOptions::default())
        .await
        .expect("admission")
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Factory wrapper that keeps a handle to every spawned transport so
/// tests can crash workers from outside.
pub struct CapturingFactory {
    inner: Box<dyn TransportFactory>,
    pub transports: Mutex<Vec<Arc<dyn Transport>>>,
}

impl CapturingFactory {
    pub fn new(inner: Box<dyn TransportFactory>) -> Self {
        Self {
            inner,
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn kill_all(&self) {
        for transport in self.transports.lock().expect("transports").iter() {
            transport.kill();
        }
    }
}

impl TransportFactory for CapturingFactory {
    fn spawn(&self, opts: &WorkerOptions) -> Result<SpawnedWorker, PoolError> {
        let spawned = self.inner.spawn(opts)?;
        self.transports
            .lock()
            .expect("transports")
            .push(Arc::clone(&spawned.transport));
        Ok(spawned)
    }
}
