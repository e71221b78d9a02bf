// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use serial_test::serial;
use workerpool_rs::{
    cfg::enums::WorkerType,
    error::ErrorKind,
    pool::PoolBuilder,
    transport::local::LocalTransportFactory,
};

use crate::integration_tests::common::{
    CapturingFactory, build_pool, exec_json, from_json, math_registry, pool_config,
    register_gated_add, wait_until,
};

/// Seed scenario 7: a transport crash rejects the in-flight future with
/// WorkerTerminated, drops the handler, and the next exec spawns a fresh
/// worker that completes normally.
#[tokio::test]
#[serial]
async fn test_crash_rejects_inflight_and_pool_recovers() {
    let registry = math_registry();
    let gate = register_gated_add(&registry, "gated_add");
    let factory = Arc::new(CapturingFactory::new(Box::new(LocalTransportFactory::new(
        Arc::clone(&registry),
    ))));

    let pool = PoolBuilder::new(pool_config(2))
        .registry(Arc::clone(&registry))
        .factory(Arc::clone(&factory) as Arc<dyn workerpool_rs::transport::TransportFactory>)
        .build()
        .expect("pool builds");

    let inflight = exec_json(&pool, "gated_add", &vec![1i64, 2]).await;
    assert!(wait_until(|| pool.stats().active == 1).await);

    factory.kill_all();

    let err = inflight.await.expect_err("crashed mid-flight");
    assert_eq!(err.kind(), ErrorKind::WorkerTerminated);
    let exit = err.exit().expect("exit detail travels with the rejection");
    assert_eq!(exit.signal, Some(9));

    assert!(wait_until(|| pool.stats().total == 0).await);

    // Follow-up work spawns a replacement.
    let result = exec_json(&pool, "add", &vec![20i64, 1]).await.await.expect("sum");
    assert_eq!(from_json::<i64>(&result), 21);
    assert_eq!(pool.stats().total, 1);

    drop(gate);
    pool.terminate(true).await;
}

#[tokio::test]
async fn test_worker_type_process_is_unsupported_without_factory() {
    let err = PoolBuilder::new({
        let mut cfg = pool_config(1);
        cfg.worker_type = WorkerType::Process;
        cfg
    })
    .registry(math_registry())
    .build()
    .expect_err("no built-in process transport");
    assert_eq!(err.kind(), ErrorKind::WorkerTypeUnsupported);
}

#[tokio::test]
async fn test_crash_only_affects_one_handler() {
    let registry = math_registry();
    let gate = register_gated_add(&registry, "gated_add");
    let factory = Arc::new(CapturingFactory::new(Box::new(LocalTransportFactory::new(
        Arc::clone(&registry),
    ))));
    let pool = PoolBuilder::new(pool_config(2))
        .registry(Arc::clone(&registry))
        .factory(Arc::clone(&factory) as Arc<dyn workerpool_rs::transport::TransportFactory>)
        .build()
        .expect("pool builds");

    // Two in-flight tasks on two workers.
    let a = exec_json(&pool, "gated_add", &vec![1i64]).await;
    let b = exec_json(&pool, "gated_add", &vec![2i64]).await;
    assert!(wait_until(|| pool.stats().active == 2 && pool.stats().total == 2).await);

    // Kill only the first spawned transport.
    {
        let transports = factory.transports.lock().expect("transports");
        transports[0].kill();
    }

    let err = a.await.expect_err("first worker crashed");
    assert_eq!(err.kind(), ErrorKind::WorkerTerminated);

    // The second worker is untouched and finishes its task.
    gate.add_permits(2);
    assert_eq!(from_json::<i64>(&b.await.expect("second task")), 2);
    assert!(wait_until(|| pool.stats().total == 1).await);

    pool.terminate(true).await;
}

/// Follow-up submissions while zero workers exist must spawn rather than
/// sit in the queue.
#[tokio::test]
async fn test_spawn_on_demand_from_empty_pool() {
    let pool = build_pool(pool_config(4), math_registry());
    assert_eq!(pool.stats().total, 0);

    let mut futures = Vec::new();
    for i in 0..4i64 {
        futures.push(exec_json(&pool, "add", &vec![i, i]).await);
    }
    for (i, fut) in futures.into_iter().enumerate() {
        let value = from_json::<i64>(&fut.await.expect("sum"));
        assert_eq!(value, (i as i64) * 2);
    }
    assert!(pool.stats().total >= 1);

    pool.terminate(true).await;
}
