// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use workerpool_rs::{error::ErrorKind, task::ExecOptions};

use crate::integration_tests::common::{
    build_pool, exec_json, from_json, json_bytes, math_registry, pool_config,
    register_gated_add, wait_until,
};

#[tokio::test]
async fn test_terminate_twice_is_idempotent() {
    let pool = build_pool(pool_config(2), math_registry());
    let _ = exec_json(&pool, "add", &vec![1i64, 2]).await.await.expect("sum");

    pool.terminate(false).await;
    // The second call resolves the same completed termination.
    pool.terminate(false).await;
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test]
async fn test_exec_after_terminate_rejects() {
    let pool = build_pool(pool_config(1), math_registry());
    pool.terminate(false).await;

    let err = pool
        .exec("add", json_bytes(&vec![1i64, 1]), ExecOptions::default())
        .await
        .expect_err("pool is gone");
    assert_eq!(err.kind(), ErrorKind::PoolTerminated);
}

#[tokio::test]
async fn test_force_terminate_rejects_queued_and_inflight() {
    let registry = math_registry();
    let gate = register_gated_add(&registry, "gated_add");
    let pool = build_pool(pool_config(1), registry);

    let inflight = exec_json(&pool, "gated_add", &vec![1i64]).await;
    assert!(wait_until(|| pool.stats().active == 1).await);
    let queued = exec_json(&pool, "add", &vec![2i64, 2]).await;

    pool.terminate(true).await;

    let queued_err = queued.await.expect_err("queued task dies with the pool");
    assert_eq!(queued_err.kind(), ErrorKind::PoolTerminated);

    let inflight_err = inflight.await.expect_err("in-flight task dies with the pool");
    assert_eq!(inflight_err.kind(), ErrorKind::WorkerTerminated);

    assert_eq!(pool.stats().total, 0);
    drop(gate);
}

#[tokio::test]
async fn test_graceful_terminate_drains_inflight() {
    let registry = math_registry();
    let gate = register_gated_add(&registry, "gated_add");
    let pool = build_pool(pool_config(1), registry);

    let inflight = exec_json(&pool, "gated_add", &vec![20i64, 1]).await;
    assert!(wait_until(|| pool.stats().active == 1).await);

    // Let the worker finish while the graceful drain is waiting.
    gate.add_permits(1);
    pool.terminate(false).await;

    assert_eq!(from_json::<i64>(&inflight.await.expect("drained result")), 21);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test]
async fn test_stats_identity_holds() {
    let registry = math_registry();
    let gate = register_gated_add(&registry, "gated_add");
    let pool = build_pool(pool_config(3), registry);

    let mut futures = Vec::new();
    for i in 0..5i64 {
        futures.push(exec_json(&pool, "gated_add", &vec![i]).await);
    }
    assert!(wait_until(|| pool.stats().active == 3).await);

    let s = pool.stats();
    assert_eq!(s.busy + s.idle, s.total);
    assert!(s.active <= s.total);
    assert_eq!(s.pending, 2);

    gate.add_permits(5);
    for fut in futures {
        let _ = fut.await.expect("task");
    }
    let s = pool.stats();
    assert_eq!(s.busy + s.idle, s.total);
    assert_eq!(s.pending, 0);

    pool.terminate(true).await;
}
