// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Semaphore;
use workerpool_rs::{
    cfg::enums::QueueStrategy,
    error::{ErrorKind, PoolError},
    pool::PoolBuilder,
    task::{ExecOptions, Task},
};

use crate::integration_tests::common::{
    from_json, json_bytes, math_registry, pool_config, wait_until,
};

/// Seed scenario 5: a custom priority queue keyed by `metadata.priority`
/// (lower number wins). The first task runs immediately; the rest
/// re-order behind it.
#[tokio::test]
async fn test_custom_priority_orders_queued_tasks() {
    let registry = math_registry();

    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    {
        let order = Arc::clone(&order);
        let gate = Arc::clone(&gate);
        registry.register("gated_record", move |_ctx, params| {
            let order = Arc::clone(&order);
            let gate = Arc::clone(&gate);
            async move {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| PoolError::new(ErrorKind::Aborted, e.to_string()))?;
                let value: i64 = serde_json::from_slice(&params)
                    .map_err(|e| PoolError::new(ErrorKind::InvalidParams, e.to_string()))?;
                order.lock().expect("order").push(value);
                Ok(Bytes::from(serde_json::to_vec(&value).expect("encode")))
            }
        });
    }
    {
        let order = Arc::clone(&order);
        registry.register_sync("record", move |_ctx, params| {
            let value: i64 = serde_json::from_slice(&params)
                .map_err(|e| PoolError::new(ErrorKind::InvalidParams, e.to_string()))?;
            order.lock().expect("order").push(value);
            Ok(Bytes::from(serde_json::to_vec(&value).expect("encode")))
        });
    }

    let mut cfg = pool_config(1);
    cfg.queue_strategy = QueueStrategy::Custom;
    let pool = PoolBuilder::new(cfg)
        .registry(registry)
        .custom_queue_key(Arc::new(|task: &Task| {
            // Lower metadata.priority means higher scheduling priority.
            -task
                .metadata
                .as_ref()
                .and_then(|m| m.get("priority"))
                .and_then(|p| p.as_i64())
                .unwrap_or(0)
        }))
        .build()
        .expect("pool builds");

    let with_priority = |prio: i64| ExecOptions {
        metadata: Some(serde_json::json!({ "priority": prio })),
        ..ExecOptions::default()
    };

    // Priority 5 dispatches immediately (the queue never sees it).
    let first = pool
        .exec("gated_record", json_bytes(&2i64), with_priority(5))
        .await
        .expect("admission");
    assert!(wait_until(|| pool.stats().active == 1).await);

    let mut rest = Vec::new();
    for (value, prio) in [(4i64, 3i64), (6, 1), (8, 2)] {
        rest.push(
            pool.exec("record", json_bytes(&value), with_priority(prio))
                .await
                .expect("admission"),
        );
    }
    assert_eq!(pool.stats().pending, 3);

    gate.add_permits(1);
    assert_eq!(from_json::<i64>(&first.await.expect("first")), 2);
    for fut in rest {
        let _ = fut.await.expect("queued task");
    }

    let seen = order.lock().expect("order").clone();
    assert_eq!(seen, vec![2, 6, 8, 4]);

    pool.terminate(true).await;
}

/// Built-in priority queue: higher `priority` field wins, ties are FIFO.
#[tokio::test]
async fn test_priority_queue_strategy_orders_by_task_priority() {
    let registry = math_registry();

    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    {
        let order = Arc::clone(&order);
        let gate = Arc::clone(&gate);
        registry.register("slow_record", move |_ctx, params| {
            let order = Arc::clone(&order);
            let gate = Arc::clone(&gate);
            async move {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| PoolError::new(ErrorKind::Aborted, e.to_string()))?;
                let value: i64 = serde_json::from_slice(&params)
                    .map_err(|e| PoolError::new(ErrorKind::InvalidParams, e.to_string()))?;
                order.lock().expect("order").push(value);
                Ok(Bytes::from(serde_json::to_vec(&value).expect("encode")))
            }
        });
    }

    let mut cfg = pool_config(1);
    cfg.queue_strategy = QueueStrategy::Priority;
    let pool = PoolBuilder::new(cfg)
        .registry(registry)
        .build()
        .expect("pool builds");

    let with_priority = |p: i32| ExecOptions {
        priority: p,
        ..ExecOptions::default()
    };

    let mut futures = vec![
        pool.exec("slow_record", json_bytes(&10i64), with_priority(0))
            .await
            .expect("admission"),
    ];
    assert!(wait_until(|| pool.stats().active == 1).await);

    for (value, prio) in [(20i64, 1), (30, 9), (40, 9), (50, 4)] {
        futures.push(
            pool.exec("slow_record", json_bytes(&value), with_priority(prio))
                .await
                .expect("admission"),
        );
    }

    gate.add_permits(5);
    for fut in futures {
        let _ = fut.await.expect("task");
    }
    let seen = order.lock().expect("order").clone();
    assert_eq!(seen, vec![10, 30, 40, 50, 20]);

    pool.terminate(true).await;
}
