// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::{Value, json};
use workerpool_rs::{
    batch::{BatchOptions, BatchTaskSpec, MapOptions},
    error::ErrorKind,
};

use crate::integration_tests::common::{
    build_pool, from_json, json_bytes, math_registry, pool_config,
};

fn specs_for_pairs(pairs: &[[i64; 2]]) -> Vec<BatchTaskSpec> {
    pairs
        .iter()
        .map(|p| BatchTaskSpec::new("add", json_bytes(&p.to_vec())))
        .collect()
}

#[tokio::test]
async fn test_exec_batch_preserves_order() {
    let pool = build_pool(pool_config(4), math_registry());
    let results = pool
        .exec_batch(
            specs_for_pairs(&[[3, 4], [2, 3], [5, 7], [1, 1]]),
            BatchOptions::default(),
        )
        .wait()
        .await
        .expect("batch");

    assert_eq!(results.len(), 4);
    let values: Vec<i64> = results
        .iter()
        .map(|r| {
            assert!(r.success, "item {} failed: {:?}", r.index, r.error);
            from_json(r.value.as_ref().expect("value"))
        })
        .collect();
    assert_eq!(values, vec![7, 5, 12, 2]);
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.index, i);
    }

    pool.terminate(true).await;
}

#[tokio::test]
async fn test_exec_batch_fail_fast_stops_issuing() {
    let pool = build_pool(pool_config(1), math_registry());
    let mut specs = specs_for_pairs(&[[1, 1], [2, 2]]);
    specs.insert(1, BatchTaskSpec::new("fail", json_bytes(&())));
    for i in 0..6i64 {
        specs.push(BatchTaskSpec::new("add", json_bytes(&vec![i, i])));
    }

    let results = pool
        .exec_batch(
            specs,
            BatchOptions {
                concurrency: Some(1),
                fail_fast: true,
                ..BatchOptions::default()
            },
        )
        .wait()
        .await
        .expect("batch");

    assert!(results[0].success);
    let failure = results[1].error.as_ref().expect("deliberate failure");
    assert_eq!(failure.kind(), ErrorKind::ExecutionFailed);
    // Everything after the failure was never issued.
    assert!(
        results[2..].iter().all(|r| {
            r.error.as_ref().map(workerpool_rs::error::PoolError::kind)
                == Some(ErrorKind::Cancelled)
        }),
        "later sub-tasks must be cancelled"
    );

    pool.terminate(true).await;
}

/// With two sub-tasks genuinely in flight, the one that outlives the
/// fail-fast trip keeps running but its late result is discarded instead
/// of being reported as a success.
#[tokio::test]
async fn test_exec_batch_fail_fast_discards_inflight_results() {
    let pool = build_pool(pool_config(2), math_registry());
    let mut specs = vec![
        BatchTaskSpec::new("sleep_ms", json_bytes(&400u64)),
        BatchTaskSpec::new("fail", json_bytes(&())),
    ];
    for i in 0..4i64 {
        specs.push(BatchTaskSpec::new("add", json_bytes(&vec![i, i])));
    }

    let results = pool
        .exec_batch(
            specs,
            BatchOptions {
                concurrency: Some(2),
                fail_fast: true,
                ..BatchOptions::default()
            },
        )
        .wait()
        .await
        .expect("batch");

    // The genuine first failure is reported as such.
    let failure = results[1].error.as_ref().expect("deliberate failure");
    assert_eq!(failure.kind(), ErrorKind::ExecutionFailed);

    // The slow task was in flight when fail-fast tripped: it ran to
    // completion (its duration proves it) but its success is discarded.
    assert!(!results[0].success, "late in-flight result must be discarded");
    assert_eq!(
        results[0].error.as_ref().map(workerpool_rs::error::PoolError::kind),
        Some(ErrorKind::Cancelled)
    );
    assert!(
        results[0].duration >= Duration::from_millis(300),
        "the in-flight task keeps running after the trip, got {:?}",
        results[0].duration
    );

    // Everything behind the failure was never issued.
    assert!(
        results[2..].iter().all(|r| {
            r.error.as_ref().map(workerpool_rs::error::PoolError::kind)
                == Some(ErrorKind::Cancelled)
        }),
        "later sub-tasks must be cancelled"
    );

    pool.terminate(true).await;
}

#[tokio::test]
async fn test_exec_batch_progress_throttled_and_final() {
    let pool = build_pool(pool_config(2), math_registry());
    let snapshots: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);

    let results = pool
        .exec_batch(
            specs_for_pairs(&[[1, 1]; 12]),
            BatchOptions {
                progress: Some(Arc::new(move |p| {
                    sink.lock().expect("progress").push((p.completed, p.total));
                })),
                progress_throttle: Some(Duration::from_millis(1)),
                ..BatchOptions::default()
            },
        )
        .wait()
        .await
        .expect("batch");

    assert_eq!(results.len(), 12);
    let seen = snapshots.lock().expect("progress").clone();
    assert!(!seen.is_empty(), "progress must fire");
    // The forced final emission reports the finished batch.
    assert_eq!(seen.last().copied(), Some((12, 12)));

    pool.terminate(true).await;
}

#[tokio::test]
async fn test_exec_batch_timeout_aborts() {
    let pool = build_pool(pool_config(1), math_registry());
    let specs = vec![
        BatchTaskSpec::new("sleep_ms", json_bytes(&10_000u64)),
        BatchTaskSpec::new("sleep_ms", json_bytes(&10_000u64)),
    ];
    let err = pool
        .exec_batch(
            specs,
            BatchOptions {
                batch_timeout: Some(Duration::from_millis(120)),
                ..BatchOptions::default()
            },
        )
        .wait()
        .await
        .expect_err("batch must abort");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    pool.terminate(true).await;
}

#[tokio::test]
async fn test_exec_batch_pause_resume_cancel() {
    let pool = build_pool(pool_config(1), math_registry());
    let specs: Vec<BatchTaskSpec> = (0..8)
        .map(|_| BatchTaskSpec::new("sleep_ms", json_bytes(&40u64)))
        .collect();
    let handle = pool.exec_batch(
        specs,
        BatchOptions {
            concurrency: Some(1),
            ..BatchOptions::default()
        },
    );

    handle.pause();
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.resume();
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.cancel();

    let results = handle.wait().await.expect("cancelled batch still reports");
    assert_eq!(results.len(), 8);
    let cancelled = results
        .iter()
        .filter(|r| {
            r.error.as_ref().map(workerpool_rs::error::PoolError::kind)
                == Some(ErrorKind::Cancelled)
        })
        .count();
    assert!(cancelled > 0, "cancel must reach pending sub-tasks");

    pool.terminate(true).await;
}

#[tokio::test]
async fn test_map_chunks_preserve_element_order() {
    let pool = build_pool(pool_config(3), math_registry());
    let items: Vec<Value> = (0..250i64).map(|i| json!(i)).collect();
    let mapped = pool
        .map(
            "double",
            items,
            MapOptions {
                chunk_size: Some(100),
                ..MapOptions::default()
            },
        )
        .await
        .expect("map");

    assert_eq!(mapped.len(), 250);
    for (i, value) in mapped.iter().enumerate() {
        assert_eq!(value.as_i64(), Some(i as i64 * 2));
    }
    pool.terminate(true).await;
}

#[tokio::test]
async fn test_reduce_sums_chunks_then_partials() {
    let pool = build_pool(pool_config(2), math_registry());
    let items: Vec<Value> = (1..=100i64).map(|i| json!(i)).collect();
    let total = pool
        .reduce(
            "sum_chunk",
            items,
            None,
            MapOptions {
                chunk_size: Some(30),
                ..MapOptions::default()
            },
        )
        .await
        .expect("reduce");
    assert_eq!(total.as_i64(), Some(5050));
    pool.terminate(true).await;
}

#[tokio::test]
async fn test_filter_some_every_find_count_partition() {
    let pool = build_pool(pool_config(2), math_registry());
    let items: Vec<Value> = (0..40i64).map(|i| json!(i)).collect();
    let opts = || MapOptions {
        chunk_size: Some(8),
        ..MapOptions::default()
    };

    let evens = pool
        .filter("is_even", items.clone(), opts())
        .await
        .expect("filter");
    assert_eq!(evens.len(), 20);
    assert!(evens.iter().all(|v| v.as_i64().is_some_and(|x| x % 2 == 0)));

    assert!(pool.some("is_even", items.clone(), opts()).await.expect("some"));
    assert!(!pool.every("is_even", items.clone(), opts()).await.expect("every"));

    let first_even = pool
        .find("is_even", items.clone(), opts())
        .await
        .expect("find");
    assert_eq!(first_even.and_then(|v| v.as_i64()), Some(0));

    assert_eq!(
        pool.count("is_even", items.clone(), opts()).await.expect("count"),
        20
    );

    let (evens, odds) = pool
        .partition("is_even", items.clone(), opts())
        .await
        .expect("partition");
    assert_eq!((evens.len(), odds.len()), (20, 20));

    assert_eq!(pool.index_of(&json!(7), &items), Some(7));
    assert!(pool.includes(&json!(39), &items));
    assert!(!pool.includes(&json!(40), &items));

    pool.terminate(true).await;
}

#[tokio::test]
async fn test_group_by_flat_map_unique() {
    let registry = math_registry();
    registry.register_sync("explode", |_ctx, params| {
        let v: Vec<i64> = serde_json::from_slice(&params).map_err(|e| {
            workerpool_rs::error::PoolError::new(
                ErrorKind::InvalidParams,
                e.to_string(),
            )
        })?;
        let exploded: Vec<Vec<i64>> = v.iter().map(|x| vec![*x, *x]).collect();
        serde_json::to_vec(&exploded)
            .map(bytes::Bytes::from)
            .map_err(|e| {
                workerpool_rs::error::PoolError::new(
                    ErrorKind::SerializationFailed,
                    e.to_string(),
                )
            })
    });
    let pool = build_pool(pool_config(2), registry);

    let flattened = pool
        .flat_map(
            "explode",
            vec![json!(1), json!(2)],
            MapOptions::default(),
        )
        .await
        .expect("flat_map");
    assert_eq!(flattened, vec![json!(1), json!(1), json!(2), json!(2)]);

    let items: Vec<Value> = vec![json!(1), json!(1), json!(2), json!(3), json!(2)];
    let unique = pool
        .unique("double", items.clone(), MapOptions::default())
        .await
        .expect("unique");
    assert_eq!(unique, vec![json!(1), json!(2), json!(3)]);

    let groups = pool
        .group_by("double", items, MapOptions::default())
        .await
        .expect("group_by");
    assert_eq!(groups.get("2").map(Vec::len), Some(2));
    assert_eq!(groups.get("4").map(Vec::len), Some(2));
    assert_eq!(groups.get("6").map(Vec::len), Some(1));

    pool.terminate(true).await;
}
