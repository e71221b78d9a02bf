// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use workerpool_rs::{
    error::ErrorKind,
    queue::shared_ring::{RingEntry, SharedRingQueue},
};

#[test]
fn test_ring_entry_packing() {
    let entry = RingEntry {
        slot_index: 0xDEAD_BEEF,
        priority: 0x0000_00FF,
    };
    assert_eq!(RingEntry::unpack(entry.pack()), entry);
}

#[test]
fn test_ring_rejects_non_power_of_two() {
    let err = SharedRingQueue::create(6).expect_err("6 is not a power of two");
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
}

#[test]
fn test_ring_push_pop_order() {
    let ring = SharedRingQueue::create(8).expect("create");
    for i in 0..5u32 {
        ring.push(RingEntry {
            slot_index: i,
            priority: i * 10,
        })
        .expect("push");
    }
    assert_eq!(ring.len(), 5);
    for i in 0..5u32 {
        let entry = ring.pop().expect("pop");
        assert_eq!(entry.slot_index, i);
        assert_eq!(entry.priority, i * 10);
    }
    assert!(ring.pop().is_none());
    assert!(ring.is_empty());
}

#[test]
fn test_ring_full_fails_and_recovers() {
    let ring = SharedRingQueue::create(4).expect("create");
    for i in 0..4u32 {
        ring.push(RingEntry {
            slot_index: i,
            priority: 0,
        })
        .expect("push");
    }
    // Full: the failed push must not disturb the cursors.
    let err = ring
        .push(RingEntry {
            slot_index: 99,
            priority: 0,
        })
        .expect_err("ring is full");
    assert_eq!(err.kind(), ErrorKind::Backpressure);
    assert_eq!(ring.len(), 4);

    assert_eq!(ring.pop().expect("pop").slot_index, 0);
    ring.push(RingEntry {
        slot_index: 4,
        priority: 0,
    })
    .expect("slot freed");
    assert_eq!(ring.len(), 4);
}

#[test]
fn test_ring_wraps_many_times() {
    let ring = SharedRingQueue::create(2).expect("create");
    for i in 0..1000u32 {
        ring.push(RingEntry {
            slot_index: i,
            priority: 0,
        })
        .expect("push");
        assert_eq!(ring.pop().expect("pop").slot_index, i);
    }
    assert!(ring.is_empty());
}

#[test]
fn test_ring_clear() {
    let ring = SharedRingQueue::create(8).expect("create");
    for i in 0..6u32 {
        ring.push(RingEntry {
            slot_index: i,
            priority: 0,
        })
        .expect("push");
    }
    ring.clear();
    assert!(ring.is_empty());
    assert!(ring.pop().is_none());
}

#[test]
fn test_ring_spsc_threads() {
    let ring = std::sync::Arc::new(SharedRingQueue::create(16).expect("create"));
    let producer = {
        let ring = std::sync::Arc::clone(&ring);
        std::thread::spawn(move || {
            let mut sent = 0u32;
            while sent < 500 {
                if ring
                    .push(RingEntry {
                        slot_index: sent,
                        priority: sent,
                    })
                    .is_ok()
                {
                    sent += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        })
    };
    let mut seen = Vec::new();
    while seen.len() < 500 {
        match ring.pop() {
            Some(entry) => seen.push(entry.slot_index),
            None => std::thread::yield_now(),
        }
    }
    producer.join().expect("producer");
    let expected: Vec<u32> = (0..500).collect();
    assert_eq!(seen, expected);
}
