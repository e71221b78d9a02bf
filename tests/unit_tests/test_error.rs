// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use workerpool_rs::error::{ErrorKind, ExitDetail, PoolError, WorkerStack};

#[test]
fn test_codes_round_trip() {
    for kind in [
        ErrorKind::WorkerCrashed,
        ErrorKind::PoolQueueFull,
        ErrorKind::InvalidFrame,
        ErrorKind::DuplicateMessageId,
        ErrorKind::MethodNotFound,
        ErrorKind::Cancelled,
        ErrorKind::Timeout,
        ErrorKind::OutOfMemory,
        ErrorKind::BufferOverflow,
        ErrorKind::ChannelClosed,
        ErrorKind::Backpressure,
    ] {
        assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
    }
    assert_eq!(ErrorKind::from_code(9999), None);
}

#[test]
fn test_retryable_and_fatal_classes() {
    assert!(ErrorKind::WorkerCrashed.is_retryable());
    assert!(ErrorKind::Timeout.is_retryable());
    assert!(ErrorKind::ConnectionLost.is_retryable());
    assert!(!ErrorKind::MethodNotFound.is_retryable());
    assert!(!ErrorKind::PoolTerminated.is_retryable());

    assert!(ErrorKind::PoolTerminated.is_fatal());
    assert!(ErrorKind::OutOfMemory.is_fatal());
    assert!(ErrorKind::SharedMemoryUnavailable.is_fatal());
    assert!(!ErrorKind::Timeout.is_fatal());
}

#[test]
fn test_display_carries_code_and_exit_detail() {
    let err = PoolError::worker_terminated(ExitDetail {
        exit_code: Some(1),
        signal: None,
        script: Some("worker.js".into()),
    });
    let text = err.to_string();
    assert!(text.contains("103"), "display must carry the numeric code: {text}");
    assert!(text.contains("worker.js"), "display must carry exit detail: {text}");
}

#[test]
fn test_worker_stack_wire_round_trip() {
    let stack = WorkerStack::from_frames(["a", "b", "c"]);
    let wire = stack.to_wire();
    assert_eq!(WorkerStack::from_wire(&wire), Some(stack));
    assert_eq!(WorkerStack::from_wire(&[]), None);
}

#[test]
fn test_already_handled_preserves_kind() {
    let original = PoolError::cancelled();
    let wrapped = original.clone().already_handled();
    assert_eq!(wrapped.kind(), ErrorKind::Cancelled);
    assert!(wrapped.message().starts_with("already handled"));
}
