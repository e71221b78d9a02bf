// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use hex_literal::hex;
use workerpool_rs::{
    error::{ErrorKind, PoolError, WorkerStack},
    frame::{
        codec::{Frame, FrameBuilder},
        header::{FRAME_MAGIC, FRAME_VERSION, FrameFlags, HEADER_LEN},
        msg_type::MsgType,
        payload::{HeartbeatResBody, TaskErrorBody, TaskRequestBody},
    },
};

#[test]
fn test_header_wire_layout() -> Result<()> {
    let frame = FrameBuilder::new(MsgType::TaskRequest, 0x0102_0304)
        .sequence(0x0A0B_0C0D)
        .priority(7)
        .flags(FrameFlags::COMPRESSED)
        .payload(Bytes::from_static(b"xy"))
        .build()?;
    let wire = frame.encode();

    // magic "WP" LE, version 2, type 1, flags 0x02, priority 7,
    // message_id, payload_length=2, sequence, reserved.
    let expected = hex!(
        "50 57" "02" "01" "02" "07" "04 03 02 01" "02 00 00 00" "0d 0c 0b 0a" "00 00"
    );
    assert_eq!(&wire[..HEADER_LEN], &expected[..]);
    assert_eq!(&wire[HEADER_LEN..], b"xy");
    Ok(())
}

#[test]
fn test_encode_decode_round_trip() -> Result<()> {
    let payload = Bytes::from(vec![0xAB; 300]);
    let frame = FrameBuilder::new(MsgType::TaskResponse, 42)
        .sequence(9)
        .priority(255)
        .payload(payload.clone())
        .build()?;

    let decoded = Frame::decode(&frame.encode())?;
    let header = decoded.header_view()?;
    assert_eq!(header.magic.get(), FRAME_MAGIC);
    assert_eq!(header.version, FRAME_VERSION);
    assert_eq!(decoded.msg_type()?, MsgType::TaskResponse);
    assert_eq!(decoded.message_id()?, 42);
    assert_eq!(header.sequence.get(), 9);
    assert_eq!(header.priority, 255);
    assert_eq!(decoded.payload(), &payload);
    Ok(())
}

#[test]
fn test_decode_rejects_bad_magic() -> Result<()> {
    let frame = FrameBuilder::new(MsgType::TaskRequest, 1).build()?;
    let mut wire = frame.encode().to_vec();
    wire[0] = 0xFF;
    let err = Frame::decode(&Bytes::from(wire)).expect_err("magic must be checked");
    assert_eq!(err.kind(), ErrorKind::InvalidFrame);
    Ok(())
}

#[test]
fn test_decode_rejects_foreign_version() -> Result<()> {
    let frame = FrameBuilder::new(MsgType::TaskRequest, 1).build()?;
    let mut wire = frame.encode().to_vec();
    wire[2] = 9;
    let err = Frame::decode(&Bytes::from(wire)).expect_err("version must be checked");
    assert_eq!(err.kind(), ErrorKind::InvalidFrame);
    Ok(())
}

#[test]
fn test_decode_rejects_unknown_msg_type() -> Result<()> {
    let frame = FrameBuilder::new(MsgType::TaskRequest, 1).build()?;
    let mut wire = frame.encode().to_vec();
    wire[3] = 0x7F;
    let err = Frame::decode(&Bytes::from(wire)).expect_err("type must be known");
    assert_eq!(err.kind(), ErrorKind::InvalidFrame);
    Ok(())
}

#[test]
fn test_decode_rejects_truncated_payload() -> Result<()> {
    let frame = FrameBuilder::new(MsgType::TaskRequest, 1)
        .payload(Bytes::from_static(b"0123456789"))
        .build()?;
    let wire = frame.encode();
    let err = Frame::decode(&wire.slice(..wire.len() - 4))
        .expect_err("declared length exceeds buffer");
    assert_eq!(err.kind(), ErrorKind::InvalidFrame);
    Ok(())
}

#[test]
fn test_decode_ignores_trailing_bytes() -> Result<()> {
    let frame = FrameBuilder::new(MsgType::Event, 5)
        .payload(Bytes::from_static(b"ab"))
        .build()?;
    let mut wire = frame.encode().to_vec();
    wire.extend_from_slice(b"junk");
    let decoded = Frame::decode(&Bytes::from(wire))?;
    assert_eq!(decoded.payload().as_ref(), b"ab");
    Ok(())
}

#[test]
fn test_task_request_body_round_trip() -> Result<(), PoolError> {
    let body = TaskRequestBody::new("add", Bytes::from_static(b"[3,4]"));
    let decoded = TaskRequestBody::decode(&body.encode()?)?;
    assert_eq!(decoded.method, "add");
    assert_eq!(decoded.params.as_ref(), b"[3,4]");
    Ok(())
}

#[test]
fn test_task_request_body_wire_layout() -> Result<(), PoolError> {
    let body = TaskRequestBody::new("ab", Bytes::from_static(b"p"));
    // [method_len:u16 le][method][params]
    assert_eq!(body.encode()?.as_ref(), &hex!("02 00 61 62 70")[..]);
    Ok(())
}

#[test]
fn test_task_error_body_round_trip() -> Result<(), PoolError> {
    let err = PoolError::new(ErrorKind::ExecutionFailed, "boom")
        .with_stack(WorkerStack::from_frames(["worker.rs:10", "job.rs:3"]));
    let body = TaskErrorBody::from_error(&err);
    let decoded = TaskErrorBody::decode(&body.encode()?)?;
    assert_eq!(decoded.error_code, ErrorKind::ExecutionFailed.code());
    assert_eq!(decoded.message, "boom");
    let restored = decoded.into_error();
    assert_eq!(restored.kind(), ErrorKind::ExecutionFailed);
    assert_eq!(
        restored.stack().map(|s| s.frames.clone()),
        Some(vec!["worker.rs:10".to_string(), "job.rs:3".to_string()])
    );
    Ok(())
}

#[test]
fn test_task_error_body_without_stack() -> Result<(), PoolError> {
    let body = TaskErrorBody::from_error(&PoolError::method_not_found("nope"));
    let decoded = TaskErrorBody::decode(&body.encode()?)?;
    assert!(decoded.stack.is_none());
    assert_eq!(decoded.into_error().kind(), ErrorKind::MethodNotFound);
    Ok(())
}

#[test]
fn test_heartbeat_body_round_trip() -> Result<(), PoolError> {
    let body = HeartbeatResBody {
        status: HeartbeatResBody::STATUS_OK,
        task_count: 3,
        mem_usage: 1 << 33,
        uptime_ms: 12_345,
    };
    let decoded = HeartbeatResBody::decode(&body.encode())?;
    assert_eq!(decoded, body);
    Ok(())
}

#[test]
fn test_short_bodies_are_missing_field() {
    let short = Bytes::from_static(b"\x01");
    assert_eq!(
        TaskRequestBody::decode(&short).expect_err("short").kind(),
        ErrorKind::MissingField
    );
    assert_eq!(
        HeartbeatResBody::decode(&short).expect_err("short").kind(),
        ErrorKind::MissingField
    );
}
