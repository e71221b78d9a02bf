// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod codec;
pub mod header;
pub mod msg_type;
pub mod payload;

/// Single-string control message meaning "worker must exit".
pub const METHOD_TERMINATE: &str = "__workerpool-terminate__";
/// In the `method` field of a TaskRequest frame: abort the in-flight task
/// with this request id.
pub const METHOD_CLEANUP: &str = "__workerpool-cleanup__";
/// Liveness probe; the reply carries status, task count, memory, uptime.
pub const METHOD_HEARTBEAT: &str = "__workerpool-heartbeat__";

/// The first post-spawn message whose bytes equal this literal marks the
/// worker ready, regardless of encoding.
pub const READY_SIGNAL: &[u8] = b"ready";
