// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed payload codecs for the frame bodies that have internal structure.
//!
//! Task responses and events carry opaque caller bytes and need no codec
//! here. Everything below is little-endian, matching the header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, PoolError, WorkerStack};

#[inline]
fn need(buf: &[u8], n: usize, what: &str) -> Result<(), PoolError> {
    if buf.len() < n {
        return Err(PoolError::new(
            ErrorKind::MissingField,
            format!("{what}: need {n} bytes, have {}", buf.len()),
        ));
    }
    Ok(())
}

#[inline]
fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// TaskRequest body: `[method_len:u16][method_bytes][params_bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequestBody {
    pub method: String,
    pub params: Bytes,
}

impl TaskRequestBody {
    pub fn new(method: impl Into<String>, params: Bytes) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<Bytes, PoolError> {
        let mlen = self.method.len();
        if mlen > u16::MAX as usize {
            return Err(PoolError::new(
                ErrorKind::SerializationFailed,
                format!("method name too long: {mlen} bytes"),
            ));
        }
        let mut out = BytesMut::with_capacity(2 + mlen + self.params.len());
        out.put_u16_le(mlen as u16);
        out.put_slice(self.method.as_bytes());
        out.put_slice(&self.params);
        Ok(out.freeze())
    }

    pub fn decode(buf: &Bytes) -> Result<Self, PoolError> {
        need(buf, 2, "task request method_len")?;
        let mlen = read_u16(buf, 0) as usize;
        need(buf, 2 + mlen, "task request method")?;
        let method = std::str::from_utf8(&buf[2..2 + mlen])
            .map_err(|e| {
                PoolError::new(
                    ErrorKind::DeserializationFailed,
                    format!("method name is not UTF-8: {e}"),
                )
            })?
            .to_owned();
        Ok(Self {
            method,
            params: buf.slice(2 + mlen..),
        })
    }
}

/// TaskError body:
/// `[error_code:u32][msg_len:u16][msg][stack_len:u16][stack]`.
///
/// The stack segment is the structural serialisation of [`WorkerStack`];
/// an empty segment means the worker attached none.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskErrorBody {
    pub error_code: u32,
    pub message: String,
    pub stack: Option<WorkerStack>,
}

impl TaskErrorBody {
    pub fn from_error(err: &PoolError) -> Self {
        Self {
            error_code: err.code(),
            message: err.message().to_owned(),
            stack: err.stack().cloned(),
        }
    }

    pub fn into_error(self) -> PoolError {
        let kind =
            ErrorKind::from_code(self.error_code).unwrap_or(ErrorKind::InternalError);
        let err = PoolError::new(kind, self.message);
        match self.stack {
            Some(stack) => err.with_stack(stack),
            None => err,
        }
    }

    pub fn encode(&self) -> Result<Bytes, PoolError> {
        let stack = self.stack.as_ref().map(WorkerStack::to_wire).unwrap_or_default();
        if self.message.len() > u16::MAX as usize || stack.len() > u16::MAX as usize {
            return Err(PoolError::new(
                ErrorKind::SerializationFailed,
                "error message or stack exceeds u16 length",
            ));
        }
        let mut out = BytesMut::with_capacity(4 + 2 + self.message.len() + 2 + stack.len());
        out.put_u32_le(self.error_code);
        out.put_u16_le(self.message.len() as u16);
        out.put_slice(self.message.as_bytes());
        out.put_u16_le(stack.len() as u16);
        out.put_slice(&stack);
        Ok(out.freeze())
    }

    pub fn decode(buf: &Bytes) -> Result<Self, PoolError> {
        need(buf, 6, "task error header")?;
        let error_code = read_u32(buf, 0);
        let mlen = read_u16(buf, 4) as usize;
        need(buf, 6 + mlen + 2, "task error message")?;
        let message = String::from_utf8_lossy(&buf[6..6 + mlen]).into_owned();
        let slen = read_u16(buf, 6 + mlen) as usize;
        need(buf, 6 + mlen + 2 + slen, "task error stack")?;
        let stack = WorkerStack::from_wire(&buf[6 + mlen + 2..6 + mlen + 2 + slen]);
        Ok(Self {
            error_code,
            message,
            stack,
        })
    }
}

/// Heartbeat response body:
/// `[status:u8][task_count:u32][mem_usage:u64][uptime_ms:u64]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResBody {
    pub status: u8,
    pub task_count: u32,
    pub mem_usage: u64,
    pub uptime_ms: u64,
}

impl HeartbeatResBody {
    pub const STATUS_OK: u8 = 0;
    pub const STATUS_DEGRADED: u8 = 1;

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + 4 + 8 + 8);
        out.put_u8(self.status);
        out.put_u32_le(self.task_count);
        out.put_u64_le(self.mem_usage);
        out.put_u64_le(self.uptime_ms);
        out.freeze()
    }

    pub fn decode(buf: &Bytes) -> Result<Self, PoolError> {
        need(buf, 21, "heartbeat response")?;
        Ok(Self {
            status: buf[0],
            task_count: read_u32(buf, 1),
            mem_usage: read_u64(buf, 5),
            uptime_ms: read_u64(buf, 13),
        })
    }
}

