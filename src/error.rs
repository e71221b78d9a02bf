// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Machine-readable error codes shared between the pool and its workers.
///
/// Codes travel inside TaskError frames (`error_code: u32`), so the numeric
/// values are part of the wire contract and must stay stable.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // Worker kind (1xx)
    WorkerCrashed = 100,
    WorkerInitFailed = 101,
    WorkerUnresponsive = 102,
    WorkerTerminated = 103,
    NoWorkersAvailable = 104,
    PoolTerminated = 105,
    PoolQueueFull = 106,
    WorkerSpawnFailed = 107,
    WorkerTypeUnsupported = 108,

    // Protocol kind (2xx)
    InvalidFrame = 200,
    UnknownMessageType = 201,
    VersionMismatch = 202,
    MessageTooLarge = 203,
    SerializationFailed = 204,
    DeserializationFailed = 205,
    MissingField = 206,
    DuplicateMessageId = 207,

    // Task kind (3xx)
    MethodNotFound = 300,
    InvalidParams = 301,
    ExecutionFailed = 302,
    Cancelled = 303,
    Timeout = 304,
    FunctionSerializeFailed = 305,
    Aborted = 306,
    InternalError = 307,

    // Resource kind (4xx)
    OutOfMemory = 400,
    SharedMemoryUnavailable = 401,
    AtomicsUnavailable = 402,
    BufferOverflow = 403,
    LimitExceeded = 404,

    // Channel kind (5xx)
    ConnectionFailed = 500,
    ConnectionLost = 501,
    SendFailed = 502,
    ReceiveFailed = 503,
    ChannelClosed = 504,
    Backpressure = 505,
}

impl ErrorKind {
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            100 => Self::WorkerCrashed,
            101 => Self::WorkerInitFailed,
            102 => Self::WorkerUnresponsive,
            103 => Self::WorkerTerminated,
            104 => Self::NoWorkersAvailable,
            105 => Self::PoolTerminated,
            106 => Self::PoolQueueFull,
            107 => Self::WorkerSpawnFailed,
            108 => Self::WorkerTypeUnsupported,
            200 => Self::InvalidFrame,
            201 => Self::UnknownMessageType,
            202 => Self::VersionMismatch,
            203 => Self::MessageTooLarge,
            204 => Self::SerializationFailed,
            205 => Self::DeserializationFailed,
            206 => Self::MissingField,
            207 => Self::DuplicateMessageId,
            300 => Self::MethodNotFound,
            301 => Self::InvalidParams,
            302 => Self::ExecutionFailed,
            303 => Self::Cancelled,
            304 => Self::Timeout,
            305 => Self::FunctionSerializeFailed,
            306 => Self::Aborted,
            307 => Self::InternalError,
            400 => Self::OutOfMemory,
            401 => Self::SharedMemoryUnavailable,
            402 => Self::AtomicsUnavailable,
            403 => Self::BufferOverflow,
            404 => Self::LimitExceeded,
            500 => Self::ConnectionFailed,
            501 => Self::ConnectionLost,
            502 => Self::SendFailed,
            503 => Self::ReceiveFailed,
            504 => Self::ChannelClosed,
            505 => Self::Backpressure,
            _ => return None,
        })
    }

    /// Errors the caller may retry; the core never retries on its own.
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::WorkerCrashed
                | Self::WorkerUnresponsive
                | Self::Timeout
                | Self::ConnectionLost
                | Self::SendFailed
                | Self::ReceiveFailed
        )
    }

    /// Errors that terminate the whole pool.
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::PoolTerminated | Self::OutOfMemory | Self::SharedMemoryUnavailable
        )
    }
}

/// A worker stack captured at the failure site, serialised structurally so
/// it survives the TaskError frame round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStack {
    pub frames: Vec<String>,
}

impl WorkerStack {
    pub fn from_frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        serde_json::from_slice(bytes).ok()
    }
}

/// Exit details attached to WorkerTerminated/WorkerCrashed rejections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitDetail {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub script: Option<String>,
}

impl fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exit_code={:?} signal={:?} script={:?}",
            self.exit_code, self.signal, self.script
        )
    }
}

/// The error type rejected into [`crate::task::future::ResultFuture`]s and
/// returned from pool operations.
///
/// Cloneable on purpose: a transport crash rejects every pending future for
/// that handler with the same underlying error.
#[derive(Debug, Clone)]
pub struct PoolError {
    kind: ErrorKind,
    message: Arc<str>,
    stack: Option<Arc<WorkerStack>>,
    exit: Option<Arc<ExitDetail>>,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}): {}", self.kind, self.kind.code(), self.message)?;
        if let Some(exit) = &self.exit {
            write!(f, " [{exit}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for PoolError {}

impl PoolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Arc::from(message.into()),
            stack: None,
            exit: None,
        }
    }

    pub fn with_stack(mut self, stack: WorkerStack) -> Self {
        self.stack = Some(Arc::new(stack));
        self
    }

    pub fn with_exit(mut self, exit: ExitDetail) -> Self {
        self.exit = Some(Arc::new(exit));
        self
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn stack(&self) -> Option<&WorkerStack> {
        self.stack.as_deref()
    }

    #[inline]
    pub fn exit(&self) -> Option<&ExitDetail> {
        self.exit.as_deref()
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    // Shorthand constructors for the kinds the core raises itself.

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task cancelled")
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, what)
    }

    pub fn queue_full(size: usize) -> Self {
        Self::new(
            ErrorKind::PoolQueueFull,
            format!("task queue is full ({size} pending)"),
        )
    }

    pub fn pool_terminated() -> Self {
        Self::new(ErrorKind::PoolTerminated, "pool has been terminated")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("unknown method {method:?}"),
        )
    }

    pub fn worker_terminated(detail: ExitDetail) -> Self {
        Self::new(ErrorKind::WorkerTerminated, "worker terminated")
            .with_exit(detail)
    }

    pub fn invalid_frame(why: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFrame, why)
    }

    /// Wrap an error that was already delivered through the cleanup path so
    /// callers can tell "rejected now" from "rejected earlier, reply late".
    pub fn already_handled(self) -> Self {
        let message = format!("already handled: {}", self.message);
        Self {
            message: Arc::from(message),
            ..self
        }
    }
}
