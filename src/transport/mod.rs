// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod local;

use std::{fmt::Debug, sync::Arc};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ExitDetail, PoolError};

/// One event from the worker side of a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// Raw message bytes: either the readiness literal or an encoded frame.
    Message(Bytes),
    /// The worker is gone. Terminal; no further events follow.
    Exit(ExitDetail),
}

/// The opaque carrier of messages for one worker.
///
/// The core never sees spawn/kill internals; a transport only promises to
/// deliver bytes both ways and to stop when killed. `transferables` is a
/// hint that the payload references transport-owned resources.
pub trait Transport: Send + Sync + Debug {
    fn send(&self, msg: Bytes, transferables: bool) -> Result<(), PoolError>;

    /// Hard-stop the worker. Idempotent.
    fn kill(&self);
}

/// Per-worker knobs the factory receives from the pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub handler_id: usize,
    /// Debug port allocated for this worker, when a base was configured.
    pub debug_port: Option<u16>,
    /// Surface worker stdout/stderr as Event frames.
    pub emit_std_streams: bool,
    /// Worker script identifier, carried into crash diagnostics.
    pub script: Option<String>,
}

/// A freshly spawned worker: its transport plus the event stream the
/// handler's read loop consumes.
pub struct SpawnedWorker {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory selected by `worker_type`; the core only sees this seam.
pub trait TransportFactory: Send + Sync {
    fn spawn(&self, opts: &WorkerOptions) -> Result<SpawnedWorker, PoolError>;
}
