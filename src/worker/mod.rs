// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod dispatcher;

use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::{
    error::PoolError,
    frame::{codec::FrameBuilder, msg_type::MsgType},
};

/// Outcome of one method invocation: opaque result bytes or a typed error
/// that becomes a TaskError frame.
pub type MethodResult = Result<Bytes, PoolError>;

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered worker method.
pub type MethodFn = Arc<dyn Fn(MethodContext, Bytes) -> BoxFut<MethodResult> + Send + Sync>;

/// Abort hook registered by a running method; all hooks for a request run
/// concurrently when a cleanup arrives.
pub type AbortHook = Box<dyn FnOnce() -> BoxFut<Result<(), PoolError>> + Send + Sync>;

/// Named methods served by a worker. Users register typed handlers at
/// worker startup; the dispatcher adds the built-ins on top.
#[derive(Default)]
pub struct MethodRegistry {
    methods: DashMap<String, MethodFn>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(MethodContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let f = Arc::new(move |ctx: MethodContext, params: Bytes| {
            Box::pin(f(ctx, params)) as BoxFut<MethodResult>
        });
        self.methods.insert(name.into(), f);
    }

    /// Convenience for synchronous methods.
    pub fn register_sync<F>(&self, name: impl Into<String>, f: F)
    where F: Fn(MethodContext, Bytes) -> MethodResult + Send + Sync + 'static {
        let f = Arc::new(f);
        self.register(name, move |ctx, params| {
            let f = Arc::clone(&f);
            async move { f(ctx, params) }
        });
    }

    pub fn get(&self, name: &str) -> Option<MethodFn> {
        self.methods.get(name).map(|m| Arc::clone(&m))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

/// Handed to every method invocation: lets the method emit events mid-task
/// and register abort hooks for the cleanup handshake.
#[derive(Clone)]
pub struct MethodContext {
    pub request_id: u32,
    outbound: mpsc::UnboundedSender<Bytes>,
    abort_hooks: Arc<DashMap<u32, Vec<AbortHook>>>,
}

impl MethodContext {
    pub(crate) fn new(
        request_id: u32,
        outbound: mpsc::UnboundedSender<Bytes>,
        abort_hooks: Arc<DashMap<u32, Vec<AbortHook>>>,
    ) -> Self {
        Self {
            request_id,
            outbound,
            abort_hooks,
        }
    }

    /// Send an Event frame carrying `payload` for the current request
    /// without completing it.
    pub fn emit(&self, payload: Bytes) -> Result<(), PoolError> {
        let frame = FrameBuilder::new(MsgType::Event, self.request_id)
            .payload(payload)
            .build()?;
        self.outbound
            .send(frame.encode())
            .map_err(|_| PoolError::new(crate::error::ErrorKind::SendFailed, "worker outbound closed"))
    }

    /// Register an abort hook; it runs (concurrently with any others) when
    /// a cleanup arrives for this request.
    pub fn on_abort<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PoolError>> + Send + 'static,
    {
        let boxed: AbortHook =
            Box::new(move || Box::pin(hook()) as BoxFut<Result<(), PoolError>>);
        self.abort_hooks
            .entry(self.request_id)
            .or_default()
            .push(boxed);
    }
}

impl std::fmt::Debug for MethodContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodContext")
            .field("request_id", &self.request_id)
            .finish()
    }
}
