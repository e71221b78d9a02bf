// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The dispatcher running inside each worker: receives frames, invokes
//! registered methods, emits responses.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ErrorKind, ExitDetail, PoolError},
    frame::{
        METHOD_CLEANUP, METHOD_HEARTBEAT, METHOD_TERMINATE, READY_SIGNAL,
        codec::{Frame, FrameBuilder},
        msg_type::MsgType,
        payload::{HeartbeatResBody, TaskErrorBody, TaskRequestBody},
    },
    worker::{AbortHook, MethodContext, MethodRegistry},
};

/// Knobs the worker side needs; everything else lives pool-side.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Budget for abort hooks once a cleanup arrives. Blowing it is fatal
    /// for the worker process.
    pub abort_listener_timeout: Duration,
    /// Carried into exit diagnostics.
    pub script: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            abort_listener_timeout: Duration::from_secs(5),
            script: None,
        }
    }
}

struct DispatcherState {
    registry: Arc<MethodRegistry>,
    outbound: mpsc::UnboundedSender<Bytes>,
    running: Arc<DashMap<u32, CancellationToken>>,
    abort_hooks: Arc<DashMap<u32, Vec<AbortHook>>>,
    sequence: Arc<AtomicU32>,
    mem_usage: Arc<AtomicU64>,
    started: Instant,
    /// Fired when an abort hook misses its budget; exits the worker.
    fatal: CancellationToken,
    /// The transport's hard-kill token; running invocations observe it.
    kill: CancellationToken,
    cfg: DispatcherConfig,
}

/// Run the worker loop until terminated, killed, or the inbound side goes
/// away. Announces readiness first, then serves frames.
pub async fn run(
    registry: Arc<MethodRegistry>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    kill: CancellationToken,
    cfg: DispatcherConfig,
) -> ExitDetail {
    let script = cfg.script.clone();
    let state = DispatcherState {
        registry,
        outbound: outbound.clone(),
        running: Arc::new(DashMap::new()),
        abort_hooks: Arc::new(DashMap::new()),
        sequence: Arc::new(AtomicU32::new(0)),
        mem_usage: Arc::new(AtomicU64::new(0)),
        started: Instant::now(),
        fatal: CancellationToken::new(),
        kill: kill.clone(),
        cfg,
    };

    let _ = outbound.send(Bytes::from_static(READY_SIGNAL));

    loop {
        tokio::select! {
            biased;
            _ = kill.cancelled() => {
                return ExitDetail { exit_code: None, signal: Some(9), script };
            },
            _ = state.fatal.cancelled() => {
                return ExitDetail { exit_code: Some(1), signal: None, script };
            },
            msg = inbound.recv() => {
                let Some(bytes) = msg else {
                    return ExitDetail { exit_code: Some(0), signal: None, script };
                };
                if bytes.as_ref() == METHOD_TERMINATE.as_bytes() {
                    return ExitDetail { exit_code: Some(0), signal: None, script };
                }
                if state.handle_message(bytes) {
                    return ExitDetail { exit_code: Some(0), signal: None, script };
                }
            },
        }
    }
}

impl DispatcherState {
    #[inline]
    fn next_seq(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, frame: Frame) {
        let _ = self.outbound.send(frame.encode());
    }

    fn reply_error(&self, request_id: u32, err: &PoolError) {
        let body = TaskErrorBody::from_error(err);
        match body.encode().and_then(|payload| {
            FrameBuilder::new(MsgType::TaskError, request_id)
                .sequence(self.next_seq())
                .payload(payload)
                .build()
        }) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!("failed to encode error reply: {e}"),
        }
    }

    /// Returns true when the message asks the worker to exit.
    fn handle_message(&self, bytes: Bytes) -> bool {
        let frame = match Frame::decode(&bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!("dropping undecodable inbound message: {e}");
                return false;
            },
        };
        let request_id = frame.message_id().unwrap_or_default();
        let msg_type = match frame.msg_type() {
            Ok(t) => t,
            Err(e) => {
                warn!("dropping frame: {e}");
                return false;
            },
        };

        match msg_type {
            MsgType::TaskRequest => {
                let body = match TaskRequestBody::decode(frame.payload()) {
                    Ok(b) => b,
                    Err(e) => {
                        self.reply_error(request_id, &e);
                        return false;
                    },
                };
                match body.method.as_str() {
                    METHOD_TERMINATE => return true,
                    METHOD_HEARTBEAT => self.reply_heartbeat(request_id),
                    METHOD_CLEANUP => self.cleanup(request_id),
                    _ => self.invoke(request_id, body),
                }
            },
            MsgType::HeartbeatReq => self.reply_heartbeat(request_id),
            MsgType::Cleanup => self.cleanup(request_id),
            MsgType::Terminate => return true,
            other => debug!("ignoring {other:?} on the worker side"),
        }
        false
    }

    fn reply_heartbeat(&self, request_id: u32) {
        let body = HeartbeatResBody {
            status: HeartbeatResBody::STATUS_OK,
            task_count: self.running.len() as u32,
            mem_usage: self.mem_usage.load(Ordering::Relaxed),
            uptime_ms: self.started.elapsed().as_millis() as u64,
        };
        match FrameBuilder::new(MsgType::HeartbeatRes, request_id)
            .sequence(self.next_seq())
            .payload(body.encode())
            .build()
        {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!("failed to encode heartbeat reply: {e}"),
        }
    }

    fn invoke(&self, request_id: u32, body: TaskRequestBody) {
        let TaskRequestBody { method, params } = body;

        let Some(f) = self.resolve(&method, &params) else {
            self.reply_error(request_id, &PoolError::method_not_found(&method));
            return;
        };
        let (f, params) = f;

        let ctx = MethodContext::new(
            request_id,
            self.outbound.clone(),
            Arc::clone(&self.abort_hooks),
        );

        let cancel = CancellationToken::new();
        self.running.insert(request_id, cancel.clone());
        self.mem_usage
            .fetch_add(params.len() as u64, Ordering::Relaxed);

        let outbound = self.outbound.clone();
        let running = Arc::clone(&self.running);
        let abort_hooks = Arc::clone(&self.abort_hooks);
        let mem_usage = Arc::clone(&self.mem_usage);
        let sequence = Arc::clone(&self.sequence);
        let params_len = params.len() as u64;
        let kill = self.kill.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = kill.cancelled() => {
                    // Worker is being hard-stopped; no reply.
                },
                _ = cancel.cancelled() => {
                    // Aborted by cleanup; the cleanup path owns the reply.
                },
                res = f(ctx, params) => {
                    let seq = sequence.fetch_add(1, Ordering::Relaxed);
                    let frame = match res {
                        Ok(value) => FrameBuilder::new(MsgType::TaskResponse, request_id)
                            .sequence(seq)
                            .payload(value)
                            .build(),
                        Err(err) => TaskErrorBody::from_error(&err).encode().and_then(
                            |payload| {
                                FrameBuilder::new(MsgType::TaskError, request_id)
                                    .sequence(seq)
                                    .payload(payload)
                                    .build()
                            },
                        ),
                    };
                    match frame {
                        Ok(frame) => {
                            let _ = outbound.send(frame.encode());
                        },
                        Err(e) => warn!("failed to encode reply: {e}"),
                    }
                },
            }
            running.remove(&request_id);
            abort_hooks.remove(&request_id);
            mem_usage.fetch_sub(params_len, Ordering::Relaxed);
        });
    }

    /// Resolve a method name, expanding the `run` built-in (a
    /// pre-registered handler key prefixed to the params) and `methods`.
    fn resolve(
        &self,
        method: &str,
        params: &Bytes,
    ) -> Option<(crate::worker::MethodFn, Bytes)> {
        match method {
            "run" => {
                if params.len() < 2 {
                    return None;
                }
                let klen = u16::from_le_bytes([params[0], params[1]]) as usize;
                if params.len() < 2 + klen {
                    return None;
                }
                let key =
                    String::from_utf8_lossy(&params[2..2 + klen]).into_owned();
                let f = self.registry.get(&key)?;
                Some((f, params.slice(2 + klen..)))
            },
            "methods" => {
                let names = self.registry.names();
                let f: crate::worker::MethodFn = Arc::new(move |_ctx, _params| {
                    let names = names.clone();
                    Box::pin(async move {
                        serde_json::to_vec(&names).map(Bytes::from).map_err(|e| {
                            PoolError::new(
                                ErrorKind::SerializationFailed,
                                e.to_string(),
                            )
                        })
                    })
                });
                Some((f, params.clone()))
            },
            name => self.registry.get(name).map(|f| (f, params.clone())),
        }
    }

    /// Abort handshake: run abort hooks concurrently under the listener
    /// budget, cancel the running invocation, reply CleanupResponse (with
    /// the first hook error in the payload, if any). A blown budget exits
    /// the worker.
    fn cleanup(&self, request_id: u32) {
        let hooks = self
            .abort_hooks
            .remove(&request_id)
            .map(|(_, v)| v)
            .unwrap_or_default();
        let cancel = self.running.remove(&request_id).map(|(_, t)| t);

        let outbound = self.outbound.clone();
        let fatal = self.fatal.clone();
        let budget = self.cfg.abort_listener_timeout;
        let seq = self.next_seq();

        tokio::spawn(async move {
            let mut set = JoinSet::new();
            for hook in hooks {
                set.spawn(hook());
            }
            let hook_result = tokio::time::timeout(budget, async {
                let mut first_err: Option<PoolError> = None;
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(Err(e)) => {
                            first_err.get_or_insert(e);
                        },
                        Ok(Ok(())) => {},
                        Err(e) => {
                            first_err.get_or_insert(PoolError::new(
                                ErrorKind::Aborted,
                                format!("abort hook panicked: {e}"),
                            ));
                        },
                    }
                }
                first_err
            })
            .await;

            let first_err = match hook_result {
                Ok(e) => e,
                Err(_) => {
                    warn!(request_id, "abort hooks exceeded budget, exiting worker");
                    fatal.cancel();
                    return;
                },
            };

            if let Some(token) = cancel {
                token.cancel();
            }

            let payload = match &first_err {
                Some(err) => match TaskErrorBody::from_error(err).encode() {
                    Ok(p) => p,
                    Err(_) => Bytes::new(),
                },
                None => Bytes::new(),
            };
            match FrameBuilder::new(MsgType::CleanupResponse, request_id)
                .sequence(seq)
                .payload(payload)
                .build()
            {
                Ok(frame) => {
                    let _ = outbound.send(frame.encode());
                },
                Err(e) => warn!("failed to encode cleanup reply: {e}"),
            }
        });
    }
}
