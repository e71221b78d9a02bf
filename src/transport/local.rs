// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process `thread`-flavour transport: hosts the worker dispatcher on a
//! spawned tokio task and hides everything behind the [`Transport`] seam,
//! exactly like an out-of-process flavour would.
//!
//! When shared memory is enabled the duplex channel is the fast path for
//! frames in both directions; the mpsc pair stays as the control path
//! (readiness literal, kill) and as the fallback once a channel degrades.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ErrorKind, PoolError},
    frame::READY_SIGNAL,
    frame::header::HEADER_LEN,
    frame::msg_type::MsgType,
    shm::channel::{ChannelFlags, SharedDuplex},
    transport::{SpawnedWorker, Transport, TransportEvent, TransportFactory, WorkerOptions},
    worker::{MethodRegistry, dispatcher, dispatcher::DispatcherConfig},
};

/// Idle poll interval for the shared-channel bridges.
const SHM_POLL_IDLE: Duration = Duration::from_micros(200);
/// How long a channel may sit with pending slots before it is stalled.
const SHM_STALL_THRESHOLD: Duration = Duration::from_secs(2);

/// Shared-memory fast-path geometry.
#[derive(Debug, Clone, Copy)]
pub struct SharedMemoryOptions {
    pub slot_size: u32,
    pub slot_count: u32,
}

impl Default for SharedMemoryOptions {
    fn default() -> Self {
        Self {
            slot_size: 4096,
            slot_count: 64,
        }
    }
}

/// Pool-side handle to one in-process worker.
pub struct LocalTransport {
    to_worker: mpsc::UnboundedSender<Bytes>,
    kill: CancellationToken,
    shared: Option<Arc<SharedDuplex>>,
    /// Latched once the fast path degraded; all traffic falls back to mpsc.
    shm_degraded: AtomicBool,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("shared", &self.shared.is_some())
            .field("shm_degraded", &self.shm_degraded.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalTransport {
    fn shm_active(&self) -> bool {
        match &self.shared {
            Some(dx) => {
                !self.shm_degraded.load(Ordering::Relaxed)
                    && !dx.tx.flags().intersects(ChannelFlags::ERROR | ChannelFlags::CLOSED)
            },
            None => false,
        }
    }

    fn degrade_shm(&self, why: &str) {
        if !self.shm_degraded.swap(true, Ordering::Relaxed) {
            warn!("shared channel degraded, falling back to transport path: {why}");
        }
    }
}

impl Transport for LocalTransport {
    fn send(&self, msg: Bytes, _transferables: bool) -> Result<(), PoolError> {
        if self.shm_active()
            && msg.len() > HEADER_LEN
            && let Some(dx) = &self.shared
        {
            // Slot type mirrors the frame's own type octet for cheap
            // worker-side dispatch; the payload is the whole encoded frame.
            let slot_type =
                MsgType::from_u8(msg[3]).unwrap_or(MsgType::TaskRequest);
            match dx.tx.send(slot_type, &msg) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::BufferOverflow => {
                    debug!("shared channel full, spilling frame to mpsc path");
                },
                Err(e) => self.degrade_shm(e.message()),
            }
        }
        self.to_worker
            .send(msg)
            .map_err(|_| PoolError::new(ErrorKind::ConnectionLost, "worker inbound closed"))
    }

    fn kill(&self) {
        self.kill.cancel();
        if let Some(dx) = &self.shared {
            dx.close();
        }
    }
}

/// Factory for the `thread` worker flavour. The method registry is shared
/// by every worker it spawns, the way a script path would be.
pub struct LocalTransportFactory {
    registry: Arc<MethodRegistry>,
    dispatcher_cfg: DispatcherConfig,
    shared_memory: Option<SharedMemoryOptions>,
}

impl LocalTransportFactory {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            dispatcher_cfg: DispatcherConfig::default(),
            shared_memory: None,
        }
    }

    pub fn with_dispatcher_cfg(mut self, cfg: DispatcherConfig) -> Self {
        self.dispatcher_cfg = cfg;
        self
    }

    pub fn with_shared_memory(mut self, opts: SharedMemoryOptions) -> Self {
        self.shared_memory = Some(opts);
        self
    }
}

impl TransportFactory for LocalTransportFactory {
    fn spawn(&self, opts: &WorkerOptions) -> Result<SpawnedWorker, PoolError> {
        let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel::<Bytes>();
        let (worker_out_tx, mut worker_out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (disp_in_tx, disp_in_rx) = mpsc::unbounded_channel::<Bytes>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let kill = CancellationToken::new();

        let duplex = match &self.shared_memory {
            Some(shm) => {
                let (pool_dx, worker_dx) = SharedDuplex::pair(shm.slot_size, shm.slot_count)?;
                Some((Arc::new(pool_dx), Arc::new(worker_dx)))
            },
            None => None,
        };
        let (pool_dx, worker_dx) = match duplex {
            Some((p, w)) => (Some(p), Some(w)),
            None => (None, None),
        };

        let mut cfg = self.dispatcher_cfg.clone();
        if cfg.script.is_none() {
            cfg.script = opts.script.clone();
        }

        // Control-path bridge: pool mpsc -> dispatcher inbound.
        {
            let disp_in_tx = disp_in_tx.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = kill.cancelled() => break,
                        msg = to_worker_rx.recv() => {
                            let Some(msg) = msg else { break };
                            if disp_in_tx.send(msg).is_err() {
                                break;
                            }
                        },
                    }
                }
            });
        }

        // Fast-path bridge: worker-side channel rx -> dispatcher inbound.
        if let Some(wdx) = worker_dx.clone() {
            let disp_in_tx = disp_in_tx.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                loop {
                    if kill.is_cancelled() {
                        break;
                    }
                    match wdx.rx.try_recv() {
                        Ok(Some((_slot_type, bytes))) => {
                            if disp_in_tx.send(bytes).is_err() {
                                break;
                            }
                        },
                        Ok(None) => {
                            if wdx.rx.flags().contains(ChannelFlags::CLOSED) {
                                break;
                            }
                            tokio::time::sleep(SHM_POLL_IDLE).await;
                        },
                        Err(e) => {
                            warn!("worker channel receive failed: {e}");
                            wdx.rx.mark_error();
                            break;
                        },
                    }
                }
            });
        }

        // Outbound bridge: dispatcher outbound -> fast path, with the
        // readiness literal and degraded frames taking the event stream.
        let out_bridge = {
            let event_tx = event_tx.clone();
            let worker_dx = worker_dx.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = kill.cancelled() => break,
                        msg = worker_out_rx.recv() => {
                            let Some(bytes) = msg else { break };
                            let mut fall_back = true;
                            if let Some(wdx) = &worker_dx
                                && bytes.as_ref() != READY_SIGNAL
                                && bytes.len() > HEADER_LEN
                                && !wdx.tx.flags().intersects(
                                    ChannelFlags::ERROR | ChannelFlags::CLOSED,
                                )
                            {
                                let slot_type = MsgType::from_u8(bytes[3])
                                    .unwrap_or(MsgType::TaskResponse);
                                fall_back = wdx.tx.send(slot_type, &bytes).is_err();
                            }
                            if fall_back && event_tx.send(TransportEvent::Message(bytes)).is_err() {
                                break;
                            }
                        },
                    }
                }
            })
        };

        // Pool-side bridge: channel rx -> handler event stream, with the
        // stall detector running on idle ticks.
        if let Some(pdx) = pool_dx.clone() {
            let event_tx = event_tx.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                loop {
                    if kill.is_cancelled() {
                        break;
                    }
                    match pdx.rx.try_recv() {
                        Ok(Some((_slot_type, bytes))) => {
                            if event_tx.send(TransportEvent::Message(bytes)).is_err() {
                                break;
                            }
                        },
                        Ok(None) => {
                            if pdx.rx.flags().contains(ChannelFlags::CLOSED) {
                                break;
                            }
                            pdx.rx.check_stall(SHM_STALL_THRESHOLD);
                            tokio::time::sleep(SHM_POLL_IDLE).await;
                        },
                        Err(e) => {
                            warn!("pool channel receive failed: {e}");
                            pdx.rx.mark_error();
                            break;
                        },
                    }
                }
            });
        }

        // The worker itself. Exit is emitted only after the outbound
        // bridge drained, so no reply can arrive after the exit event.
        {
            let registry = Arc::clone(&self.registry);
            let event_tx = event_tx.clone();
            let kill = kill.clone();
            let worker_dx = worker_dx.clone();
            tokio::spawn(async move {
                let detail =
                    dispatcher::run(registry, disp_in_rx, worker_out_tx, kill.clone(), cfg)
                        .await;
                if let Some(wdx) = &worker_dx {
                    // Close both directions so the polling bridges stand
                    // down even on a graceful exit.
                    wdx.close();
                    wdx.rx.close();
                }
                let _ = out_bridge.await;
                let _ = event_tx.send(TransportEvent::Exit(detail));
            });
        }

        let transport = LocalTransport {
            to_worker: to_worker_tx,
            kill,
            shared: pool_dx,
            shm_degraded: AtomicBool::new(false),
        };

        Ok(SpawnedWorker {
            transport: Arc::new(transport),
            events: event_rx,
        })
    }
}
