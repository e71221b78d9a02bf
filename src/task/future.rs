// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::PoolError;

/// State shared between a [`ResultFuture`] and the pool/handler side that
/// settles it.
///
/// Settlement is exactly-once: the oneshot sender is taken under the lock,
/// so a racing fulfil/reject observes `None` and becomes a no-op.
pub struct FutureShared {
    tx: Mutex<Option<oneshot::Sender<Result<Bytes, PoolError>>>>,
    settled: AtomicBool,
    /// Fired on cancel/timeout; the dispatching handler watches this to
    /// start the cleanup handshake.
    cancel: CancellationToken,
    /// Fired on any settlement so watchers can stand down.
    done: CancellationToken,
    /// The error the future settled with, preserved for the cleanup record.
    settle_error: Mutex<Option<PoolError>>,
    /// Timeout requested via `ResultFuture::timeout`; armed at dispatch.
    timeout: Mutex<Option<Duration>>,
}

impl FutureShared {
    fn new(tx: oneshot::Sender<Result<Bytes, PoolError>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            settled: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            settle_error: Mutex::new(None),
            timeout: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Resolve the future. Returns false if it was already settled.
    pub fn fulfil(&self, value: Bytes) -> bool {
        self.settle(Ok(value))
    }

    /// Reject the future. Returns false if it was already settled.
    pub fn reject(&self, err: PoolError) -> bool {
        self.settle(Err(err))
    }

    fn settle(&self, res: Result<Bytes, PoolError>) -> bool {
        let tx = {
            let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(tx) = tx else {
            return false;
        };
        if let Err(err) = &res {
            *self
                .settle_error
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(err.clone());
        }
        self.settled.store(true, Ordering::Release);
        let _ = tx.send(res);
        self.done.cancel();
        true
    }

    /// The error this future settled with, if it settled rejected.
    pub fn settle_error(&self) -> Option<PoolError> {
        self.settle_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Token fired on cancel/timeout; watched by the handler for cleanup.
    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token fired on any settlement.
    #[inline]
    pub fn done_token(&self) -> &CancellationToken {
        &self.done
    }

    pub fn requested_timeout(&self) -> Option<Duration> {
        *self.timeout.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_timeout(&self, d: Duration) {
        *self.timeout.lock().unwrap_or_else(|e| e.into_inner()) = Some(d);
    }

    /// Reject with the given error and wake the cleanup watcher. Used by
    /// both `cancel()` and the dispatch-side timeout timer.
    pub fn abort_with(&self, err: PoolError) -> bool {
        let fresh = self.reject(err);
        if fresh {
            self.cancel.cancel();
        }
        fresh
    }
}

/// The caller-facing handle returned by `exec`.
///
/// Awaiting yields exactly one `Ok(payload)` or `Err(PoolError)`. Dropping
/// the handle does not cancel the task; call [`ResultFuture::cancel`].
pub struct ResultFuture {
    shared: Arc<FutureShared>,
    rx: oneshot::Receiver<Result<Bytes, PoolError>>,
}

impl ResultFuture {
    /// Build a future/completer pair.
    pub(crate) fn create() -> (Self, Arc<FutureShared>) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(FutureShared::new(tx));
        (
            Self {
                shared: Arc::clone(&shared),
                rx,
            },
            shared,
        )
    }

    /// Cancel the task. A pending future transitions to rejected(Cancelled)
    /// immediately; if the task is already dispatched the handler sends a
    /// cleanup frame. Cancelling an already-settled future is a no-op.
    pub fn cancel(&self) {
        self.shared.abort_with(PoolError::cancelled());
    }

    /// Request an execution timeout. The clock starts when the task leaves
    /// the queue; calling this after dispatch has no effect on the running
    /// attempt.
    pub fn timeout(self, d: Duration) -> Self {
        self.shared.set_timeout(d);
        self
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        self.shared.is_settled()
    }

    /// Completion-side handle, for watchers that must outlive the await.
    pub(crate) fn shared_handle(&self) -> Arc<FutureShared> {
        Arc::clone(&self.shared)
    }
}

impl Future for ResultFuture {
    type Output = Result<Bytes, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            // Sender dropped without settling: the pool was torn down hard.
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::pool_terminated())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for ResultFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultFuture")
            .field("settled", &self.is_settled())
            .finish()
    }
}
