// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// The error raised when an operation is interrupted by a cancellation token.
///
/// Policies must let this propagate rather than capturing it as a failure
/// result, so that a cancel request surfaces to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct OperationCanceled;

/// Errors from [`CancellationTokenSource::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("cancellation already requested")]
    AlreadyCancelled,
}

type CancelListener = Box<dyn FnOnce() + Send>;

struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
    listeners: Mutex<Vec<CancelListener>>,
}

/// Owns a one-way cancellation latch.
///
/// The source is the only handle that can trigger cancellation; any number
/// of [`CancellationToken`]s can observe it.
pub struct CancellationTokenSource {
    shared: Arc<Shared>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Observer handle for this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Trip the latch.  Listeners fire exactly once, in registration order.
    ///
    /// A second cancel is a caller bug and returns
    /// [`CancelError::AlreadyCancelled`].
    pub fn cancel(&self) -> Result<(), CancelError> {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return Err(CancelError::AlreadyCancelled);
        }
        let listeners: Vec<CancelListener> = {
            let mut guard = self
                .shared
                .listeners
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        for listener in listeners {
            listener();
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only observer of a [`CancellationTokenSource`].  Cheap to clone.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// A token that can never be cancelled.  Useful for callers that do not
    /// participate in cancellation (tests, fire-and-forget requests).
    pub fn never() -> Self {
        CancellationTokenSource::new().token()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn throw_if_cancellation_requested(&self) -> Result<(), OperationCanceled> {
        if self.is_cancellation_requested() {
            Err(OperationCanceled)
        } else {
            Ok(())
        }
    }

    /// Register a one-shot listener that fires when the source cancels.
    ///
    /// Fails with [`OperationCanceled`] when the token is already cancelled,
    /// so callers never register a listener that silently cannot fire.
    pub fn on_cancel<F>(&self, listener: F) -> Result<(), OperationCanceled>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        // Checked under the lock: `cancel` takes the listener list before
        // flipping waiters, so a listener registered here either lands in the
        // list before the take or observes `cancelled` and errors.
        if self.is_cancellation_requested() {
            return Err(OperationCanceled);
        }
        guard.push(Box::new(listener));
        Ok(())
    }

    /// Resolve only when cancellation is requested, yielding the error value.
    ///
    /// Intended for `tokio::select!` races against real work: the branch that
    /// wins on cancellation hands back [`OperationCanceled`] directly.
    pub async fn await_cancellation(&self) -> OperationCanceled {
        loop {
            let notified = self.shared.notify.notified();
            if self.is_cancellation_requested() {
                return OperationCanceled;
            }
            notified.await;
        }
    }
}

/// Cancellable sleep.
///
/// Without a token this is a plain `tokio::time::sleep`.  With one, a cancel
/// mid-sleep fails the sleep promptly; a pre-cancelled token fails before
/// sleeping at all.
pub async fn sleep(
    duration: Duration,
    token: Option<&CancellationToken>,
) -> Result<(), OperationCanceled> {
    match token {
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
        Some(token) => {
            token.throw_if_cancellation_requested()?;
            tokio::select! {
                biased;
                canceled = token.await_cancellation() => Err(canceled),
                _ = tokio::time::sleep(duration) => Ok(()),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
