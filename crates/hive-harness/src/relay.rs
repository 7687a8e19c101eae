//! Fatal-error relay from worker threads to the main control flow.
//!
//! Workers that supervise subprocesses or listen for notifications cannot
//! return errors to the test body directly. They hand them to the relay
//! instead, and the receiving thread picks them up at its next check point:
//! [`FatalErrorRelay::check`], [`FatalErrorRelay::wait`], or the
//! [`FatalErrorRelay::guard`] select loop.
//!
//! ```text
//!   worker thread                        receiving thread
//!   ─────────────                        ────────────────
//!   raise_in_main_thread(err) ──┐        initialize()
//!                               │        ...
//!                               └──────▶ guard(fut) / wait() / check()
//!                                          └─▶ Err(HarnessError::Relayed)
//! ```

use crate::error::{BoxError, HarnessError, Result};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// An error raised on a worker thread and delivered to the receiving thread.
#[derive(Debug, Error)]
#[error("fatal error relayed from thread '{thread}': {source}")]
pub struct RelayedError {
    /// Name of the thread that raised the error.
    pub thread: String,
    /// The original error.
    #[source]
    pub source: BoxError,
}

/// Process-wide channel carrying the first fatal worker error to the
/// receiving thread.
#[derive(Debug)]
pub struct FatalErrorRelay {
    receiver: OnceLock<ThreadId>,
    pending: Mutex<Option<RelayedError>>,
    raised: Condvar,
    notify: Notify,
}

static GLOBAL: OnceLock<FatalErrorRelay> = OnceLock::new();

impl Default for FatalErrorRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl FatalErrorRelay {
    /// Create a standalone relay. Most code uses [`global`](Self::global).
    pub fn new() -> Self {
        Self {
            receiver: OnceLock::new(),
            pending: Mutex::new(None),
            raised: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// The process-wide relay.
    pub fn global() -> &'static FatalErrorRelay {
        GLOBAL.get_or_init(FatalErrorRelay::new)
    }

    /// Designate the calling thread as the receiver.
    ///
    /// Idempotent: later calls keep the first receiver.
    pub fn initialize(&self) {
        let current = std::thread::current().id();
        let receiver = *self.receiver.get_or_init(|| current);
        if receiver == current {
            tracing::debug!(thread = ?current, "Fatal error relay initialized");
        } else {
            tracing::debug!(
                thread = ?current,
                receiver = ?receiver,
                "Fatal error relay already initialized for another thread"
            );
        }
    }

    /// Whether [`initialize`](Self::initialize) has been called.
    pub fn is_initialized(&self) -> bool {
        self.receiver.get().is_some()
    }

    /// Store `error` and wake the receiving thread.
    ///
    /// Only the first error is kept until it is taken; later ones are
    /// logged and dropped.
    ///
    /// # Panics
    ///
    /// Panics if the relay was not initialized or if called from the
    /// receiving thread itself. Both are programming errors.
    pub fn raise_in_main_thread(&self, error: impl Into<BoxError>) {
        let receiver = self
            .receiver
            .get()
            .copied()
            .unwrap_or_else(|| panic!("FatalErrorRelay::initialize() must be called first"));
        let current = std::thread::current();
        assert_ne!(
            current.id(),
            receiver,
            "raise_in_main_thread() called from the receiving thread"
        );

        let relayed = RelayedError {
            thread: current.name().unwrap_or("<unnamed>").to_string(),
            source: error.into(),
        };
        let mut pending = self.lock_pending();
        if pending.is_some() {
            tracing::error!(error = %relayed, "Dropping fatal error, another one is pending");
            return;
        }
        tracing::error!(error = %relayed, "Relaying fatal error to main thread");
        *pending = Some(relayed);
        drop(pending);
        self.raised.notify_all();
        self.notify.notify_one();
    }

    /// Take the pending error, if any.
    pub fn take_pending(&self) -> Option<RelayedError> {
        self.lock_pending().take()
    }

    /// Non-blocking check point for the receiving thread.
    pub fn check(&self) -> Result<()> {
        match self.take_pending() {
            Some(e) => Err(HarnessError::Relayed(e)),
            None => Ok(()),
        }
    }

    /// Block for up to `timeout` waiting for a relayed error.
    pub fn wait(&self, timeout: Duration) -> Option<RelayedError> {
        let pending = self.lock_pending();
        let (mut pending, _) = self
            .raised
            .wait_timeout_while(pending, timeout, |p| p.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        pending.take()
    }

    /// Drive `future` until it completes, a fatal error is relayed, or the
    /// process receives Ctrl-C.
    ///
    /// An interrupt that arrives while an error is pending surfaces that
    /// error; otherwise it becomes [`HarnessError::Interrupted`].
    pub async fn guard<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.check()?;
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Ok(output),
                _ = self.notify.notified() => {
                    // A stale permit may be left from an error already taken.
                    self.check()?;
                }
                interrupt = tokio::signal::ctrl_c() => {
                    self.check()?;
                    if let Err(e) = interrupt {
                        tracing::warn!(error = %e, "Failed to listen for interrupt");
                        return Err(HarnessError::Io(e));
                    }
                    tracing::info!("Interrupted");
                    return Err(HarnessError::Interrupted);
                }
            }
        }
    }

    /// Run `work` on a named thread; an error or panic is relayed here.
    ///
    /// The relay must be initialized before the worker fails.
    pub fn spawn_worker<F>(&'static self, name: impl Into<String>, work: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce() -> std::result::Result<(), BoxError> + Send + 'static,
    {
        let name = name.into();
        std::thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::debug!(worker = %name, "Worker started");
            let error: Option<BoxError> = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(panic_message(panic.as_ref()).into()),
            };
            match error {
                Some(e) => self.raise_in_main_thread(e),
                None => tracing::debug!(worker = %name, "Worker finished"),
            }
        })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<RelayedError>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
