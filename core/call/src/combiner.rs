// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The call combiner: a one-at-a-time gate in front of the filter stack.
//!
//! Work enters with [`CallCombiner::start`]; the executing job marks its
//! yield point with [`CallCombiner::stop`] and queued work runs once the
//! current job returns (deferred, never nested into the running job).
//! `start` never blocks, so a job may safely re-enter `start` while the
//! gate is held.
//!
//! Cancellation travels on a separate channel: [`CallCombiner::cancel`]
//! fires the registered notification so that in-flight asynchronous
//! actions can be pre-empted before the cancel batch is queued.

// Standard library imports
use std::collections::VecDeque;
use std::sync::Arc;

// Third-party crates
use parking_lot::Mutex;
use tracing::trace;

// Local crate
use crate::error::OpError;

/// A unit of work serialized by the combiner.
pub type CombinerJob = Box<dyn FnOnce() + Send>;

/// Invoked with `Some(error)` when the call is cancelled, or `None` when
/// the notification is released without a cancellation.
pub type CancelNotify = Box<dyn FnOnce(Option<Arc<OpError>>) + Send>;

#[derive(Default)]
struct Inner {
    held: bool,
    queue: VecDeque<(&'static str, CombinerJob)>,
    cancel_error: Option<Arc<OpError>>,
    notify_on_cancel: Option<CancelNotify>,
}

#[derive(Default)]
pub struct CallCombiner {
    inner: Mutex<Inner>,
}

impl CallCombiner {
    pub fn new() -> Self {
        CallCombiner::default()
    }

    /// Run `job` under the gate, or queue it if another job holds it.
    pub fn start(&self, reason: &'static str, job: CombinerJob) {
        {
            let mut inner = self.inner.lock();
            if inner.held {
                trace!(reason, "combiner busy, queueing");
                inner.queue.push_back((reason, job));
                return;
            }
            inner.held = true;
        }
        trace!(reason, "combiner start");
        job();
        self.drain();
    }

    /// Mark the yield point of the executing job. Queued work runs after
    /// the job returns; state the job touches past this point must be
    /// protected by call-level synchronization.
    pub fn stop(&self, reason: &'static str) {
        debug_assert!(self.inner.lock().held, "stop without a held combiner");
        trace!(reason, "combiner stop");
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut inner = self.inner.lock();
                match inner.queue.pop_front() {
                    Some(entry) => Some(entry),
                    None => {
                        inner.held = false;
                        None
                    }
                }
            };
            match next {
                Some((reason, job)) => {
                    trace!(reason, "combiner resuming queued work");
                    job();
                }
                None => return,
            }
        }
    }

    /// Signal cancellation. The registered notification (if any) fires
    /// immediately so queued asynchronous actions can be pre-empted.
    pub fn cancel(&self, error: Arc<OpError>) {
        let notify = {
            let mut inner = self.inner.lock();
            if inner.cancel_error.is_none() {
                inner.cancel_error = Some(error.clone());
            }
            inner.notify_on_cancel.take()
        };
        if let Some(notify) = notify {
            trace!("combiner cancel, notifying");
            notify(Some(error));
        }
    }

    /// Register interest in cancellation, or release the current
    /// registration with `None`. Registering after a cancellation has
    /// already been signalled fires the notification at once.
    pub fn set_notify_on_cancel(&self, notify: Option<CancelNotify>) {
        let action = {
            let mut inner = self.inner.lock();
            match notify {
                Some(notify) => match inner.cancel_error.clone() {
                    Some(error) => Some((notify, Some(error))),
                    None => {
                        inner.notify_on_cancel = Some(notify);
                        None
                    }
                },
                None => inner.notify_on_cancel.take().map(|n| (n, None)),
            }
        };
        if let Some((notify, error)) = action {
            notify(error);
        }
    }
}

impl std::fmt::Debug for CallCombiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallCombiner")
            .field("held", &inner.held)
            .field("queued", &inner.queue.len())
            .field("cancelled", &inner.cancel_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_order() {
        let combiner = Arc::new(CallCombiner::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let c = combiner.clone();
        let o = order.clone();
        combiner.start(
            "outer",
            Box::new(move || {
                // Queued while the gate is held; must run after we return.
                let o2 = o.clone();
                c.start(
                    "inner",
                    Box::new(move || {
                        o2.lock().push("inner");
                    }),
                );
                c.stop("outer");
                o.lock().push("outer");
            }),
        );

        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_gate_released_after_drain() {
        let combiner = CallCombiner::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        combiner.start("a", Box::new(|| {}));
        combiner.start(
            "b",
            Box::new(move || {
                ran2.store(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_fires_registered_notify() {
        let combiner = CallCombiner::new();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        combiner.set_notify_on_cancel(Some(Box::new(move |err| {
            *seen2.lock() = Some(err.is_some());
        })));
        combiner.cancel(Arc::new(OpError::cancelled()));
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_notify_after_cancel_fires_immediately() {
        let combiner = CallCombiner::new();
        combiner.cancel(Arc::new(OpError::cancelled()));
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        combiner.set_notify_on_cancel(Some(Box::new(move |err| {
            *seen2.lock() = Some(err.is_some());
        })));
        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_unset_notify_releases_with_none() {
        let combiner = CallCombiner::new();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        combiner.set_notify_on_cancel(Some(Box::new(move |err| {
            *seen2.lock() = Some(err.is_some());
        })));
        combiner.set_notify_on_cancel(None);
        assert_eq!(*seen.lock(), Some(false));
    }
}
