// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Batch control records: per-batch completion bookkeeping.
//!
//! One record exists per occupied op slot. Sub-completions decrement the
//! step counter; the last one triggers completion dispatch on the call.

// Standard library imports
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// Third-party crates
use parking_lot::Mutex;

// Local crate
use crate::call::CallInner;
use crate::completion::Tag;
use crate::error::OpError;
use crate::ops::OpSlot;
use crate::status::StatusSource;
use crate::transport::OpClosure;

/// How the user learns about batch completion.
pub(crate) enum Notify {
    /// Post to the call's completion queue under this tag.
    Tag(Tag),
    /// Invoke this continuation directly.
    Closure(OpClosure),
}

/// Which op kinds the batch carries; drives completion-time effects.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BatchFlags {
    pub send_initial_metadata: bool,
    pub send_message: bool,
    pub send_trailing_metadata: bool,
    pub recv_initial_metadata: bool,
    pub recv_message: bool,
    pub recv_trailing_metadata: bool,
}

pub(crate) struct BatchControl {
    pub(crate) call: Arc<CallInner>,
    pub(crate) slot: OpSlot,
    pub(crate) flags: BatchFlags,
    steps: AtomicUsize,
    errors: Mutex<Vec<Arc<OpError>>>,
    notify: Mutex<Option<Notify>>,
}

impl BatchControl {
    pub(crate) fn new(
        call: Arc<CallInner>,
        slot: OpSlot,
        flags: BatchFlags,
        steps: usize,
        notify: Notify,
    ) -> Self {
        BatchControl {
            call,
            slot,
            flags,
            steps: AtomicUsize::new(steps),
            errors: Mutex::new(Vec::new()),
            notify: Mutex::new(Some(notify)),
        }
    }

    /// Record a sub-completion error. The first error triggers a
    /// synthetic cancellation unless the caller already cancelled.
    pub(crate) fn add_error(&self, error: Arc<OpError>, has_cancelled: bool) {
        let is_first = {
            let mut errors = self.errors.lock();
            errors.push(error.clone());
            errors.len() == 1
        };
        if is_first && !has_cancelled {
            CallInner::cancel_with_error(&self.call, StatusSource::Core, error);
        }
    }

    /// One sub-completion done; the last one dispatches the batch.
    pub(crate) fn finish_step(&self) {
        if self.steps.fetch_sub(1, Ordering::AcqRel) == 1 {
            CallInner::post_batch_completion(self);
        }
    }

    /// Consolidate accumulated errors: none is success, one is returned
    /// as-is, several become a composite referencing all of them.
    pub(crate) fn consolidate(&self) -> Result<(), Arc<OpError>> {
        let mut errors = self.errors.lock();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Arc::new(OpError::composite(
                "call batch failed",
                errors.drain(..).collect(),
            ))),
        }
    }

    pub(crate) fn take_notify(&self) -> Option<Notify> {
        self.notify.lock().take()
    }
}
