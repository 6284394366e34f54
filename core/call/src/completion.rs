// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The completion queue: terminal sink for batch completions identified
//! by user tags.

// Standard library imports
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// Third-party crates
use tokio::sync::mpsc;
use tracing::warn;

// Local crate
use crate::error::OpError;

/// User-chosen identifier surfaced with the matching completion.
pub type Tag = u64;

/// One batch completion.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub tag: Tag,
    pub result: Result<(), Arc<OpError>>,
}

impl CompletionEvent {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// A queue of batch completions consumed by the application.
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<CompletionEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CompletionEvent>>,
    shutdown: AtomicBool,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(CompletionQueue {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn post(&self, event: CompletionEvent) {
        if self.shutdown.load(Ordering::Acquire) {
            warn!(tag = event.tag, "completion dropped, queue shut down");
            return;
        }
        // The receiver outlives the senders by construction; a closed
        // channel here means shutdown raced the post.
        let _ = self.tx.send(event);
    }

    /// Await the next completion. Returns `None` once the queue is shut
    /// down and drained.
    pub async fn next(&self) -> Option<CompletionEvent> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking poll for a completion.
    pub fn try_next(&self) -> Option<CompletionEvent> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Stop accepting completions. Events already queued remain
    /// consumable.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_and_next() {
        let cq = CompletionQueue::new();
        cq.post(CompletionEvent {
            tag: 7,
            result: Ok(()),
        });
        let event = cq.next().await.unwrap();
        assert_eq!(event.tag, 7);
        assert!(event.is_ok());
    }

    #[tokio::test]
    async fn test_try_next_empty() {
        let cq = CompletionQueue::new();
        assert!(cq.try_next().is_none());
        cq.post(CompletionEvent {
            tag: 1,
            result: Err(Arc::new(OpError::cancelled())),
        });
        let event = cq.try_next().unwrap();
        assert!(!event.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_drops_new_posts() {
        let cq = CompletionQueue::new();
        cq.shutdown();
        cq.post(CompletionEvent {
            tag: 9,
            result: Ok(()),
        });
        assert!(cq.try_next().is_none());
    }
}
