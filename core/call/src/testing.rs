// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! In-memory transport and streams for exercising calls without a
//! network. Tests drive deliveries explicitly, which makes the receive
//! races reproducible in either order.

// Standard library imports
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

// Third-party crates
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

// Local crate
use crate::combiner::CallCombiner;
use crate::error::OpError;
use crate::message::{Pull, ReceiveStream, SliceReady};
use crate::metadata::{MetadataMap, Metadatum};
use crate::ops::{InitialMetadataFlags, WriteFlags};
use crate::transport::{
    MetadataSink, OpClosure, PeerSink, StreamSink, Transport, TransportOpBatch,
};

/// A send-initial-metadata op as observed by the transport.
#[derive(Debug, Clone)]
pub struct SentInitialMetadata {
    pub metadata: MetadataMap,
    pub flags: InitialMetadataFlags,
    pub deadline: Option<Instant>,
}

#[derive(Default)]
struct State {
    combiner: Option<Arc<CallCombiner>>,
    recv_initial: Option<(MetadataSink, Option<PeerSink>, OpClosure)>,
    recv_message: Option<(StreamSink, OpClosure)>,
    recv_trailing: Option<MetadataSink>,
    on_complete: VecDeque<OpClosure>,
    sent_initial: Vec<SentInitialMetadata>,
    sent_messages: Vec<(crate::message::ByteBuffer, WriteFlags)>,
    sent_trailing: Vec<MetadataMap>,
    cancels: Vec<Arc<OpError>>,
    peer: Option<String>,
}

/// A transport whose deliveries are driven by the test.
///
/// Batches are recorded as they arrive; cancel batches complete
/// immediately, everything else waits for the corresponding
/// `deliver_*` / `complete_*` call.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<State>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport::default())
    }

    /// Report this peer string on the next send/recv initial metadata op.
    pub fn set_peer(&self, peer: impl Into<String>) {
        self.state.lock().peer = Some(peer.into());
    }

    fn combiner(&self) -> Arc<CallCombiner> {
        self.state
            .lock()
            .combiner
            .clone()
            .expect("no batch has reached the transport yet")
    }

    /// Deliver the peer's initial metadata and fire the ready callback.
    pub fn deliver_initial_metadata(&self, entries: Vec<Metadatum>) {
        self.deliver_initial_metadata_full(entries, None);
    }

    pub fn deliver_initial_metadata_full(
        &self,
        entries: Vec<Metadatum>,
        deadline: Option<Instant>,
    ) {
        let (sink, peer_sink, ready) = self
            .state
            .lock()
            .recv_initial
            .take()
            .expect("no recv_initial_metadata op pending");
        {
            let mut batch = sink.lock();
            batch.list = entries.into_iter().collect();
            batch.deadline = deadline;
        }
        if let (Some(peer_sink), Some(peer)) = (peer_sink, self.state.lock().peer.clone()) {
            *peer_sink.lock() = Some(peer);
        }
        self.combiner().start(
            "recv_initial_metadata_ready",
            Box::new(move || ready(Ok(()))),
        );
    }

    /// Fail the pending recv-initial-metadata op.
    pub fn fail_initial_metadata(&self, error: Arc<OpError>) {
        let (_sink, _peer, ready) = self
            .state
            .lock()
            .recv_initial
            .take()
            .expect("no recv_initial_metadata op pending");
        self.combiner().start(
            "recv_initial_metadata_ready",
            Box::new(move || ready(Err(error))),
        );
    }

    /// Deliver a message stream and fire the ready callback.
    pub fn deliver_message_stream(&self, stream: Box<dyn ReceiveStream>) {
        let (sink, ready) = self
            .state
            .lock()
            .recv_message
            .take()
            .expect("no recv_message op pending");
        *sink.lock() = Some(stream);
        self.combiner()
            .start("recv_message_ready", Box::new(move || ready(Ok(()))));
    }

    /// Deliver a whole message as one ready slice.
    pub fn deliver_message(&self, data: &[u8]) {
        self.deliver_message_stream(Box::new(TestStream::ready(data)));
    }

    /// Signal end-of-stream: the peer half-closed with no message.
    pub fn deliver_end_of_stream(&self) {
        let (_sink, ready) = self
            .state
            .lock()
            .recv_message
            .take()
            .expect("no recv_message op pending");
        self.combiner()
            .start("recv_message_ready", Box::new(move || ready(Ok(()))));
    }

    /// Fail the pending recv-message op.
    pub fn fail_message(&self, error: Arc<OpError>) {
        let (_sink, ready) = self
            .state
            .lock()
            .recv_message
            .take()
            .expect("no recv_message op pending");
        self.combiner()
            .start("recv_message_ready", Box::new(move || ready(Err(error))));
    }

    /// Write the trailing metadata; it is consumed when the batch holding
    /// the final op completes.
    pub fn deliver_trailing_metadata(&self, entries: Vec<Metadatum>) {
        let sink = self
            .state
            .lock()
            .recv_trailing
            .take()
            .expect("no recv_trailing_metadata op pending");
        sink.lock().list = entries.into_iter().collect();
    }

    /// Complete the oldest outstanding batch.
    pub fn complete_next(&self) {
        self.complete_next_with(Ok(()));
    }

    pub fn complete_next_with(&self, result: Result<(), Arc<OpError>>) {
        let on_complete = self
            .state
            .lock()
            .on_complete
            .pop_front()
            .expect("no batch pending completion");
        self.combiner()
            .start("on_complete", Box::new(move || on_complete(result)));
    }

    /// Complete every outstanding batch, oldest first.
    pub fn complete_all(&self) {
        while self.pending_completions() > 0 {
            self.complete_next();
        }
    }

    pub fn pending_completions(&self) -> usize {
        self.state.lock().on_complete.len()
    }

    pub fn sent_initial_metadata(&self) -> Vec<SentInitialMetadata> {
        self.state.lock().sent_initial.clone()
    }

    pub fn sent_messages(&self) -> Vec<(crate::message::ByteBuffer, WriteFlags)> {
        self.state.lock().sent_messages.clone()
    }

    pub fn sent_trailing_metadata(&self) -> Vec<MetadataMap> {
        self.state.lock().sent_trailing.clone()
    }

    pub fn cancel_errors(&self) -> Vec<Arc<OpError>> {
        self.state.lock().cancels.clone()
    }
}

impl Transport for MockTransport {
    fn start(&self, batch: TransportOpBatch) {
        trace!(ops = %batch.describe(), "mock transport received batch");
        let mut state = self.state.lock();
        state.combiner = Some(batch.combiner.clone());

        if let Some(op) = batch.send_initial_metadata {
            let stored = op.sink.lock();
            state.sent_initial.push(SentInitialMetadata {
                metadata: stored.list.clone(),
                flags: op.flags,
                deadline: stored.deadline,
            });
            if let (Some(peer_sink), Some(peer)) = (op.peer, state.peer.clone()) {
                *peer_sink.lock() = Some(peer);
            }
        }
        if let Some(op) = batch.send_message {
            state
                .sent_messages
                .push((op.stream.buffer().clone(), op.stream.flags()));
        }
        if let Some(op) = batch.send_trailing_metadata {
            state.sent_trailing.push(op.sink.lock().list.clone());
        }
        if let Some(op) = batch.recv_initial_metadata {
            state.recv_initial = Some((op.sink, op.peer, op.ready));
        }
        if let Some(op) = batch.recv_message {
            state.recv_message = Some((op.stream, op.ready));
        }
        if let Some(op) = batch.recv_trailing_metadata {
            state.recv_trailing = Some(op.sink);
        }

        if let Some(op) = batch.cancel_stream {
            state.cancels.push(op.error);
            // Cancel batches complete synchronously.
            if let Some(on_complete) = batch.on_complete {
                drop(state);
                on_complete(Ok(()));
            }
            return;
        }
        if let Some(on_complete) = batch.on_complete {
            state.on_complete.push_back(on_complete);
        }
    }
}

struct TestStreamState {
    slices: VecDeque<Bytes>,
    total: usize,
    flags: WriteFlags,
    /// Return `Pending` once this many slices have been handed out.
    suspend_after: Option<usize>,
    delivered: usize,
    waiting: Option<SliceReady>,
    fail_next: Option<Arc<OpError>>,
}

/// A vec-backed [`ReceiveStream`].
pub struct TestStream {
    state: Arc<Mutex<TestStreamState>>,
}

/// Test-side control over a suspending [`TestStream`].
#[derive(Clone)]
pub struct TestStreamHandle {
    state: Arc<Mutex<TestStreamState>>,
}

impl TestStream {
    /// A stream delivering all slices synchronously.
    pub fn ready(data: &[u8]) -> Self {
        TestStream::from_slices(vec![Bytes::copy_from_slice(data)], WriteFlags::empty())
    }

    pub fn from_slices(slices: Vec<Bytes>, flags: WriteFlags) -> Self {
        let total = slices.iter().map(Bytes::len).sum();
        TestStream {
            state: Arc::new(Mutex::new(TestStreamState {
                slices: slices.into(),
                total,
                flags,
                suspend_after: None,
                delivered: 0,
                waiting: None,
                fail_next: None,
            })),
        }
    }

    /// A compressed stream: tagged so the call wraps it in a
    /// raw-compressed buffer.
    pub fn compressed(data: &[u8]) -> Self {
        TestStream::from_slices(
            vec![Bytes::copy_from_slice(data)],
            WriteFlags::INTERNAL_COMPRESS,
        )
    }

    /// A stream that suspends after `after` slices; resume through the
    /// returned handle.
    pub fn suspending(
        slices: Vec<Bytes>,
        flags: WriteFlags,
        after: usize,
    ) -> (Self, TestStreamHandle) {
        let stream = TestStream::from_slices(slices, flags);
        stream.state.lock().suspend_after = Some(after);
        let handle = TestStreamHandle {
            state: stream.state.clone(),
        };
        (stream, handle)
    }
}

impl TestStreamHandle {
    /// Wake the stored continuation; the call resumes its pull loop.
    pub fn resume(&self) {
        let waiting = self.state.lock().waiting.take();
        waiting.expect("stream is not suspended")(Ok(()));
    }

    /// Fail the stream: the suspended continuation (or the next pull)
    /// observes the error.
    pub fn fail(&self, error: Arc<OpError>) {
        let waiting = {
            let mut state = self.state.lock();
            match state.waiting.take() {
                Some(w) => Some(w),
                None => {
                    state.fail_next = Some(error.clone());
                    None
                }
            }
        };
        if let Some(waiting) = waiting {
            waiting(Err(error));
        }
    }
}

impl ReceiveStream for TestStream {
    fn len(&self) -> usize {
        self.state.lock().total
    }

    fn flags(&self) -> WriteFlags {
        self.state.lock().flags
    }

    fn next_slice(&mut self, on_ready: SliceReady) -> Pull {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next.take() {
            return Pull::Err(error);
        }
        if state.suspend_after == Some(state.delivered) {
            state.suspend_after = None;
            state.waiting = Some(on_ready);
            return Pull::Pending;
        }
        match state.slices.pop_front() {
            Some(slice) => {
                state.delivered += 1;
                Pull::Ready(slice)
            }
            None => {
                // Length claims more data than the slices held; park the
                // continuation so a test can fail the stream explicitly.
                state.waiting = Some(on_ready);
                Pull::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_stream_delivers_all() {
        let mut stream = TestStream::from_slices(
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
            WriteFlags::empty(),
        );
        assert_eq!(stream.len(), 4);
        match stream.next_slice(Box::new(|_| {})) {
            Pull::Ready(s) => assert_eq!(&s[..], b"ab"),
            _ => panic!("expected ready"),
        }
        match stream.next_slice(Box::new(|_| {})) {
            Pull::Ready(s) => assert_eq!(&s[..], b"cd"),
            _ => panic!("expected ready"),
        }
    }

    #[test]
    fn test_suspending_stream_resumes() {
        let (mut stream, handle) = TestStream::suspending(
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
            WriteFlags::empty(),
            1,
        );
        match stream.next_slice(Box::new(|_| {})) {
            Pull::Ready(s) => assert_eq!(&s[..], b"ab"),
            _ => panic!("expected ready"),
        }
        let resumed = Arc::new(Mutex::new(false));
        let resumed2 = resumed.clone();
        match stream.next_slice(Box::new(move |r| {
            assert!(r.is_ok());
            *resumed2.lock() = true;
        })) {
            Pull::Pending => {}
            _ => panic!("expected pending"),
        }
        handle.resume();
        assert!(*resumed.lock());
        match stream.next_slice(Box::new(|_| {})) {
            Pull::Ready(s) => assert_eq!(&s[..], b"cd"),
            _ => panic!("expected ready"),
        }
    }
}
