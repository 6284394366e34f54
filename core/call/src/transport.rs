// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The seam between the call and the layered transport below it.
//!
//! The call translates a user batch into one [`TransportOpBatch`] and
//! hands it to the [`Transport`]. Received data flows back through the
//! sink handles carried by the batch; continuations are delivered through
//! the call combiner that ships with the batch.

// Standard library imports
use std::sync::Arc;

// Third-party crates
use parking_lot::Mutex;

// Local crate
use crate::combiner::CallCombiner;
use crate::error::OpError;
use crate::message::{ReceiveStream, SliceBufferStream};
use crate::metadata::MetadataBatch;
use crate::ops::InitialMetadataFlags;

/// Continuation invoked when an op (or the whole batch) completes.
pub type OpClosure = Box<dyn FnOnce(Result<(), Arc<OpError>>) + Send>;

/// Shared handle the transport deposits received metadata into.
pub type MetadataSink = Arc<Mutex<MetadataBatch>>;

/// Shared handle the transport deposits the received message stream into.
pub type StreamSink = Arc<Mutex<Option<Box<dyn ReceiveStream>>>>;

/// Shared handle for the peer identity string.
pub type PeerSink = Arc<Mutex<Option<String>>>;

pub struct SendInitialMetadataOp {
    /// The call's sending-initial batch; the deadline to put on the wire
    /// rides inside it.
    pub sink: MetadataSink,
    pub flags: InitialMetadataFlags,
    /// Where the transport may record the peer identity (client).
    pub peer: Option<PeerSink>,
}

pub struct SendMessageOp {
    pub stream: SliceBufferStream,
}

pub struct SendTrailingMetadataOp {
    pub sink: MetadataSink,
}

pub struct RecvInitialMetadataOp {
    pub sink: MetadataSink,
    /// Where the transport may record the peer identity (server).
    pub peer: Option<PeerSink>,
    /// Fired once the metadata has been written to `sink`.
    pub ready: OpClosure,
}

pub struct RecvMessageOp {
    pub stream: StreamSink,
    /// Fired once a stream (or `None` for end-of-stream) is in place.
    pub ready: OpClosure,
}

pub struct RecvTrailingMetadataOp {
    pub sink: MetadataSink,
}

pub struct CancelStreamOp {
    pub error: Arc<OpError>,
}

/// One batch of transport-level ops, at most one op per kind.
///
/// Continuations must be delivered through [`TransportOpBatch::combiner`]
/// (`start` a job that invokes the closure); the closures yield the
/// combiner themselves before processing.
pub struct TransportOpBatch {
    pub combiner: Arc<CallCombiner>,
    pub send_initial_metadata: Option<SendInitialMetadataOp>,
    pub send_message: Option<SendMessageOp>,
    pub send_trailing_metadata: Option<SendTrailingMetadataOp>,
    pub recv_initial_metadata: Option<RecvInitialMetadataOp>,
    pub recv_message: Option<RecvMessageOp>,
    pub recv_trailing_metadata: Option<RecvTrailingMetadataOp>,
    pub cancel_stream: Option<CancelStreamOp>,
    /// Fired when every transport-side effect of the batch is done.
    pub on_complete: Option<OpClosure>,
}

impl TransportOpBatch {
    pub fn new(combiner: Arc<CallCombiner>) -> Self {
        TransportOpBatch {
            combiner,
            send_initial_metadata: None,
            send_message: None,
            send_trailing_metadata: None,
            recv_initial_metadata: None,
            recv_message: None,
            recv_trailing_metadata: None,
            cancel_stream: None,
            on_complete: None,
        }
    }

    /// Compact description of the ops present, for logs.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.send_initial_metadata.is_some() {
            parts.push("send_initial_metadata");
        }
        if self.send_message.is_some() {
            parts.push("send_message");
        }
        if self.send_trailing_metadata.is_some() {
            parts.push("send_trailing_metadata");
        }
        if self.recv_initial_metadata.is_some() {
            parts.push("recv_initial_metadata");
        }
        if self.recv_message.is_some() {
            parts.push("recv_message");
        }
        if self.recv_trailing_metadata.is_some() {
            parts.push("recv_trailing_metadata");
        }
        if self.cancel_stream.is_some() {
            parts.push("cancel_stream");
        }
        parts.join("+")
    }
}

/// The filter stack below the call.
///
/// `start` is invoked under the call combiner; implementations stage the
/// ops and return. Asynchronous deliveries happen later, on any thread,
/// through the batch's sinks and continuations.
pub trait Transport: Send + Sync {
    fn start(&self, batch: TransportOpBatch);
}
