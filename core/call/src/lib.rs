// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Per-RPC call objects over a layered transport.
//!
//! A [`Call`] coordinates one in-flight RPC: it plans user batches onto a
//! single transport stream, filters metadata on the way in and out,
//! consolidates final status from several racing sources, and propagates
//! cancellation through parent/child call trees. Completion is reported
//! either through a [`CompletionQueue`] or by invoking a continuation
//! directly.
//!
//! The transport below is abstracted by [`transport::Transport`]; an
//! in-memory implementation for tests lives in [`testing`].

mod batch;
mod call;
mod channel;
mod combiner;
mod completion;
mod context;
mod error;
mod message;
mod metadata;
mod ops;
mod status;
pub mod testing;
pub mod transport;

pub use call::{
    Call, CallArgs, MAX_SEND_EXTRA_METADATA, ParentSpec, PropagationMask, ServerTransportData,
};
pub use channel::{Channel, ChannelConfig, CompressionOptions, FinalInfo};
pub use combiner::{CallCombiner, CancelNotify, CombinerJob};
pub use completion::{CompletionEvent, CompletionQueue, Tag};
pub use context::{ContextKind, ContextValue};
pub use error::{CallError, OpError};
pub use message::{ByteBuffer, Pull, ReceiveStream, SliceBufferStream, SliceReady};
pub use metadata::{
    ACCEPT_ENCODING, CONTENT_ENCODING, GRPC_ACCEPT_ENCODING, GRPC_ENCODING,
    GRPC_INTERNAL_ENCODING_REQUEST, GRPC_MESSAGE, GRPC_STATUS, MetadataBatch, MetadataMap,
    Metadatum, PATH, is_binary_key, validate_key, validate_nonbin_value,
};
pub use ops::{InitialMetadataFlags, MAX_OPS_PER_BATCH, Op, RecvSlot, WriteFlags};
pub use status::{Code, FinalStatus, StatusSource};
