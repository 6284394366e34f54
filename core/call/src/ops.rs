// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The batch operation surface: op kinds, their payloads, flags, and the
//! slots receive results are delivered into.

// Standard library imports
use std::sync::Arc;

// Third-party crates
use bitflags::bitflags;
use parking_lot::Mutex;

use wirecall_compression::CompressionLevel;

// Local crate
use crate::message::ByteBuffer;
use crate::metadata::MetadataMap;
use crate::status::{Code, FinalStatus};

/// Up to six ops per batch, one per slot kind.
pub const MAX_OPS_PER_BATCH: usize = 6;

bitflags! {
    /// Flags carried by write-side ops.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Hint that the write may be coalesced with following writes.
        const BUFFER_HINT = 1 << 0;
        /// Force no compression for this write.
        const NO_COMPRESS = 1 << 1;
        /// Bypass write-path filters that honor this flag.
        const THROUGH = 1 << 2;
        /// Set by the call itself: the payload is already compressed.
        const INTERNAL_COMPRESS = 1 << 31;
    }
}

impl WriteFlags {
    /// The flags an application is allowed to pass.
    pub fn user_mask() -> WriteFlags {
        WriteFlags::BUFFER_HINT | WriteFlags::NO_COMPRESS | WriteFlags::THROUGH
    }
}

bitflags! {
    /// Flags carried by `SendInitialMetadata`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InitialMetadataFlags: u32 {
        /// The request is idempotent (client only).
        const IDEMPOTENT_REQUEST = 1 << 4;
        /// Wait for the channel to be ready before failing.
        const WAIT_FOR_READY = 1 << 5;
        /// The request is safe to cache.
        const CACHEABLE_REQUEST = 1 << 6;
        /// `WAIT_FOR_READY` was set explicitly by the application.
        const WAIT_FOR_READY_EXPLICITLY_SET = 1 << 7;
        /// Hold the metadata until the first write.
        const CORKED = 1 << 8;
    }
}

/// The six semantic op slots. At most one in-flight batch may use a given
/// slot; the mapping collapses the client/server-specific final ops onto
/// shared slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum OpSlot {
    SendInitialMetadata = 0,
    SendMessage = 1,
    SendFinalOp = 2,
    RecvInitialMetadata = 3,
    RecvMessage = 4,
    RecvFinalOp = 5,
}

impl OpSlot {
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(idx: usize) -> Option<OpSlot> {
        match idx {
            0 => Some(OpSlot::SendInitialMetadata),
            1 => Some(OpSlot::SendMessage),
            2 => Some(OpSlot::SendFinalOp),
            3 => Some(OpSlot::RecvInitialMetadata),
            4 => Some(OpSlot::RecvMessage),
            5 => Some(OpSlot::RecvFinalOp),
            _ => None,
        }
    }
}

/// A cell the call fills when a receive op completes; the application
/// keeps a clone and reads it after the batch completion arrives.
#[derive(Debug)]
pub struct RecvSlot<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T> RecvSlot<T> {
    pub fn new() -> Self {
        RecvSlot {
            cell: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn put(&self, value: T) {
        *self.cell.lock() = Some(value);
    }

    /// Take the delivered value, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.cell.lock().take()
    }

    pub fn is_filled(&self) -> bool {
        self.cell.lock().is_some()
    }
}

impl<T> Default for RecvSlot<T> {
    fn default() -> Self {
        RecvSlot::new()
    }
}

impl<T> Clone for RecvSlot<T> {
    fn clone(&self) -> Self {
        RecvSlot {
            cell: self.cell.clone(),
        }
    }
}

/// One operation in a batch.
#[derive(Debug)]
pub enum Op {
    /// Emit the call's initial metadata. Client: request headers; server:
    /// response headers. At most once per call.
    SendInitialMetadata {
        metadata: MetadataMap,
        flags: InitialMetadataFlags,
        /// Requested compression effort; resolved against what the peer
        /// accepts (server only).
        compression_level: Option<CompressionLevel>,
    },
    /// Send one message. At most one in flight at a time.
    SendMessage {
        message: ByteBuffer,
        flags: WriteFlags,
    },
    /// Half-close the client's sending direction. Client only, at most
    /// once.
    SendCloseFromClient,
    /// Send trailing status. Server only, at most once.
    SendStatusFromServer {
        status: Code,
        details: Option<String>,
        trailing_metadata: MetadataMap,
    },
    /// Receive the peer's initial metadata.
    RecvInitialMetadata { metadata: RecvSlot<MetadataMap> },
    /// Receive one message; `None` is delivered when the peer half-closed
    /// without another message.
    RecvMessage {
        message: RecvSlot<Option<ByteBuffer>>,
    },
    /// Receive trailing metadata and the final status. Client only, at
    /// most once.
    RecvStatusOnClient {
        status: RecvSlot<FinalStatus>,
        trailing_metadata: RecvSlot<MetadataMap>,
    },
    /// Learn whether the call was cancelled. Server only, at most once.
    RecvCloseOnServer { cancelled: RecvSlot<bool> },
}

impl Op {
    pub(crate) fn slot(&self) -> OpSlot {
        match self {
            Op::SendInitialMetadata { .. } => OpSlot::SendInitialMetadata,
            Op::SendMessage { .. } => OpSlot::SendMessage,
            Op::SendCloseFromClient | Op::SendStatusFromServer { .. } => OpSlot::SendFinalOp,
            Op::RecvInitialMetadata { .. } => OpSlot::RecvInitialMetadata,
            Op::RecvMessage { .. } => OpSlot::RecvMessage,
            Op::RecvStatusOnClient { .. } | Op::RecvCloseOnServer { .. } => OpSlot::RecvFinalOp,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Op::SendInitialMetadata { .. } => "send_initial_metadata",
            Op::SendMessage { .. } => "send_message",
            Op::SendCloseFromClient => "send_close_from_client",
            Op::SendStatusFromServer { .. } => "send_status_from_server",
            Op::RecvInitialMetadata { .. } => "recv_initial_metadata",
            Op::RecvMessage { .. } => "recv_message",
            Op::RecvStatusOnClient { .. } => "recv_status_on_client",
            Op::RecvCloseOnServer { .. } => "recv_close_on_server",
        }
    }
}
