// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Byte buffers and the stream seams between the call and the transport.

// Standard library imports
use std::sync::Arc;

// Third-party crates
use bytes::Bytes;

use wirecall_compression::CompressionAlgorithm;

// Local crate
use crate::error::OpError;
use crate::ops::WriteFlags;

/// An application-visible message body, kept as a list of slices.
///
/// A buffer tagged with a non-identity algorithm holds still-compressed
/// bytes; receive paths produce such buffers for zero-copy passthrough
/// when the incoming stream is compressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    slices: Vec<Bytes>,
    compression: CompressionAlgorithm,
}

impl ByteBuffer {
    /// An uncompressed buffer over the given slices.
    pub fn raw(slices: Vec<Bytes>) -> Self {
        ByteBuffer {
            slices,
            compression: CompressionAlgorithm::Identity,
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        ByteBuffer::raw(vec![data.into()])
    }

    /// An empty buffer that will hold bytes compressed with `algorithm`.
    pub fn raw_compressed(algorithm: CompressionAlgorithm) -> Self {
        ByteBuffer {
            slices: Vec::new(),
            compression: algorithm,
        }
    }

    /// Tag an existing buffer as compressed.
    pub fn with_compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.compression = algorithm;
        self
    }

    pub fn push(&mut self, slice: Bytes) {
        self.slices.push(slice);
    }

    /// Total byte length across slices.
    pub fn len(&self) -> usize {
        self.slices.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionAlgorithm::Identity
    }

    pub fn slices(&self) -> &[Bytes] {
        &self.slices
    }

    /// Flatten into one contiguous allocation.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for s in &self.slices {
            out.extend_from_slice(s);
        }
        out
    }
}

/// Continuation armed when a receive stream suspends.
pub type SliceReady = Box<dyn FnOnce(Result<(), Arc<OpError>>) + Send>;

/// Outcome of a pull on a receive stream.
pub enum Pull {
    /// A slice is available now.
    Ready(Bytes),
    /// Nothing yet; the stream stored the continuation and will invoke it
    /// when a slice (or an error) becomes available.
    Pending,
    /// The stream failed; it must not be pulled again.
    Err(Arc<OpError>),
}

/// A message body being delivered by the transport, one slice at a time.
///
/// Implementations must not invoke the stored continuation from inside
/// `next_slice`; a synchronous result is expressed with `Pull::Ready`.
pub trait ReceiveStream: Send {
    /// Total length of the message body.
    fn len(&self) -> usize;

    /// Write-flags the sender attached; `INTERNAL_COMPRESS` marks the
    /// body as compressed.
    fn flags(&self) -> WriteFlags;

    /// Attempt to obtain the next slice; see [`Pull`].
    fn next_slice(&mut self, on_ready: SliceReady) -> Pull;
}

/// Send-side stream wrapping the application's outgoing buffer.
#[derive(Debug)]
pub struct SliceBufferStream {
    buffer: ByteBuffer,
    flags: WriteFlags,
}

impl SliceBufferStream {
    pub fn new(buffer: ByteBuffer, flags: WriteFlags) -> Self {
        SliceBufferStream { buffer, flags }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn flags(&self) -> WriteFlags {
        self.flags
    }

    pub fn buffer(&self) -> &ByteBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> ByteBuffer {
        self.buffer
    }
}
