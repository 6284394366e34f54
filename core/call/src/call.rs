// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The per-RPC call object.
//!
//! A call multiplexes application batches onto one transport stream,
//! filters received metadata, consolidates final status from its racing
//! sources, and propagates cancellation through parent/child call trees.
//! Batches complete out of order on other threads; entry into the filter
//! stack is serialized by the call combiner, while call-level state uses
//! set-once atomics.

// Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

// Third-party crates
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use wirecall_compression::{
    CompressionAlgorithm, CompressionLevel, EncodingSet, MessageCompression, StreamCompression,
    algorithm_for_level, split_without_space,
};

// Local crate
use crate::batch::{BatchControl, BatchFlags, Notify};
use crate::channel::{Channel, FinalInfo};
use crate::combiner::CallCombiner;
use crate::completion::{CompletionEvent, CompletionQueue, Tag};
use crate::context::{ContextKind, ContextSlots, ContextValue};
use crate::error::{CallError, OpError};
use crate::message::{ByteBuffer, Pull, SliceBufferStream, SliceReady};
use crate::metadata::{
    ACCEPT_ENCODING, CONTENT_ENCODING, GRPC_ACCEPT_ENCODING, GRPC_ENCODING,
    GRPC_INTERNAL_ENCODING_REQUEST, GRPC_MESSAGE, GRPC_STATUS, MetadataBatch, MetadataMap,
    Metadatum, ValueCache, is_binary_key, validate_key, validate_nonbin_value,
};
use crate::ops::{InitialMetadataFlags, MAX_OPS_PER_BATCH, Op, RecvSlot, WriteFlags};
use crate::status::{Code, FinalStatus, StatusRegister, StatusSource};
use crate::transport::{
    CancelStreamOp, MetadataSink, OpClosure, PeerSink, RecvInitialMetadataOp, RecvMessageOp,
    RecvTrailingMetadataOp, SendInitialMetadataOp, SendMessageOp, SendTrailingMetadataOp,
    StreamSink, Transport, TransportOpBatch,
};

/// Client calls may prepend up to this many surface-supplied metadata
/// elements (method path, authority).
pub const MAX_SEND_EXTRA_METADATA: usize = 3;

// recv_state values; anything >= 2 names the op slot (index + 2) of the
// batch whose message arrived before initial metadata.
const RECV_NONE: usize = 0;
const RECV_INITIAL_METADATA_FIRST: usize = 1;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// Which parent attributes a child call inherits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropagationMask: u32 {
        const DEADLINE = 1 << 0;
        const CENSUS_STATS_CONTEXT = 1 << 1;
        const CENSUS_TRACING_CONTEXT = 1 << 2;
        const CANCELLATION = 1 << 3;
    }
}

impl Default for PropagationMask {
    fn default() -> Self {
        PropagationMask::all()
    }
}

/// Opaque marker: present on calls accepted by a server transport.
#[derive(Debug, Default)]
pub struct ServerTransportData;

/// Parent call plus the attributes the child inherits from it.
pub struct ParentSpec<'a> {
    pub call: &'a Call,
    pub propagation: PropagationMask,
}

/// Arguments to [`Call::create`].
pub struct CallArgs<'a> {
    pub channel: Arc<Channel>,
    pub transport: Arc<dyn Transport>,
    /// Terminal sink for tagged batch completions. Mutually exclusive
    /// with `polling_alternative`.
    pub completion_queue: Option<Arc<CompletionQueue>>,
    pub polling_alternative: bool,
    pub parent: Option<ParentSpec<'a>>,
    /// Present on server-accepted calls; absent means client.
    pub server_transport_data: Option<ServerTransportData>,
    pub send_deadline: Option<Instant>,
    /// Surface-prepended initial metadata (client only; carries the
    /// method path).
    pub add_initial_metadata: Vec<Metadatum>,
}

impl<'a> CallArgs<'a> {
    pub fn client(channel: Arc<Channel>, transport: Arc<dyn Transport>) -> Self {
        CallArgs {
            channel,
            transport,
            completion_queue: None,
            polling_alternative: false,
            parent: None,
            server_transport_data: None,
            send_deadline: None,
            add_initial_metadata: Vec::new(),
        }
    }

    pub fn server(channel: Arc<Channel>, transport: Arc<dyn Transport>) -> Self {
        CallArgs {
            server_transport_data: Some(ServerTransportData),
            ..CallArgs::client(channel, transport)
        }
    }
}

enum CompletionTarget {
    Queue(Arc<CompletionQueue>),
    PollingAlternative,
}

#[derive(Default)]
struct FinalOpSinks {
    client_status: Option<RecvSlot<FinalStatus>>,
    server_cancelled: Option<RecvSlot<bool>>,
}

/// Lazily-installed side structure of a call that has children.
struct ParentCall {
    children: Mutex<HashMap<u64, Weak<CallInner>>>,
}

impl ParentCall {
    fn new() -> Self {
        ParentCall {
            children: Mutex::new(HashMap::new()),
        }
    }
}

/// Strong link from a child to its parent; the parent only holds weak
/// ring membership, unlinked before this reference is dropped.
struct ChildLink {
    parent: Arc<CallInner>,
}

pub(crate) struct CallInner {
    id: u64,
    is_client: bool,
    cancellation_is_inherited: bool,
    channel: Arc<Channel>,
    transport: Arc<dyn Transport>,
    pub(crate) combiner: Arc<CallCombiner>,
    completion: Mutex<Option<CompletionTarget>>,
    start_time: Instant,
    send_deadline: Mutex<Option<Instant>>,

    // External handles; the last drop requests destruction.
    ext_ref: AtomicUsize,
    destroy_called: AtomicBool,

    // Per-direction latches; each prevents reuse of its op kind.
    sent_initial_metadata: AtomicBool,
    sending_message: AtomicBool,
    sent_final_op: AtomicBool,
    received_initial_metadata: AtomicBool,
    receiving_message: AtomicBool,
    requested_final_op: AtomicBool,
    any_ops_sent: AtomicBool,
    received_final_op: AtomicBool,

    active_batches: [Mutex<Option<Arc<BatchControl>>>; MAX_OPS_PER_BATCH],

    // The four metadata batches: (sending|receiving) x (initial|trailing).
    send_initial_store: MetadataSink,
    send_trailing_store: MetadataSink,
    recv_initial_store: MetadataSink,
    recv_trailing_store: MetadataSink,

    // User-owned outputs awaiting population.
    buffered_initial_metadata: Mutex<Option<RecvSlot<MetadataMap>>>,
    buffered_trailing_metadata: Mutex<Option<RecvSlot<MetadataMap>>>,
    final_ops: Mutex<FinalOpSinks>,

    // Race between initial-metadata-ready and first message-ready.
    recv_state: AtomicUsize,

    incoming_message_compression: Mutex<MessageCompression>,
    incoming_stream_compression: Mutex<StreamCompression>,
    encodings_accepted_by_peer: AtomicU32,
    last_message_flags: AtomicU32,

    send_extra_metadata: Mutex<Vec<Metadatum>>,
    peer: PeerSink,
    status: StatusRegister,

    receiving_stream: StreamSink,
    receiving_buffer: Mutex<Option<ByteBuffer>>,
    receiving_buffer_out: Mutex<Option<RecvSlot<Option<ByteBuffer>>>>,

    parent_call: OnceLock<ParentCall>,
    child: Mutex<Option<ChildLink>>,
    context: ContextSlots,

    status_code_cache: ValueCache<i32>,
    message_accept_cache: ValueCache<EncodingSet>,
    stream_accept_cache: ValueCache<EncodingSet>,
}

/// External handle to a call. Cloning takes an external reference;
/// dropping the last one requests destruction, injecting a synthetic
/// cancellation if ops were sent but the final op never arrived.
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    /// Create a call. Initialization problems are collected into a
    /// composite error; when one is returned the call has already been
    /// cancelled with it and will fail its batches accordingly.
    pub fn create(args: CallArgs<'_>) -> (Call, Option<Arc<OpError>>) {
        assert!(
            !(args.completion_queue.is_some() && args.polling_alternative),
            "only one of completion queue and polling alternative may be set"
        );
        let is_client = args.server_transport_data.is_none();
        let mut init_error: Option<OpError> = None;
        let mut add_init_error = |composite: &mut Option<OpError>, child: OpError| {
            composite
                .get_or_insert_with(|| OpError::new("call creation failed"))
                .add_child(Arc::new(child));
        };

        if is_client {
            assert!(
                args.add_initial_metadata.len() <= MAX_SEND_EXTRA_METADATA,
                "too many surface-supplied initial metadata elements"
            );
        } else {
            assert!(
                args.add_initial_metadata.is_empty(),
                "server calls take no surface-supplied initial metadata"
            );
        }

        let mut send_deadline = args.send_deadline;
        let mut cancellation_is_inherited = false;
        let mut immediately_cancel = false;
        let mut inherited_context: Vec<(ContextKind, ContextValue)> = Vec::new();

        if let Some(parent) = &args.parent {
            let p = &parent.call.inner;
            assert!(is_client, "only a client call may be linked under a parent");
            assert!(!p.is_client, "the parent of a call must be a server call");

            if parent.propagation.contains(PropagationMask::DEADLINE) {
                send_deadline = match (send_deadline, *p.send_deadline.lock()) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            let tracing = parent
                .propagation
                .contains(PropagationMask::CENSUS_TRACING_CONTEXT);
            let stats = parent
                .propagation
                .contains(PropagationMask::CENSUS_STATS_CONTEXT);
            if tracing && !stats {
                add_init_error(
                    &mut init_error,
                    OpError::new(
                        "census tracing propagation requested without census stats propagation",
                    ),
                );
            } else if stats && !tracing {
                add_init_error(
                    &mut init_error,
                    OpError::new(
                        "census stats propagation requested without census tracing propagation",
                    ),
                );
            } else if tracing && stats {
                for kind in [ContextKind::Tracing, ContextKind::Stats] {
                    if let Some(value) = p.context.get(kind) {
                        inherited_context.push((kind, value));
                    }
                }
            }
            if parent.propagation.contains(PropagationMask::CANCELLATION) {
                cancellation_is_inherited = true;
                if p.received_final_op.load(Ordering::Acquire) {
                    immediately_cancel = true;
                }
            }
        }

        let completion = match (args.completion_queue, args.polling_alternative) {
            (Some(cq), _) => Some(CompletionTarget::Queue(cq)),
            (None, true) => Some(CompletionTarget::PollingAlternative),
            (None, false) => None,
        };

        let inner = Arc::new(CallInner {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            is_client,
            cancellation_is_inherited,
            channel: args.channel,
            transport: args.transport,
            combiner: Arc::new(CallCombiner::new()),
            completion: Mutex::new(completion),
            start_time: Instant::now(),
            send_deadline: Mutex::new(send_deadline),
            ext_ref: AtomicUsize::new(1),
            destroy_called: AtomicBool::new(false),
            sent_initial_metadata: AtomicBool::new(false),
            sending_message: AtomicBool::new(false),
            sent_final_op: AtomicBool::new(false),
            received_initial_metadata: AtomicBool::new(false),
            receiving_message: AtomicBool::new(false),
            requested_final_op: AtomicBool::new(false),
            any_ops_sent: AtomicBool::new(false),
            received_final_op: AtomicBool::new(false),
            active_batches: std::array::from_fn(|_| Mutex::new(None)),
            send_initial_store: Arc::new(Mutex::new(MetadataBatch::default())),
            send_trailing_store: Arc::new(Mutex::new(MetadataBatch::default())),
            recv_initial_store: Arc::new(Mutex::new(MetadataBatch::default())),
            recv_trailing_store: Arc::new(Mutex::new(MetadataBatch::default())),
            buffered_initial_metadata: Mutex::new(None),
            buffered_trailing_metadata: Mutex::new(None),
            final_ops: Mutex::new(FinalOpSinks::default()),
            recv_state: AtomicUsize::new(RECV_NONE),
            incoming_message_compression: Mutex::new(MessageCompression::None),
            incoming_stream_compression: Mutex::new(StreamCompression::None),
            encodings_accepted_by_peer: AtomicU32::new(
                EncodingSet::identity_only().to_bits(),
            ),
            last_message_flags: AtomicU32::new(0),
            send_extra_metadata: Mutex::new(args.add_initial_metadata),
            peer: Arc::new(Mutex::new(None)),
            status: StatusRegister::new(),
            receiving_stream: Arc::new(Mutex::new(None)),
            receiving_buffer: Mutex::new(None),
            receiving_buffer_out: Mutex::new(None),
            parent_call: OnceLock::new(),
            child: Mutex::new(None),
            context: ContextSlots::new(),
            status_code_cache: ValueCache::new(),
            message_accept_cache: ValueCache::new(),
            stream_accept_cache: ValueCache::new(),
        });
        trace!(id = inner.id, is_client, "call created");

        for (kind, value) in inherited_context {
            inner.context.set(kind, value);
        }

        if let Some(parent) = &args.parent {
            let p = parent.call.inner.clone();
            let pc = p.parent_call.get_or_init(ParentCall::new);
            pc.children.lock().insert(inner.id, Arc::downgrade(&inner));
            *inner.child.lock() = Some(ChildLink { parent: p });
        }

        let error = init_error.map(Arc::new);
        if let Some(e) = &error {
            CallInner::cancel_with_error(&inner, StatusSource::Surface, e.clone());
        }
        if immediately_cancel {
            CallInner::cancel_with_error(
                &inner,
                StatusSource::ApiOverride,
                Arc::new(OpError::cancelled()),
            );
        }

        (Call { inner }, error)
    }

    /// Submit a batch; its completion surfaces on the completion queue
    /// under `tag`.
    pub fn start_batch(&self, ops: Vec<Op>, tag: Tag) -> Result<(), CallError> {
        CallInner::start_batch_inner(&self.inner, ops, Notify::Tag(tag))
    }

    /// Submit a batch; `on_complete` is invoked directly with the
    /// consolidated result. Internal-surface variant of [`start_batch`].
    ///
    /// [`start_batch`]: Call::start_batch
    pub fn start_batch_and_execute(
        &self,
        ops: Vec<Op>,
        on_complete: OpClosure,
    ) -> Result<(), CallError> {
        CallInner::start_batch_inner(&self.inner, ops, Notify::Closure(on_complete))
    }

    /// Cancel the call.
    pub fn cancel(&self) {
        CallInner::cancel_with_error(
            &self.inner,
            StatusSource::ApiOverride,
            Arc::new(OpError::cancelled()),
        );
    }

    /// Cancel the call with an explicit status.
    pub fn cancel_with_status(&self, code: Code, description: impl Into<String>) {
        CallInner::cancel_with_error(
            &self.inner,
            StatusSource::ApiOverride,
            Arc::new(OpError::from_status(code, description)),
        );
    }

    /// Bind a completion queue. Panics if a polling alternative was
    /// already installed; the call contract cannot be satisfied then.
    pub fn set_completion_queue(&self, cq: Arc<CompletionQueue>) {
        let mut guard = self.inner.completion.lock();
        if matches!(&*guard, Some(CompletionTarget::PollingAlternative)) {
            panic!("a polling alternative is already registered for this call");
        }
        *guard = Some(CompletionTarget::Queue(cq));
    }

    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The peer identity: transport-reported, else the channel target,
    /// else `"unknown"`.
    pub fn peer(&self) -> String {
        if let Some(peer) = self.inner.peer.lock().clone() {
            return peer;
        }
        let target = self.inner.channel.target();
        if !target.is_empty() {
            return target.to_string();
        }
        "unknown".to_string()
    }

    /// Resolve a compression level against what the peer accepts.
    pub fn compression_for_level(&self, level: CompressionLevel) -> CompressionAlgorithm {
        self.inner.compression_for_level(level)
    }

    /// The filter stack below this call.
    pub fn transport_stack(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub fn send_deadline(&self) -> Option<Instant> {
        *self.inner.send_deadline.lock()
    }

    pub fn context_set(&self, kind: ContextKind, value: ContextValue) {
        self.inner.context.set(kind, value);
    }

    pub fn context_get(&self, kind: ContextKind) -> Option<ContextValue> {
        self.inner.context.get(kind)
    }

    // Observers used by tests and diagnostics.

    pub fn incoming_message_compression(&self) -> MessageCompression {
        *self.inner.incoming_message_compression.lock()
    }

    pub fn incoming_stream_compression(&self) -> StreamCompression {
        *self.inner.incoming_stream_compression.lock()
    }

    pub fn encodings_accepted_by_peer(&self) -> EncodingSet {
        EncodingSet::from_bits(self.inner.encodings_accepted_by_peer.load(Ordering::Acquire))
    }

    pub fn last_message_flags(&self) -> WriteFlags {
        WriteFlags::from_bits_truncate(self.inner.last_message_flags.load(Ordering::Relaxed))
    }
}

impl Clone for Call {
    fn clone(&self) -> Self {
        self.inner.ext_ref.fetch_add(1, Ordering::Relaxed);
        Call {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if self.inner.ext_ref.fetch_sub(1, Ordering::AcqRel) == 1 {
            CallInner::on_last_external_unref(&self.inner);
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("is_client", &self.inner.is_client)
            .finish()
    }
}

/// Staged transport payloads built while applying a validated batch.
#[derive(Default)]
struct Plan {
    send_initial: Option<InitialMetadataFlags>,
    send_message: Option<SliceBufferStream>,
    send_trailing: bool,
    recv_initial: bool,
    recv_message: bool,
    recv_trailing: bool,
}

impl CallInner {
    fn start_batch_inner(
        this: &Arc<CallInner>,
        ops: Vec<Op>,
        notify: Notify,
    ) -> Result<(), CallError> {
        debug!(
            id = this.id,
            nops = ops.len(),
            ops = %ops.iter().map(Op::kind_name).collect::<Vec<_>>().join("+"),
            "starting batch"
        );

        if ops.is_empty() {
            match notify {
                Notify::Tag(tag) => this.post_completion_event(tag, Ok(())),
                Notify::Closure(closure) => closure(Ok(())),
            }
            return Ok(());
        }

        this.validate_ops(&ops)?;

        let slot = ops[0].slot();
        let mut slot_guard = this.active_batches[slot.index()].lock();
        if slot_guard.is_some() {
            return Err(CallError::TooManyOperations);
        }

        // Validation passed: apply is infallible from here on.
        let mut plan = Plan::default();
        let mut steps = 1usize; // transport on_complete
        for op in ops {
            match op {
                Op::SendInitialMetadata {
                    mut metadata,
                    flags,
                    compression_level,
                } => {
                    this.sent_initial_metadata.store(true, Ordering::SeqCst);
                    let level = compression_level
                        .or(this.channel.compression_options().default_level);
                    let mut out = MetadataMap::new();
                    for md in this.send_extra_metadata.lock().drain(..) {
                        out.push(md);
                    }
                    if let (Some(level), false) = (level, this.is_client) {
                        // Picked up downstream and turned into the
                        // outgoing grpc-encoding header.
                        let algorithm = this.compression_for_level(level);
                        out.push(Metadatum::new(
                            GRPC_INTERNAL_ENCODING_REQUEST,
                            Bytes::from_static(algorithm.name().as_bytes()),
                        ));
                    }
                    out.extend(metadata.take());
                    {
                        let mut store = this.send_initial_store.lock();
                        store.list = out;
                        store.deadline = if this.is_client {
                            *this.send_deadline.lock()
                        } else {
                            None
                        };
                    }
                    plan.send_initial = Some(flags);
                }
                Op::SendMessage { message, flags } => {
                    this.sending_message.store(true, Ordering::SeqCst);
                    let mut flags = flags;
                    if message.is_compressed() {
                        // Already-compressed payload: downstream skips
                        // further compression attempts.
                        flags |= WriteFlags::INTERNAL_COMPRESS;
                    }
                    plan.send_message = Some(SliceBufferStream::new(message, flags));
                }
                Op::SendCloseFromClient => {
                    this.sent_final_op.store(true, Ordering::SeqCst);
                    this.send_trailing_store.lock().clear();
                    plan.send_trailing = true;
                }
                Op::SendStatusFromServer {
                    status,
                    details,
                    mut trailing_metadata,
                } => {
                    this.sent_final_op.store(true, Ordering::SeqCst);
                    let mut out = MetadataMap::new();
                    out.push(Metadatum::new(
                        GRPC_STATUS,
                        Bytes::from(status.as_i32().to_string()),
                    ));
                    let mut override_error = OpError::new("error from server send status")
                        .with_code(status)
                        .with_wire_message(details.clone().unwrap_or_default());
                    if let Some(details) = details {
                        out.push(Metadatum::new(GRPC_MESSAGE, Bytes::from(details.clone())));
                        override_error = override_error.with_wire_message(details);
                    }
                    // Locally-visible final status must agree with what
                    // is sent on the wire.
                    this.status
                        .set(StatusSource::ApiOverride, Arc::new(override_error));
                    out.extend(trailing_metadata.take());
                    this.send_trailing_store.lock().list = out;
                    plan.send_trailing = true;
                }
                Op::RecvInitialMetadata { metadata } => {
                    this.received_initial_metadata.store(true, Ordering::SeqCst);
                    *this.buffered_initial_metadata.lock() = Some(metadata);
                    plan.recv_initial = true;
                    steps += 1;
                }
                Op::RecvMessage { message } => {
                    this.receiving_message.store(true, Ordering::SeqCst);
                    *this.receiving_buffer_out.lock() = Some(message);
                    plan.recv_message = true;
                    steps += 1;
                }
                Op::RecvStatusOnClient {
                    status,
                    trailing_metadata,
                } => {
                    this.requested_final_op.store(true, Ordering::SeqCst);
                    *this.buffered_trailing_metadata.lock() = Some(trailing_metadata);
                    this.final_ops.lock().client_status = Some(status);
                    plan.recv_trailing = true;
                }
                Op::RecvCloseOnServer { cancelled } => {
                    this.requested_final_op.store(true, Ordering::SeqCst);
                    this.final_ops.lock().server_cancelled = Some(cancelled);
                    plan.recv_trailing = true;
                }
            }
        }

        let flags = BatchFlags {
            send_initial_metadata: plan.send_initial.is_some(),
            send_message: plan.send_message.is_some(),
            send_trailing_metadata: plan.send_trailing,
            recv_initial_metadata: plan.recv_initial,
            recv_message: plan.recv_message,
            recv_trailing_metadata: plan.recv_trailing,
        };
        let bctl = Arc::new(BatchControl::new(
            this.clone(),
            slot,
            flags,
            steps,
            notify,
        ));
        *slot_guard = Some(bctl.clone());
        drop(slot_guard);

        let mut batch = TransportOpBatch::new(this.combiner.clone());
        if let Some(md_flags) = plan.send_initial {
            batch.send_initial_metadata = Some(SendInitialMetadataOp {
                sink: this.send_initial_store.clone(),
                flags: md_flags,
                peer: this.is_client.then(|| this.peer.clone()),
            });
        }
        if let Some(stream) = plan.send_message {
            batch.send_message = Some(SendMessageOp { stream });
        }
        if plan.send_trailing {
            batch.send_trailing_metadata = Some(SendTrailingMetadataOp {
                sink: this.send_trailing_store.clone(),
            });
        }
        if plan.recv_initial {
            batch.recv_initial_metadata = Some(RecvInitialMetadataOp {
                sink: this.recv_initial_store.clone(),
                peer: (!this.is_client).then(|| this.peer.clone()),
                ready: Self::make_recv_initial_metadata_ready(bctl.clone()),
            });
        }
        if plan.recv_message {
            batch.recv_message = Some(RecvMessageOp {
                stream: this.receiving_stream.clone(),
                ready: Self::make_recv_message_ready(bctl.clone()),
            });
        }
        if plan.recv_trailing {
            batch.recv_trailing_metadata = Some(RecvTrailingMetadataOp {
                sink: this.recv_trailing_store.clone(),
            });
        }
        batch.on_complete = Some(Self::make_finish_batch(bctl));

        this.any_ops_sent.store(true, Ordering::Release);
        this.execute_batch(batch);
        Ok(())
    }

    /// Check every batch rule without mutating anything; the first
    /// matching rule wins.
    fn validate_ops(&self, ops: &[Op]) -> Result<(), CallError> {
        let mut sent_initial = self.sent_initial_metadata.load(Ordering::SeqCst);
        let mut sending = self.sending_message.load(Ordering::SeqCst);
        let mut sent_final = self.sent_final_op.load(Ordering::SeqCst);
        let mut received_initial = self.received_initial_metadata.load(Ordering::SeqCst);
        let mut receiving = self.receiving_message.load(Ordering::SeqCst);
        let mut requested_final = self.requested_final_op.load(Ordering::SeqCst);

        for op in ops {
            match op {
                Op::SendInitialMetadata {
                    metadata, flags, ..
                } => {
                    if !self.is_client
                        && flags.contains(InitialMetadataFlags::IDEMPOTENT_REQUEST)
                    {
                        return Err(CallError::InvalidFlags);
                    }
                    if sent_initial {
                        return Err(CallError::TooManyOperations);
                    }
                    sent_initial = true;
                    validate_metadata(metadata)?;
                }
                Op::SendMessage { flags, .. } => {
                    if flags.intersects(!WriteFlags::user_mask()) {
                        return Err(CallError::InvalidFlags);
                    }
                    if sending {
                        return Err(CallError::TooManyOperations);
                    }
                    sending = true;
                }
                Op::SendCloseFromClient => {
                    if !self.is_client {
                        return Err(CallError::NotOnServer);
                    }
                    if sent_final {
                        return Err(CallError::TooManyOperations);
                    }
                    sent_final = true;
                }
                Op::SendStatusFromServer {
                    trailing_metadata, ..
                } => {
                    if self.is_client {
                        return Err(CallError::NotOnClient);
                    }
                    if sent_final {
                        return Err(CallError::TooManyOperations);
                    }
                    sent_final = true;
                    validate_metadata(trailing_metadata)?;
                }
                Op::RecvInitialMetadata { .. } => {
                    if received_initial {
                        return Err(CallError::TooManyOperations);
                    }
                    received_initial = true;
                }
                Op::RecvMessage { .. } => {
                    if receiving {
                        return Err(CallError::TooManyOperations);
                    }
                    receiving = true;
                }
                Op::RecvStatusOnClient { .. } => {
                    if !self.is_client {
                        return Err(CallError::NotOnServer);
                    }
                    if requested_final {
                        return Err(CallError::TooManyOperations);
                    }
                    requested_final = true;
                }
                Op::RecvCloseOnServer { .. } => {
                    if self.is_client {
                        return Err(CallError::NotOnClient);
                    }
                    if requested_final {
                        return Err(CallError::TooManyOperations);
                    }
                    requested_final = true;
                }
            }
        }
        Ok(())
    }

    fn execute_batch(&self, batch: TransportOpBatch) {
        let transport = self.transport.clone();
        let combiner = self.combiner.clone();
        self.combiner.start(
            "executing batch",
            Box::new(move || {
                trace!(ops = %batch.describe(), "handing batch to the transport");
                transport.start(batch);
                combiner.stop("batch submitted");
            }),
        );
    }

    fn post_completion_event(&self, tag: Tag, result: Result<(), Arc<OpError>>) {
        match &*self.completion.lock() {
            Some(CompletionTarget::Queue(cq)) => cq.post(CompletionEvent { tag, result }),
            _ => panic!("a tagged batch requires a completion queue"),
        }
    }

    pub(crate) fn compression_for_level(&self, level: CompressionLevel) -> CompressionAlgorithm {
        let accepted =
            EncodingSet::from_bits(self.encodings_accepted_by_peer.load(Ordering::Acquire));
        algorithm_for_level(level, accepted)
    }

    // ---- cancellation ----------------------------------------------------

    pub(crate) fn cancel_with_error(
        this: &Arc<CallInner>,
        source: StatusSource,
        error: Arc<OpError>,
    ) {
        debug!(id = this.id, source = ?source, error = %error, "cancelling call");
        // Held until the cancel batch completes.
        let termination = this.clone();
        this.combiner.cancel(error.clone());
        this.status.set(source, error.clone());

        let mut batch = TransportOpBatch::new(this.combiner.clone());
        batch.cancel_stream = Some(CancelStreamOp { error });
        let combiner = this.combiner.clone();
        batch.on_complete = Some(Box::new(move |_result| {
            combiner.stop("on_complete for cancel_stream op");
            drop(termination);
        }));
        this.execute_batch(batch);
    }

    fn cancel_with_status_from(
        this: &Arc<CallInner>,
        source: StatusSource,
        code: Code,
        description: String,
    ) {
        Self::cancel_with_error(this, source, Arc::new(OpError::from_status(code, description)));
    }

    // ---- teardown --------------------------------------------------------

    fn on_last_external_unref(this: &Arc<CallInner>) {
        // Unlink from the parent's ring before dropping the parent
        // reference.
        let child = this.child.lock().take();
        if let Some(link) = child {
            if let Some(pc) = link.parent.parent_call.get() {
                pc.children.lock().remove(&this.id);
            }
            drop(link);
        }

        let already = this.destroy_called.swap(true, Ordering::AcqRel);
        assert!(!already, "call destroyed twice");

        let cancel = this.any_ops_sent.load(Ordering::Acquire)
            && !this.received_final_op.load(Ordering::Acquire);
        if cancel {
            Self::cancel_with_error(this, StatusSource::ApiOverride, Arc::new(OpError::cancelled()));
        } else {
            // Release any cancellation continuation still held by the
            // combiner so it can drop its references.
            this.combiner.set_notify_on_cancel(None);
        }
        trace!(id = this.id, "external handle released");
    }

    // ---- receive path ----------------------------------------------------

    fn make_finish_batch(bctl: Arc<BatchControl>) -> OpClosure {
        Box::new(move |result| {
            bctl.call.combiner.stop("on_complete");
            if let Err(error) = result {
                bctl.add_error(error, false);
            }
            bctl.finish_step();
        })
    }

    fn make_recv_initial_metadata_ready(bctl: Arc<BatchControl>) -> OpClosure {
        Box::new(move |result| {
            Self::receiving_initial_metadata_ready(&bctl, result);
        })
    }

    fn make_recv_message_ready(bctl: Arc<BatchControl>) -> OpClosure {
        Box::new(move |result| {
            bctl.call.combiner.stop("recv_message_ready");
            Self::receiving_stream_ready(&bctl, result);
        })
    }

    fn receiving_initial_metadata_ready(
        bctl: &Arc<BatchControl>,
        result: Result<(), Arc<OpError>>,
    ) {
        let call = &bctl.call;
        call.combiner.stop("recv_initial_metadata_ready");

        if let Err(error) = &result {
            bctl.add_error(error.clone(), false);
        }
        if result.is_ok() {
            let mut received = {
                let mut store = call.recv_initial_store.lock();
                MetadataBatch {
                    list: std::mem::take(&mut store.list),
                    deadline: store.deadline.take(),
                }
            };
            call.recv_initial_filter(&mut received.list);
            Self::validate_filtered_metadata(call);
            if let (false, Some(deadline)) = (call.is_client, received.deadline) {
                *call.send_deadline.lock() = Some(deadline);
            }
        }

        loop {
            let state = call.recv_state.load(Ordering::Acquire);
            if state == RECV_INITIAL_METADATA_FIRST {
                // A transport must deliver initial metadata at most once.
                error!(id = call.id, "initial metadata delivered twice");
                Self::cancel_with_status_from(
                    call,
                    StatusSource::Surface,
                    Code::Internal,
                    "initial metadata delivered twice".to_string(),
                );
                break;
            }
            if state == RECV_NONE {
                // The stashed batch pointer is never read on this path,
                // so no barrier is needed.
                if call
                    .recv_state
                    .compare_exchange(
                        RECV_NONE,
                        RECV_INITIAL_METADATA_FIRST,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            } else {
                // A message arrived first and parked its batch; resume it
                // now that compression is known.
                let pending = call.active_batches[state - 2].lock().clone();
                if let Some(pending) = pending {
                    Self::receiving_stream_ready(&pending, result.clone());
                }
                break;
            }
        }

        bctl.finish_step();
    }

    fn receiving_stream_ready(bctl: &Arc<BatchControl>, result: Result<(), Arc<OpError>>) {
        let call = &bctl.call;
        if let Err(error) = &result {
            *call.receiving_stream.lock() = None;
            bctl.add_error(error.clone(), true);
            Self::cancel_with_error(call, StatusSource::Surface, error.clone());
        }
        let stream_absent = call.receiving_stream.lock().is_none();
        // Parking the batch only makes sense for a live stream whose
        // metadata has not arrived yet; the release pairs with the
        // acquire load in receiving_initial_metadata_ready.
        if result.is_err()
            || stream_absent
            || call
                .recv_state
                .compare_exchange(
                    RECV_NONE,
                    bctl.slot.index() + 2,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_err()
        {
            Self::process_data_after_md(bctl);
        }
    }

    fn process_data_after_md(bctl: &Arc<BatchControl>) {
        let call = &bctl.call;
        let flags = call.receiving_stream.lock().as_ref().map(|s| s.flags());
        match flags {
            None => {
                if let Some(out) = call.receiving_buffer_out.lock().take() {
                    out.put(None);
                }
                call.receiving_message.store(false, Ordering::SeqCst);
                bctl.finish_step();
            }
            Some(flags) => {
                call.last_message_flags.store(flags.bits(), Ordering::Relaxed);
                let message_compression = *call.incoming_message_compression.lock();
                let buffer = if flags.contains(WriteFlags::INTERNAL_COMPRESS)
                    && message_compression != MessageCompression::None
                {
                    let algorithm = CompressionAlgorithm::from_parts(
                        message_compression,
                        StreamCompression::None,
                    )
                    .unwrap_or(CompressionAlgorithm::Identity);
                    ByteBuffer::raw_compressed(algorithm)
                } else {
                    ByteBuffer::raw(Vec::new())
                };
                *call.receiving_buffer.lock() = Some(buffer);
                Self::continue_receiving_slices(bctl);
            }
        }
    }

    fn continue_receiving_slices(bctl: &Arc<BatchControl>) {
        let call = &bctl.call;
        loop {
            let total = match call.receiving_stream.lock().as_ref() {
                Some(stream) => stream.len(),
                None => return,
            };
            let buffered = call
                .receiving_buffer
                .lock()
                .as_ref()
                .map(ByteBuffer::len)
                .unwrap_or(0);
            if buffered >= total {
                let buffer = call.receiving_buffer.lock().take();
                if let Some(out) = call.receiving_buffer_out.lock().take() {
                    out.put(buffer);
                }
                call.receiving_message.store(false, Ordering::SeqCst);
                *call.receiving_stream.lock() = None;
                bctl.finish_step();
                return;
            }
            let pull = {
                let mut guard = call.receiving_stream.lock();
                match guard.as_mut() {
                    Some(stream) => stream.next_slice(Self::make_slice_ready(bctl.clone())),
                    None => return,
                }
            };
            match pull {
                Pull::Ready(slice) => {
                    if let Some(buffer) = call.receiving_buffer.lock().as_mut() {
                        buffer.push(slice);
                    }
                }
                Pull::Pending => return,
                Pull::Err(error) => {
                    Self::fail_receiving_message(bctl, error);
                    return;
                }
            }
        }
    }

    fn make_slice_ready(bctl: Arc<BatchControl>) -> SliceReady {
        Box::new(move |result| match result {
            Ok(()) => Self::continue_receiving_slices(&bctl),
            Err(error) => Self::fail_receiving_message(&bctl, error),
        })
    }

    fn fail_receiving_message(bctl: &Arc<BatchControl>, error: Arc<OpError>) {
        let call = &bctl.call;
        debug!(id = call.id, error = %error, "message receive failed");
        *call.receiving_stream.lock() = None;
        *call.receiving_buffer.lock() = None;
        if let Some(out) = call.receiving_buffer_out.lock().take() {
            out.put(None);
        }
        call.receiving_message.store(false, Ordering::SeqCst);
        bctl.add_error(error, false);
        bctl.finish_step();
    }

    // ---- metadata filters ------------------------------------------------

    fn recv_initial_filter(&self, b: &mut MetadataMap) {
        if let Some(md) = b.remove_first(CONTENT_ENCODING) {
            let algorithm = match StreamCompression::parse(&md.value_str()) {
                Some(a) => a,
                None => {
                    error!(
                        value = %md.value_str(),
                        "invalid incoming stream compression algorithm, \
                         interpreting incoming data as uncompressed"
                    );
                    StreamCompression::None
                }
            };
            *self.incoming_stream_compression.lock() = algorithm;
        }
        if let Some(md) = b.remove_first(GRPC_ENCODING) {
            let algorithm = match MessageCompression::parse(&md.value_str()) {
                Some(a) => a,
                None => {
                    error!(
                        value = %md.value_str(),
                        "invalid incoming message compression algorithm, \
                         interpreting incoming data as uncompressed"
                    );
                    MessageCompression::None
                }
            };
            *self.incoming_message_compression.lock() = algorithm;
        }
        let mut message_accepted = EncodingSet::identity_only();
        let mut stream_accepted = EncodingSet::identity_only();
        if let Some(md) = b.remove_first(GRPC_ACCEPT_ENCODING) {
            message_accepted = self
                .message_accept_cache
                .get_or_parse(&md.value, || parse_accept_encoding(&md.value, false));
        }
        if let Some(md) = b.remove_first(ACCEPT_ENCODING) {
            stream_accepted = self
                .stream_accept_cache
                .get_or_parse(&md.value, || parse_accept_encoding(&md.value, true));
        }
        self.encodings_accepted_by_peer.store(
            message_accepted.union(stream_accepted).to_bits(),
            Ordering::Release,
        );
        self.publish_metadata(b, false);
    }

    /// Sanity checks on the decoded compression configuration; runs after
    /// the recv-initial filter.
    fn validate_filtered_metadata(this: &Arc<CallInner>) {
        let message = *this.incoming_message_compression.lock();
        let stream = *this.incoming_stream_compression.lock();
        if message != MessageCompression::None && stream != StreamCompression::None {
            let msg = format!(
                "incoming stream has both stream compression ({}) and message compression ({})",
                stream.name(),
                message.name()
            );
            error!(id = this.id, "{msg}");
            Self::cancel_with_status_from(this, StatusSource::Surface, Code::Internal, msg);
            return;
        }
        let algorithm = match CompressionAlgorithm::from_parts(message, stream) {
            Some(a) => a,
            // Both-compressed was rejected above.
            None => return,
        };
        if !this
            .channel
            .compression_options()
            .enabled
            .contains(algorithm)
        {
            let msg = format!("compression algorithm '{}' is disabled", algorithm.name());
            error!(id = this.id, "{msg}");
            Self::cancel_with_status_from(this, StatusSource::Surface, Code::Unimplemented, msg);
            return;
        }
        let accepted =
            EncodingSet::from_bits(this.encodings_accepted_by_peer.load(Ordering::Acquire));
        if !accepted.contains(algorithm) {
            error!(
                id = this.id,
                algorithm = algorithm.name(),
                accepted = %accepted.to_header(),
                "compression algorithm not present in the accepted encodings"
            );
        }
    }

    fn recv_trailing_filter(&self, b: &mut MetadataMap) {
        if let Some(md) = b.remove_first(GRPC_STATUS) {
            let numeric = self.decode_status_code(&md.value);
            let code = Code::from_i32(numeric).unwrap_or(Code::Unknown);
            let mut error = if code.is_ok() {
                OpError::from_status(Code::Ok, "")
            } else {
                OpError::new("error received from peer").with_code(code)
            };
            if let Some(msg) = b.remove_first(GRPC_MESSAGE) {
                error = error.with_wire_message(msg.value_str().into_owned());
            } else if !code.is_ok() {
                error = error.with_wire_message("");
            }
            self.status.set(StatusSource::Wire, Arc::new(error));
        }
        self.publish_metadata(b, true);
    }

    /// Decode an ASCII-decimal status code; 0/1/2 take the fast path,
    /// anything else is parsed once and memoized on the header value.
    fn decode_status_code(&self, value: &Bytes) -> i32 {
        match value.as_ref() {
            b"0" => 0,
            b"1" => 1,
            b"2" => 2,
            _ => self.status_code_cache.get_or_parse(value, || {
                std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<i32>().ok())
                    .unwrap_or_else(|| {
                        error!(id = self.id, "unparseable grpc-status header");
                        Code::Unknown.as_i32()
                    })
            }),
        }
    }

    fn publish_metadata(&self, b: &mut MetadataMap, trailing: bool) {
        let dest = if trailing {
            &self.buffered_trailing_metadata
        } else {
            &self.buffered_initial_metadata
        };
        if let Some(out) = dest.lock().take() {
            let mut map = MetadataMap::new();
            map.extend(b.take());
            out.put(map);
        }
    }

    // ---- completion dispatch ---------------------------------------------

    pub(crate) fn post_batch_completion(bctl: &BatchControl) {
        let call = &bctl.call;
        let mut result = bctl.consolidate();

        if bctl.flags.send_initial_metadata {
            call.send_initial_store.lock().clear();
        }
        if bctl.flags.send_message {
            call.sending_message.store(false, Ordering::SeqCst);
        }
        if bctl.flags.send_trailing_metadata {
            call.send_trailing_store.lock().clear();
        }
        if bctl.flags.recv_trailing_metadata {
            let mut trailing = std::mem::take(&mut call.recv_trailing_store.lock().list);
            call.recv_trailing_filter(&mut trailing);

            // All trailing-metadata effects precede this release store.
            call.received_final_op.store(true, Ordering::Release);
            call.propagate_cancellation_to_children();

            let (client_status, server_cancelled) = {
                let mut finals = call.final_ops.lock();
                (finals.client_status.take(), finals.server_cancelled.take())
            };
            if call.is_client {
                if let Some(out) = client_status {
                    out.put(call.status.final_status(true));
                }
            } else if let Some(out) = server_cancelled {
                out.put(!call.status.final_status(false).code.is_ok());
            }

            // The terminal user-facing result is the final status; the
            // batch's own error is suppressed.
            result = Ok(());
        }

        *call.active_batches[bctl.slot.index()].lock() = None;

        match bctl.take_notify() {
            Some(Notify::Closure(closure)) => closure(result),
            Some(Notify::Tag(tag)) => call.post_completion_event(tag, result),
            None => error!(id = call.id, "batch completed twice"),
        }
    }

    fn propagate_cancellation_to_children(&self) {
        let pc = match self.parent_call.get() {
            Some(pc) => pc,
            None => return,
        };
        let children: Vec<Arc<CallInner>> =
            pc.children.lock().values().filter_map(Weak::upgrade).collect();
        for child in children {
            if child.cancellation_is_inherited {
                debug!(parent = self.id, child = child.id, "propagating cancellation");
                Self::cancel_with_error(
                    &child,
                    StatusSource::ApiOverride,
                    Arc::new(OpError::cancelled()),
                );
            }
        }
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        let status = self.status.final_status(self.is_client);
        let info = FinalInfo {
            status,
            latency: self.start_time.elapsed(),
        };
        trace!(id = self.id, code = %info.status.code, "call released");
        self.channel.report_final(&info);
    }
}

fn validate_metadata(metadata: &MetadataMap) -> Result<(), CallError> {
    if metadata.len() > i32::MAX as usize {
        return Err(CallError::InvalidMetadata);
    }
    for md in metadata.iter() {
        if !validate_key(&md.key) {
            return Err(CallError::InvalidMetadata);
        }
        if !is_binary_key(&md.key) && !validate_nonbin_value(&md.value) {
            return Err(CallError::InvalidMetadata);
        }
    }
    Ok(())
}

/// Parse an accept-encoding header into the combined bitset. Unknown
/// entries are logged and ignored; identity is always accepted.
fn parse_accept_encoding(value: &Bytes, stream_encoding: bool) -> EncodingSet {
    let mut set = EncodingSet::identity_only();
    let text = String::from_utf8_lossy(value);
    for entry in split_without_space(&text) {
        let algorithm = if stream_encoding {
            StreamCompression::parse(entry)
                .and_then(|s| CompressionAlgorithm::from_parts(MessageCompression::None, s))
        } else {
            MessageCompression::parse(entry)
                .and_then(|m| CompressionAlgorithm::from_parts(m, StreamCompression::None))
        };
        match algorithm {
            Some(a) => set.insert(a),
            None => {
                error!(%entry, "invalid entry in accept encoding metadata, ignoring");
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::message::ByteBuffer;
    use crate::testing::MockTransport;

    fn client() -> Call {
        let (call, error) = Call::create(CallArgs::client(
            Channel::new(ChannelConfig::new("inproc:test")),
            MockTransport::new(),
        ));
        assert!(error.is_none());
        call
    }

    #[test]
    fn test_status_code_decode_memoized() {
        let call = client();
        let inner = &call.inner;

        // Distinct header values with the same content parse once.
        let first = Bytes::from(b"5".to_vec());
        let second = Bytes::from(b"5".to_vec());
        assert_eq!(inner.decode_status_code(&first), 5);
        assert_eq!(inner.decode_status_code(&second), 5);
        assert_eq!(inner.status_code_cache.parse_count(), 1);

        // 0/1/2 bypass the cache entirely.
        assert_eq!(inner.decode_status_code(&Bytes::from_static(b"0")), 0);
        assert_eq!(inner.decode_status_code(&Bytes::from_static(b"2")), 2);
        assert_eq!(inner.status_code_cache.parse_count(), 1);
    }

    #[test]
    fn test_unparseable_status_decodes_unknown() {
        let call = client();
        let garbage = Bytes::from_static(b"not-a-number");
        assert_eq!(
            call.inner.decode_status_code(&garbage),
            Code::Unknown.as_i32()
        );
    }

    #[test]
    fn test_accept_encoding_memoized_per_value() {
        let call = client();
        let inner = &call.inner;

        for _ in 0..2 {
            let mut b: MetadataMap = [("grpc-accept-encoding", "gzip,identity")]
                .into_iter()
                .collect();
            inner.recv_initial_filter(&mut b);
        }
        assert_eq!(inner.message_accept_cache.parse_count(), 1);
        assert!(
            EncodingSet::from_bits(inner.encodings_accepted_by_peer.load(Ordering::Acquire))
                .contains(CompressionAlgorithm::MessageGzip)
        );
    }

    #[test]
    fn test_within_batch_duplicate_op_rejected() {
        let call = client();
        let err = call
            .inner
            .validate_ops(&[
                Op::SendMessage {
                    message: ByteBuffer::from_bytes(&b"a"[..]),
                    flags: WriteFlags::empty(),
                },
                Op::SendMessage {
                    message: ByteBuffer::from_bytes(&b"b"[..]),
                    flags: WriteFlags::empty(),
                },
            ])
            .unwrap_err();
        assert_eq!(err, CallError::TooManyOperations);
    }

    #[test]
    fn test_internal_compress_flag_rejected_from_user() {
        let call = client();
        let err = call
            .inner
            .validate_ops(&[Op::SendMessage {
                message: ByteBuffer::from_bytes(&b"a"[..]),
                flags: WriteFlags::INTERNAL_COMPRESS,
            }])
            .unwrap_err();
        assert_eq!(err, CallError::InvalidFlags);
    }
}
