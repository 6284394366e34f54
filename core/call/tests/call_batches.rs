// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! End-to-end batch scenarios over the in-memory transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing_test::traced_test;

use wirecall::testing::{MockTransport, TestStream};
use wirecall::{
    Call, CallArgs, CallError, Channel, ChannelConfig, Code, CompletionQueue, CompressionOptions,
    GRPC_INTERNAL_ENCODING_REQUEST, MetadataMap, Metadatum, Op, OpError, ParentSpec,
    PropagationMask, RecvSlot, WriteFlags,
};
use wirecall_compression::{
    CompressionAlgorithm, CompressionLevel, EncodingSet, MessageCompression,
};

struct Fixture {
    call: Call,
    transport: Arc<MockTransport>,
    cq: Arc<CompletionQueue>,
}

fn client_fixture() -> Fixture {
    client_fixture_with(ChannelConfig::new("inproc:test"), Vec::new())
}

fn client_fixture_with(config: ChannelConfig, extra: Vec<Metadatum>) -> Fixture {
    let transport = MockTransport::new();
    let cq = CompletionQueue::new();
    let mut args = CallArgs::client(Channel::new(config), transport.clone());
    args.completion_queue = Some(cq.clone());
    args.add_initial_metadata = extra;
    let (call, error) = Call::create(args);
    assert!(error.is_none());
    Fixture {
        call,
        transport,
        cq,
    }
}

fn server_fixture() -> Fixture {
    let transport = MockTransport::new();
    let cq = CompletionQueue::new();
    let mut args = CallArgs::server(Channel::new(ChannelConfig::new("inproc:test")), transport.clone());
    args.completion_queue = Some(cq.clone());
    let (call, error) = Call::create(args);
    assert!(error.is_none());
    Fixture {
        call,
        transport,
        cq,
    }
}

fn md(key: &str, value: &str) -> Metadatum {
    Metadatum::new(key.to_string(), Bytes::copy_from_slice(value.as_bytes()))
}

#[tokio::test]
async fn happy_client_unary() {
    let f = client_fixture_with(
        ChannelConfig::new("inproc:test"),
        vec![md(":path", "/svc/M")],
    );
    let initial_md = RecvSlot::new();
    let message = RecvSlot::new();
    let status = RecvSlot::new();
    let trailing_md = RecvSlot::new();

    f.call
        .start_batch(
            vec![
                Op::SendInitialMetadata {
                    metadata: [("x-test", "1")].into_iter().collect(),
                    flags: Default::default(),
                    compression_level: None,
                },
                Op::SendMessage {
                    message: wirecall::ByteBuffer::from_bytes(&b"hi"[..]),
                    flags: WriteFlags::empty(),
                },
                Op::SendCloseFromClient,
                Op::RecvInitialMetadata {
                    metadata: initial_md.clone(),
                },
                Op::RecvMessage {
                    message: message.clone(),
                },
                Op::RecvStatusOnClient {
                    status: status.clone(),
                    trailing_metadata: trailing_md.clone(),
                },
            ],
            1,
        )
        .unwrap();

    // The surface-prepended path rides ahead of application metadata.
    let sent = f.transport.sent_initial_metadata();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].metadata.get_first(":path").unwrap().value_str(), "/svc/M");
    assert_eq!(sent[0].metadata.get_first("x-test").unwrap().value_str(), "1");
    assert_eq!(f.transport.sent_messages()[0].0.concat(), b"hi");
    assert_eq!(f.transport.sent_trailing_metadata().len(), 1);

    f.transport.deliver_initial_metadata(vec![]);
    f.transport.deliver_message(b"ok");
    f.transport.deliver_trailing_metadata(vec![md("grpc-status", "0")]);
    f.transport.complete_next();

    let event = f.cq.next().await.unwrap();
    assert_eq!(event.tag, 1);
    assert!(event.is_ok());

    let final_status = status.take().unwrap();
    assert_eq!(final_status.code, Code::Ok);
    assert_eq!(final_status.details, "");
    assert!(trailing_md.take().unwrap().is_empty());
    assert_eq!(message.take().unwrap().unwrap().concat(), b"ok");
    assert!(initial_md.take().unwrap().is_empty());
}

#[tokio::test]
async fn wire_error_surfaces_as_final_status() {
    let f = client_fixture();
    let status = RecvSlot::new();
    let trailing_md = RecvSlot::new();

    f.call
        .start_batch(
            vec![Op::RecvStatusOnClient {
                status: status.clone(),
                trailing_metadata: trailing_md.clone(),
            }],
            7,
        )
        .unwrap();

    f.transport.deliver_trailing_metadata(vec![
        md("grpc-status", "5"),
        md("grpc-message", "not found"),
        md("x-extra", "v"),
    ]);
    f.transport.complete_next();

    let event = f.cq.next().await.unwrap();
    assert_eq!(event.tag, 7);
    // The terminal result is the final status, not the batch error.
    assert!(event.is_ok());

    let final_status = status.take().unwrap();
    assert_eq!(final_status.code, Code::NotFound);
    assert_eq!(final_status.details, "not found");

    let trailing = trailing_md.take().unwrap();
    assert_eq!(trailing.len(), 1);
    assert_eq!(trailing.get_first("x-extra").unwrap().value_str(), "v");
}

#[tokio::test]
async fn user_cancel_overrides_wire_status() {
    let f = client_fixture();

    f.call
        .start_batch(
            vec![Op::SendInitialMetadata {
                metadata: MetadataMap::new(),
                flags: Default::default(),
                compression_level: None,
            }],
            1,
        )
        .unwrap();
    f.transport.complete_next();
    assert!(f.cq.next().await.unwrap().is_ok());

    f.call
        .cancel_with_status(Code::DeadlineExceeded, "deadline");
    assert_eq!(f.transport.cancel_errors().len(), 1);

    let status = RecvSlot::new();
    let trailing_md = RecvSlot::new();
    f.call
        .start_batch(
            vec![Op::RecvStatusOnClient {
                status: status.clone(),
                trailing_metadata: trailing_md.clone(),
            }],
            2,
        )
        .unwrap();
    // A later wire status must not revise the user's cancellation.
    f.transport.deliver_trailing_metadata(vec![md("grpc-status", "0")]);
    f.transport.complete_next();

    assert_eq!(f.cq.next().await.unwrap().tag, 2);
    let final_status = status.take().unwrap();
    assert_eq!(final_status.code, Code::DeadlineExceeded);
    assert_eq!(final_status.details, "deadline");
}

#[tokio::test]
async fn empty_batch_posts_single_ok_completion() {
    let f = client_fixture();
    f.call.start_batch(vec![], 9).unwrap();

    let event = f.cq.next().await.unwrap();
    assert_eq!(event.tag, 9);
    assert!(event.is_ok());
    assert!(f.cq.try_next().is_none());
}

#[tokio::test]
async fn recv_status_alone_defaults_to_unknown() {
    let f = client_fixture();
    let status = RecvSlot::new();
    let trailing_md = RecvSlot::new();

    f.call
        .start_batch(
            vec![Op::RecvStatusOnClient {
                status: status.clone(),
                trailing_metadata: trailing_md.clone(),
            }],
            3,
        )
        .unwrap();
    f.transport.complete_next();

    assert!(f.cq.next().await.unwrap().is_ok());
    assert_eq!(status.take().unwrap().code, Code::Unknown);
}

#[tokio::test]
async fn duplicate_send_message_rejected_while_in_flight() {
    let f = client_fixture();

    f.call
        .start_batch(
            vec![Op::SendMessage {
                message: wirecall::ByteBuffer::from_bytes(&b"a"[..]),
                flags: WriteFlags::empty(),
            }],
            1,
        )
        .unwrap();

    let err = f
        .call
        .start_batch(
            vec![Op::SendMessage {
                message: wirecall::ByteBuffer::from_bytes(&b"b"[..]),
                flags: WriteFlags::empty(),
            }],
            2,
        )
        .unwrap_err();
    assert_eq!(err, CallError::TooManyOperations);

    // The failed batch left no trace: the first completes normally and
    // the op can be resubmitted afterwards.
    f.transport.complete_next();
    assert_eq!(f.cq.next().await.unwrap().tag, 1);

    f.call
        .start_batch(
            vec![Op::SendMessage {
                message: wirecall::ByteBuffer::from_bytes(&b"b"[..]),
                flags: WriteFlags::empty(),
            }],
            2,
        )
        .unwrap();
    f.transport.complete_next();
    assert_eq!(f.cq.next().await.unwrap().tag, 2);
}

#[tokio::test]
async fn role_checks_reject_foreign_ops() {
    let client = client_fixture();
    let err = client
        .call
        .start_batch(
            vec![Op::RecvCloseOnServer {
                cancelled: RecvSlot::new(),
            }],
            1,
        )
        .unwrap_err();
    assert_eq!(err, CallError::NotOnClient);

    let server = server_fixture();
    let err = server
        .call
        .start_batch(vec![Op::SendCloseFromClient], 1)
        .unwrap_err();
    assert_eq!(err, CallError::NotOnServer);
}

#[tokio::test]
async fn invalid_metadata_fails_batch_without_latching() {
    let f = client_fixture();
    let err = f
        .call
        .start_batch(
            vec![Op::SendInitialMetadata {
                metadata: [("UPPER", "nope")].into_iter().collect(),
                flags: Default::default(),
                compression_level: None,
            }],
            1,
        )
        .unwrap_err();
    assert_eq!(err, CallError::InvalidMetadata);

    // Nothing latched: the same op kind is accepted afterwards.
    f.call
        .start_batch(
            vec![Op::SendInitialMetadata {
                metadata: [("ok-key", "fine")].into_iter().collect(),
                flags: Default::default(),
                compression_level: None,
            }],
            2,
        )
        .unwrap();
    f.transport.complete_next();
    assert_eq!(f.cq.next().await.unwrap().tag, 2);
}

#[tokio::test]
async fn idempotent_flag_rejected_on_server() {
    let server = server_fixture();
    let err = server
        .call
        .start_batch(
            vec![Op::SendInitialMetadata {
                metadata: MetadataMap::new(),
                flags: wirecall::InitialMetadataFlags::IDEMPOTENT_REQUEST,
                compression_level: None,
            }],
            1,
        )
        .unwrap_err();
    assert_eq!(err, CallError::InvalidFlags);
}

#[tokio::test]
async fn server_compression_level_resolves_against_peer() {
    let f = server_fixture();

    // Learn what the peer accepts first.
    let initial_md = RecvSlot::new();
    f.call
        .start_batch(
            vec![Op::RecvInitialMetadata {
                metadata: initial_md.clone(),
            }],
            1,
        )
        .unwrap();
    f.transport
        .deliver_initial_metadata(vec![md("grpc-accept-encoding", "gzip,identity")]);
    f.transport.complete_next();
    assert_eq!(f.cq.next().await.unwrap().tag, 1);
    assert!(
        f.call
            .encodings_accepted_by_peer()
            .contains(CompressionAlgorithm::MessageGzip)
    );

    f.call
        .start_batch(
            vec![Op::SendInitialMetadata {
                metadata: MetadataMap::new(),
                flags: Default::default(),
                compression_level: Some(CompressionLevel::High),
            }],
            2,
        )
        .unwrap();

    let sent = f.transport.sent_initial_metadata();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0]
            .metadata
            .get_first(GRPC_INTERNAL_ENCODING_REQUEST)
            .unwrap()
            .value_str(),
        "gzip"
    );
    f.transport.complete_next();
    assert_eq!(f.cq.next().await.unwrap().tag, 2);
}

#[tokio::test]
async fn message_before_initial_metadata_uses_filtered_compression() {
    let f = client_fixture();
    let initial_md = RecvSlot::new();
    let message = RecvSlot::new();

    f.call
        .start_batch(
            vec![
                Op::RecvInitialMetadata {
                    metadata: initial_md.clone(),
                },
                Op::RecvMessage {
                    message: message.clone(),
                },
            ],
            1,
        )
        .unwrap();

    // Message first: it must park until the compression configuration is
    // known from the filtered initial metadata.
    f.transport
        .deliver_message_stream(Box::new(TestStream::compressed(b"zzz")));
    assert!(!message.is_filled());

    f.transport
        .deliver_initial_metadata(vec![md("grpc-encoding", "gzip")]);
    f.transport.complete_next();

    assert!(f.cq.next().await.unwrap().is_ok());
    let received = message.take().unwrap().unwrap();
    assert_eq!(received.concat(), b"zzz");
    assert_eq!(received.compression(), CompressionAlgorithm::MessageGzip);
    assert_eq!(
        f.call.incoming_message_compression(),
        MessageCompression::Gzip
    );
    assert!(
        f.call
            .last_message_flags()
            .contains(WriteFlags::INTERNAL_COMPRESS)
    );
}

#[tokio::test]
async fn initial_metadata_before_message_same_outcome() {
    let f = client_fixture();
    let initial_md = RecvSlot::new();
    let message = RecvSlot::new();

    f.call
        .start_batch(
            vec![
                Op::RecvInitialMetadata {
                    metadata: initial_md.clone(),
                },
                Op::RecvMessage {
                    message: message.clone(),
                },
            ],
            1,
        )
        .unwrap();

    f.transport
        .deliver_initial_metadata(vec![md("grpc-encoding", "gzip")]);
    f.transport
        .deliver_message_stream(Box::new(TestStream::compressed(b"zzz")));
    f.transport.complete_next();

    assert!(f.cq.next().await.unwrap().is_ok());
    let received = message.take().unwrap().unwrap();
    assert_eq!(received.concat(), b"zzz");
    assert_eq!(received.compression(), CompressionAlgorithm::MessageGzip);
}

#[tokio::test]
async fn suspended_message_stream_resumes() {
    let f = client_fixture();
    let initial_md = RecvSlot::new();
    let message = RecvSlot::new();

    f.call
        .start_batch(
            vec![
                Op::RecvInitialMetadata {
                    metadata: initial_md.clone(),
                },
                Op::RecvMessage {
                    message: message.clone(),
                },
            ],
            1,
        )
        .unwrap();
    f.transport.deliver_initial_metadata(vec![]);

    let (stream, handle) = TestStream::suspending(
        vec![Bytes::from_static(b"he"), Bytes::from_static(b"llo")],
        WriteFlags::empty(),
        1,
    );
    f.transport.deliver_message_stream(Box::new(stream));
    // One slice in, then the stream suspended.
    assert!(!message.is_filled());

    handle.resume();
    f.transport.complete_next();

    assert!(f.cq.next().await.unwrap().is_ok());
    assert_eq!(message.take().unwrap().unwrap().concat(), b"hello");
}

#[tokio::test]
async fn failed_message_stream_fails_batch() {
    let f = client_fixture();
    let initial_md = RecvSlot::new();
    let message = RecvSlot::new();

    f.call
        .start_batch(
            vec![
                Op::RecvInitialMetadata {
                    metadata: initial_md.clone(),
                },
                Op::RecvMessage {
                    message: message.clone(),
                },
            ],
            1,
        )
        .unwrap();
    f.transport.deliver_initial_metadata(vec![]);

    let (stream, handle) = TestStream::suspending(
        vec![Bytes::from_static(b"he"), Bytes::from_static(b"llo")],
        WriteFlags::empty(),
        1,
    );
    f.transport.deliver_message_stream(Box::new(stream));
    handle.fail(Arc::new(OpError::new("link reset")));
    f.transport.complete_next();

    let event = f.cq.next().await.unwrap();
    assert!(!event.is_ok());
    assert_eq!(message.take().unwrap(), None);
}

#[tokio::test]
async fn end_of_stream_delivers_no_message() {
    let f = client_fixture();
    let message = RecvSlot::new();

    f.call
        .start_batch(
            vec![Op::RecvMessage {
                message: message.clone(),
            }],
            1,
        )
        .unwrap();
    f.transport.deliver_end_of_stream();
    f.transport.complete_next();

    assert!(f.cq.next().await.unwrap().is_ok());
    assert_eq!(message.take().unwrap(), None);
}

#[tokio::test]
async fn server_sends_status_and_sees_cancelled_bit() {
    let f = server_fixture();
    let cancelled = RecvSlot::new();

    f.call
        .start_batch(
            vec![
                Op::SendInitialMetadata {
                    metadata: MetadataMap::new(),
                    flags: Default::default(),
                    compression_level: None,
                },
                Op::SendStatusFromServer {
                    status: Code::NotFound,
                    details: Some("nope".to_string()),
                    trailing_metadata: MetadataMap::new(),
                },
                Op::RecvCloseOnServer {
                    cancelled: cancelled.clone(),
                },
            ],
            1,
        )
        .unwrap();

    let trailing = f.transport.sent_trailing_metadata();
    assert_eq!(trailing[0].get_first("grpc-status").unwrap().value_str(), "5");
    assert_eq!(trailing[0].get_first("grpc-message").unwrap().value_str(), "nope");

    f.transport.complete_next();
    assert!(f.cq.next().await.unwrap().is_ok());
    // Any non-OK terminal status surfaces through the cancelled bit.
    assert_eq!(cancelled.take(), Some(true));
}

#[tokio::test]
async fn server_ok_status_reports_not_cancelled() {
    let f = server_fixture();
    let cancelled = RecvSlot::new();

    f.call
        .start_batch(
            vec![
                Op::SendStatusFromServer {
                    status: Code::Ok,
                    details: None,
                    trailing_metadata: MetadataMap::new(),
                },
                Op::RecvCloseOnServer {
                    cancelled: cancelled.clone(),
                },
            ],
            1,
        )
        .unwrap();
    f.transport.complete_next();

    assert!(f.cq.next().await.unwrap().is_ok());
    assert_eq!(cancelled.take(), Some(false));
}

#[tokio::test]
async fn dropping_handle_mid_flight_cancels() {
    let f = client_fixture();

    f.call
        .start_batch(
            vec![Op::SendInitialMetadata {
                metadata: MetadataMap::new(),
                flags: Default::default(),
                compression_level: None,
            }],
            1,
        )
        .unwrap();

    let Fixture {
        call, transport, cq, ..
    } = f;
    drop(call);

    // Ops were sent and no final op was received: a synthetic
    // cancellation goes down the stack.
    let cancels = transport.cancel_errors();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].to_status().0, Code::Cancelled);

    // The lingering batch still completes through the queue.
    transport.complete_next();
    assert_eq!(cq.next().await.unwrap().tag, 1);
}

#[tokio::test]
async fn parent_trailing_metadata_cancels_inheriting_child() {
    let parent = server_fixture();
    let deadline = Instant::now() + Duration::from_secs(30);

    let child_transport = MockTransport::new();
    let child_cq = CompletionQueue::new();
    let mut child_args = CallArgs::client(
        Channel::new(ChannelConfig::new("inproc:child")),
        child_transport.clone(),
    );
    child_args.completion_queue = Some(child_cq.clone());
    child_args.send_deadline = Some(deadline);
    child_args.parent = Some(ParentSpec {
        call: &parent.call,
        propagation: PropagationMask::DEADLINE | PropagationMask::CANCELLATION,
    });
    let (child, error) = Call::create(child_args);
    assert!(error.is_none());
    // No parent deadline was set, so the child's own stands.
    assert_eq!(child.send_deadline(), Some(deadline));

    // Parent's final op arrives: trailing metadata processed, children
    // carrying inherited cancellation are cancelled.
    let cancelled = RecvSlot::new();
    parent
        .call
        .start_batch(
            vec![Op::RecvCloseOnServer {
                cancelled: cancelled.clone(),
            }],
            1,
        )
        .unwrap();
    parent.transport.deliver_trailing_metadata(vec![]);
    parent.transport.complete_next();
    assert_eq!(parent.cq.next().await.unwrap().tag, 1);

    let cancels = child_transport.cancel_errors();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].to_status().0, Code::Cancelled);
    drop(child);
}

#[tokio::test]
async fn child_inherits_parent_deadline() {
    let parent_transport = MockTransport::new();
    let parent_cq = CompletionQueue::new();
    let parent_deadline = Instant::now() + Duration::from_secs(5);
    let mut parent_args = CallArgs::server(
        Channel::new(ChannelConfig::new("inproc:test")),
        parent_transport.clone(),
    );
    parent_args.completion_queue = Some(parent_cq.clone());
    parent_args.send_deadline = Some(parent_deadline);
    let (parent, error) = Call::create(parent_args);
    assert!(error.is_none());

    let child_transport = MockTransport::new();
    let mut child_args = CallArgs::client(
        Channel::new(ChannelConfig::new("inproc:child")),
        child_transport.clone(),
    );
    child_args.completion_queue = Some(CompletionQueue::new());
    // The child asks for a later deadline; the parent's earlier one wins.
    child_args.send_deadline = Some(parent_deadline + Duration::from_secs(60));
    child_args.parent = Some(ParentSpec {
        call: &parent,
        propagation: PropagationMask::DEADLINE,
    });
    let (child, error) = Call::create(child_args);
    assert!(error.is_none());
    assert_eq!(child.send_deadline(), Some(parent_deadline));
}

#[tokio::test]
async fn child_of_finished_parent_is_cancelled_at_creation() {
    let parent = server_fixture();
    let cancelled = RecvSlot::new();
    parent
        .call
        .start_batch(
            vec![Op::RecvCloseOnServer {
                cancelled: cancelled.clone(),
            }],
            1,
        )
        .unwrap();
    parent.transport.deliver_trailing_metadata(vec![]);
    parent.transport.complete_next();
    assert_eq!(parent.cq.next().await.unwrap().tag, 1);

    let child_transport = MockTransport::new();
    let mut child_args = CallArgs::client(
        Channel::new(ChannelConfig::new("inproc:child")),
        child_transport.clone(),
    );
    child_args.completion_queue = Some(CompletionQueue::new());
    child_args.parent = Some(ParentSpec {
        call: &parent.call,
        propagation: PropagationMask::CANCELLATION,
    });
    let (child, error) = Call::create(child_args);
    assert!(error.is_none());
    assert_eq!(child_transport.cancel_errors().len(), 1);
    drop(child);
}

#[tokio::test]
async fn census_tracing_without_stats_is_a_creation_error() {
    let parent = server_fixture();
    let child_transport = MockTransport::new();
    let mut child_args = CallArgs::client(
        Channel::new(ChannelConfig::new("inproc:child")),
        child_transport.clone(),
    );
    child_args.completion_queue = Some(CompletionQueue::new());
    child_args.parent = Some(ParentSpec {
        call: &parent.call,
        propagation: PropagationMask::CENSUS_TRACING_CONTEXT,
    });
    let (child, error) = Call::create(child_args);
    assert!(error.is_some());
    // The creation error already cancelled the call.
    assert_eq!(child_transport.cancel_errors().len(), 1);
    drop(child);
}

#[tokio::test]
#[traced_test]
async fn unknown_accept_encoding_entries_are_logged_and_ignored() {
    let f = client_fixture();
    let initial_md = RecvSlot::new();

    f.call
        .start_batch(
            vec![Op::RecvInitialMetadata {
                metadata: initial_md.clone(),
            }],
            1,
        )
        .unwrap();
    f.transport
        .deliver_initial_metadata(vec![md("grpc-accept-encoding", "gzip, br")]);
    f.transport.complete_next();
    assert!(f.cq.next().await.unwrap().is_ok());

    assert!(logs_contain(
        "invalid entry in accept encoding metadata"
    ));
    let accepted = f.call.encodings_accepted_by_peer();
    assert!(accepted.contains(CompressionAlgorithm::MessageGzip));
    assert!(accepted.contains(CompressionAlgorithm::Identity));
    assert_eq!(
        accepted,
        [CompressionAlgorithm::Identity, CompressionAlgorithm::MessageGzip]
            .into_iter()
            .collect::<EncodingSet>()
    );
}

#[tokio::test]
#[traced_test]
async fn both_compressions_cancel_with_internal() {
    let f = client_fixture();
    let initial_md = RecvSlot::new();

    f.call
        .start_batch(
            vec![Op::RecvInitialMetadata {
                metadata: initial_md.clone(),
            }],
            1,
        )
        .unwrap();
    f.transport.deliver_initial_metadata(vec![
        md("grpc-encoding", "gzip"),
        md("content-encoding", "gzip"),
    ]);
    f.transport.complete_next();
    assert!(f.cq.next().await.unwrap().is_ok());

    let cancels = f.transport.cancel_errors();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].to_status().0, Code::Internal);
}

#[tokio::test]
async fn disabled_algorithm_cancels_with_unimplemented() {
    let mut config = ChannelConfig::new("inproc:test");
    let mut enabled = EncodingSet::identity_only();
    enabled.insert(CompressionAlgorithm::MessageDeflate);
    config.compression = CompressionOptions {
        default_level: None,
        default_algorithm: None,
        enabled,
    };
    let f = client_fixture_with(config, Vec::new());
    let initial_md = RecvSlot::new();

    f.call
        .start_batch(
            vec![Op::RecvInitialMetadata {
                metadata: initial_md.clone(),
            }],
            1,
        )
        .unwrap();
    f.transport
        .deliver_initial_metadata(vec![md("grpc-encoding", "gzip")]);
    f.transport.complete_next();
    assert!(f.cq.next().await.unwrap().is_ok());

    let cancels = f.transport.cancel_errors();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].to_status().0, Code::Unimplemented);
}

#[tokio::test]
async fn peer_reports_transport_then_channel_target() {
    let f = client_fixture();
    assert_eq!(f.call.peer(), "inproc:test");

    f.transport.set_peer("ipv4:10.0.0.1:443");
    f.call
        .start_batch(
            vec![Op::SendInitialMetadata {
                metadata: MetadataMap::new(),
                flags: Default::default(),
                compression_level: None,
            }],
            1,
        )
        .unwrap();
    assert_eq!(f.call.peer(), "ipv4:10.0.0.1:443");
    f.transport.complete_next();
    assert_eq!(f.cq.next().await.unwrap().tag, 1);
}

#[tokio::test]
async fn final_info_reported_at_teardown() {
    let transport = MockTransport::new();
    let cq = CompletionQueue::new();
    let channel = Channel::new(ChannelConfig::new("inproc:test"));
    let observed = Arc::new(parking_lot::Mutex::new(None));
    let observed2 = observed.clone();
    channel.on_call_final(move |info| {
        *observed2.lock() = Some(info.status.code);
    });

    let mut args = CallArgs::client(channel, transport.clone());
    args.completion_queue = Some(cq.clone());
    let (call, error) = Call::create(args);
    assert!(error.is_none());

    call.cancel_with_status(Code::Aborted, "going away");
    drop(call);

    assert_eq!(*observed.lock(), Some(Code::Aborted));
}

#[tokio::test]
async fn closure_notification_is_invoked_synchronously() {
    let f = client_fixture();
    let done = Arc::new(parking_lot::Mutex::new(None));
    let done2 = done.clone();

    f.call
        .start_batch_and_execute(
            vec![Op::SendInitialMetadata {
                metadata: MetadataMap::new(),
                flags: Default::default(),
                compression_level: None,
            }],
            Box::new(move |result| {
                *done2.lock() = Some(result.is_ok());
            }),
        )
        .unwrap();

    assert!(done.lock().is_none());
    f.transport.complete_next();
    assert_eq!(*done.lock(), Some(true));
}
