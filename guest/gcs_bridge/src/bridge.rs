// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-connection dispatcher.
//!
//! One task reads frames sequentially from the transport; each accepted
//! request becomes its own worker future, so a slow handler (a device mount,
//! a withheld process wait) never stalls the read leg. A dedicated writer
//! task drains a bounded queue of outbound frames, keeping single-writer
//! discipline over the transport. Responses are emitted in completion order
//! and correlated by sequence id; notifications are interleaved with fresh
//! guest-assigned sequence ids.

use crate::error::FatalError;
use crate::framing;
use crate::framing::FramingError;
use crate::handlers;
use crate::handlers::BridgeEvent;
use crate::handlers::HandlerFailure;
use crate::handlers::OutboundFrame;
use crate::handlers::RequestEnv;
use crate::ContainerRuntime;
use crate::SecurityPolicy;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use gcs_protocol::messages::ContainerNotification;
use gcs_protocol::messages::GcsCapabilities;
use gcs_protocol::messages::GcsGuestCapabilities;
use gcs_protocol::messages::NegotiateProtocol;
use gcs_protocol::messages::NegotiateProtocolResponse;
use gcs_protocol::messages::SchemaVersion;
use gcs_protocol::messages::OS_TYPE_LINUX;
use gcs_protocol::Hresult;
use gcs_protocol::MessageIdentifier;
use gcs_protocol::MessageType;
use gcs_protocol::ProtocolVersion;
use scsi_mount::MountManager;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Guest-assigned notification sequence ids live in the upper half of the
/// sequence space so they can never collide with host-chosen request ids.
const NOTIFY_SEQUENCE_BASE: u64 = 1 << 63;

#[derive(Clone, Debug)]
pub struct BridgeOptions {
    /// Frames whose declared size exceeds this are fatal to the connection.
    pub max_frame_size: usize,
    /// How long in-flight workers may keep running once the connection
    /// starts draining.
    pub drain_timeout: Duration,
    /// Capacity of the notification queue between runtime callbacks and the
    /// writer.
    pub notification_queue_depth: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            max_frame_size: 0x10_0000,
            drain_timeout: Duration::from_secs(5),
            notification_queue_depth: 32,
        }
    }
}

/// Connection lifecycle. Requests are only read in the first three states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing accepted but protocol negotiation.
    Uninit,
    /// Version agreed; container creation (and the stateless requests) are
    /// accepted.
    Negotiated,
    /// Full request set accepted.
    Active,
    /// No new requests; in-flight responses drain to a deadline.
    Draining,
    Closed,
}

/// Failure to queue a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("bridge connection is closed")]
    Closed,
    #[error("notification queue is full")]
    Full,
}

/// Cloneable handle for pushing container notifications to the host. Handed
/// to the runtime's event callbacks; safe to use from any task.
#[derive(Clone)]
pub struct BridgeNotifier {
    send: mpsc::Sender<ContainerNotification>,
}

impl BridgeNotifier {
    /// Queues a notification, waiting for queue capacity.
    pub async fn notify(&self, notification: ContainerNotification) -> Result<(), NotifyError> {
        self.send
            .send(notification)
            .await
            .map_err(|_| NotifyError::Closed)
    }

    /// Queues a notification without waiting; a full queue is surfaced to
    /// the producer rather than silently buffered without bound.
    pub fn try_notify(&self, notification: ContainerNotification) -> Result<(), NotifyError> {
        self.send.try_send(notification).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => NotifyError::Full,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

/// A bridge serving a single host connection.
pub struct Bridge {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<dyn SecurityPolicy>,
    mounts: Arc<MountManager>,
    opts: BridgeOptions,
    notify_send: mpsc::Sender<ContainerNotification>,
    notify_recv: mpsc::Receiver<ContainerNotification>,
}

impl Bridge {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: Arc<dyn SecurityPolicy>,
        mounts: Arc<MountManager>,
        opts: BridgeOptions,
    ) -> Self {
        let (notify_send, notify_recv) = mpsc::channel(opts.notification_queue_depth);
        Self {
            runtime,
            policy,
            mounts,
            opts,
            notify_send,
            notify_recv,
        }
    }

    /// Returns a handle for pushing notifications over this connection.
    pub fn notifier(&self) -> BridgeNotifier {
        BridgeNotifier {
            send: self.notify_send.clone(),
        }
    }

    /// Serves the connection until the host disconnects, a shutdown request
    /// completes, or a fatal error occurs.
    pub async fn run<T>(self, transport: T) -> Result<(), FatalError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Bridge {
            runtime,
            policy,
            mounts,
            opts,
            notify_send,
            mut notify_recv,
        } = self;
        // Only externally held notifier handles keep the queue open.
        drop(notify_send);

        let (mut reader, mut writer) = tokio::io::split(transport);

        let (frame_send, mut frames) = mpsc::channel(1);
        let max_frame = opts.max_frame_size;
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = framing::read_frame(&mut reader, max_frame).await;
                let failed = frame.is_err();
                if frame_send.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });

        let (out_send, mut out_recv) = mpsc::channel::<OutboundFrame>(64);
        let mut writer_task = tokio::spawn(async move {
            while let Some(frame) = out_recv.recv().await {
                framing::write_frame(&mut writer, frame.id, frame.sequence_id, &frame.payload)
                    .await?;
            }
            Ok::<_, std::io::Error>(())
        });
        let mut writer_finished = false;

        let (event_send, mut events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut workers: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        let mut state = ConnectionState::Uninit;
        let mut version = ProtocolVersion::INVALID;
        let mut notify_sequence = NOTIFY_SEQUENCE_BASE;

        let result = loop {
            tokio::select! {
                maybe_frame = frames.recv() => {
                    let (header, payload) = match maybe_frame {
                        None | Some(Err(FramingError::Disconnected)) => {
                            tracing::info!("host disconnected");
                            // Teardown: signal the in-flight workers.
                            cancel.cancel();
                            break Ok(());
                        }
                        Some(Err(err)) => {
                            cancel.cancel();
                            break Err(FatalError::Read(err));
                        }
                        Some(Ok(frame)) => frame,
                    };

                    // Workers signal state transitions through a channel; a
                    // transition queued behind this frame must be observed
                    // before the frame is classified.
                    let mut draining = false;
                    while let Ok(event) = events.try_recv() {
                        draining |= apply_event(&mut state, event);
                    }
                    if draining {
                        break Ok(());
                    }

                    let id = header.id();
                    match classify(state, id) {
                        Disposition::Negotiate => {
                            let (response, malformed) =
                                negotiate(&mut state, &mut version, &payload);
                            let _ = out_send
                                .send(OutboundFrame {
                                    id: id.response(),
                                    sequence_id: header.sequence_id(),
                                    payload: response,
                                })
                                .await;
                            // A host that cannot even frame the negotiation
                            // request gets no further chances.
                            if let Some(err) = malformed {
                                cancel.cancel();
                                break Err(FatalError::Negotiation(err));
                            }
                        }
                        Disposition::Dispatch => {
                            let env = RequestEnv {
                                runtime: runtime.clone(),
                                policy: policy.clone(),
                                mounts: mounts.clone(),
                                out: out_send.clone(),
                                events: event_send.clone(),
                                cancel: cancel.child_token(),
                                version,
                            };
                            workers.push(Box::pin(handlers::run_request(env, header, payload)));
                        }
                        Disposition::UnknownMessage => {
                            tracing::warn!(message = ?id, "unknown message identifier");
                            let response = failure_response(
                                &payload,
                                Hresult::HCS_E_UNKNOWN_MESSAGE,
                                anyhow::anyhow!("unknown message identifier {:?}", id),
                            );
                            let _ = out_send
                                .send(OutboundFrame {
                                    id: id.response(),
                                    sequence_id: header.sequence_id(),
                                    payload: response,
                                })
                                .await;
                        }
                        Disposition::WrongState => {
                            tracing::warn!(message = ?id, ?state, "message not valid in this state");
                            let response = failure_response(
                                &payload,
                                Hresult::HCS_E_INVALID_STATE,
                                anyhow::anyhow!("{:?} is not valid in the {:?} state", id, state),
                            );
                            let _ = out_send
                                .send(OutboundFrame {
                                    id: id.response(),
                                    sequence_id: header.sequence_id(),
                                    payload: response,
                                })
                                .await;
                        }
                        Disposition::Violation => {
                            tracing::error!(message = ?id, "protocol violation before negotiation");
                            let response = failure_response(
                                &payload,
                                Hresult::HCS_E_PROTOCOL_ERROR,
                                anyhow::anyhow!("{:?} received before protocol negotiation", id),
                            );
                            let _ = out_send
                                .send(OutboundFrame {
                                    id: id.response(),
                                    sequence_id: header.sequence_id(),
                                    payload: response,
                                })
                                .await;
                            cancel.cancel();
                            break Err(FatalError::ProtocolViolation(id));
                        }
                    }
                }

                Some(event) = events.recv() => {
                    if apply_event(&mut state, event) {
                        break Ok(());
                    }
                }

                Some(()) = workers.next(), if !workers.is_empty() => {}

                Some(notification) = notify_recv.recv() => {
                    let frame = OutboundFrame {
                        id: MessageIdentifier::NOTIFICATION,
                        sequence_id: notify_sequence,
                        payload: handlers::encode(&notification),
                    };
                    notify_sequence += 1;
                    let _ = out_send.send(frame).await;
                }

                join = &mut writer_task => {
                    writer_finished = true;
                    cancel.cancel();
                    break Err(FatalError::Write(match join {
                        Ok(Err(err)) => err,
                        Ok(Ok(())) => std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "writer stopped",
                        ),
                        Err(join_err) => std::io::Error::other(join_err),
                    }));
                }
            }
        };

        // Draining: stop reading, let already-dispatched workers finish up to
        // the deadline, then flush whatever they queued.
        state = ConnectionState::Draining;
        tracing::debug!(?state, "draining connection");
        reader_task.abort();
        let _ = tokio::time::timeout(opts.drain_timeout, async {
            while workers.next().await.is_some() {}
        })
        .await;
        drop(workers);
        drop(out_send);
        if !writer_finished {
            let _ = writer_task.await;
        }
        state = ConnectionState::Closed;
        tracing::info!(?state, "connection closed");
        result
    }
}

// Returns true when the connection should start draining (a shutdown
// response has been queued).
fn apply_event(state: &mut ConnectionState, event: BridgeEvent) -> bool {
    match event {
        BridgeEvent::ContainerCreated => {
            if *state == ConnectionState::Negotiated {
                *state = ConnectionState::Active;
            }
            false
        }
        BridgeEvent::ShutdownResponded => true,
    }
}

enum Disposition {
    /// Handle protocol negotiation inline; it mutates connection state.
    Negotiate,
    /// Spawn a worker for a known, accepted request.
    Dispatch,
    /// Respond unknown-message; the connection stays up.
    UnknownMessage,
    /// Known message, but not acceptable in the current state; recovered.
    WrongState,
    /// Anything but negotiation before negotiation is fatal.
    Violation,
}

fn classify(state: ConnectionState, id: MessageIdentifier) -> Disposition {
    let known = id.message_type() == MessageType::REQUEST
        && matches!(
            id,
            MessageIdentifier::CREATE
                | MessageIdentifier::START
                | MessageIdentifier::SHUTDOWN_GRACEFUL
                | MessageIdentifier::SHUTDOWN_FORCED
                | MessageIdentifier::EXECUTE_PROCESS
                | MessageIdentifier::WAIT_FOR_PROCESS
                | MessageIdentifier::SIGNAL_PROCESS
                | MessageIdentifier::RESIZE_CONSOLE
                | MessageIdentifier::GET_PROPERTIES
                | MessageIdentifier::MODIFY_SETTINGS
                | MessageIdentifier::NEGOTIATE_PROTOCOL
                | MessageIdentifier::DUMP_STACKS
                | MessageIdentifier::DELETE_CONTAINER_STATE
        );

    match state {
        ConnectionState::Uninit => {
            if id == MessageIdentifier::NEGOTIATE_PROTOCOL {
                Disposition::Negotiate
            } else {
                Disposition::Violation
            }
        }
        _ if !known => Disposition::UnknownMessage,
        ConnectionState::Negotiated => match id {
            MessageIdentifier::CREATE
            | MessageIdentifier::DUMP_STACKS
            | MessageIdentifier::DELETE_CONTAINER_STATE => Disposition::Dispatch,
            _ => Disposition::WrongState,
        },
        ConnectionState::Active => {
            if id == MessageIdentifier::NEGOTIATE_PROTOCOL {
                Disposition::WrongState
            } else {
                Disposition::Dispatch
            }
        }
        ConnectionState::Draining | ConnectionState::Closed => Disposition::WrongState,
    }
}

fn failure_response(payload: &[u8], code: Hresult, error: anyhow::Error) -> Vec<u8> {
    let base = handlers::partial_base(payload);
    handlers::encode(&handlers::response_base(
        &base.activity_id,
        Err(HandlerFailure::new(code, error)),
    ))
}

// Returns the response payload, plus the decode error when the request was
// malformed (which is fatal to the connection once the response is sent).
fn negotiate(
    state: &mut ConnectionState,
    version: &mut ProtocolVersion,
    payload: &[u8],
) -> (Vec<u8>, Option<serde_json::Error>) {
    let req: NegotiateProtocol = match serde_json::from_slice(payload) {
        Ok(req) => req,
        Err(err) => {
            let response = failure_response(
                payload,
                Hresult::HCS_E_INVALID_JSON,
                anyhow::anyhow!("failed to unmarshal NegotiateProtocol"),
            );
            return (response, Some(err));
        }
    };

    if req.minimum_version > ProtocolVersion::MAX.0 || req.maximum_version < ProtocolVersion::V4.0
    {
        tracing::warn!(
            minimum = req.minimum_version,
            maximum = req.maximum_version,
            "no supported protocol version in the offered range"
        );
        let response = handlers::encode(&NegotiateProtocolResponse {
            base: handlers::response_base(
                &req.base.activity_id,
                Err(HandlerFailure::new(
                    Hresult::HCS_E_UNSUPPORTED_PROTOCOL_VERSION,
                    anyhow::anyhow!(
                        "no supported protocol version in [{}, {}]",
                        req.minimum_version,
                        req.maximum_version
                    ),
                )),
            ),
            ..Default::default()
        });
        return (response, None);
    }

    *version = ProtocolVersion::V4;
    *state = ConnectionState::Negotiated;
    tracing::info!(version = ?*version, "protocol negotiated");
    let response = handlers::encode(&NegotiateProtocolResponse {
        base: handlers::response_base(&req.base.activity_id, Ok(())),
        version: version.0,
        capabilities: capabilities(),
    });
    (response, None)
}

fn capabilities() -> GcsCapabilities {
    GcsCapabilities {
        send_host_create_message: false,
        send_host_start_message: false,
        hv_socket_config_on_startup: false,
        supported_schema_versions: vec![SchemaVersion { major: 2, minor: 1 }],
        runtime_os_type: OS_TYPE_LINUX.to_string(),
        guest_defined_capabilities: GcsGuestCapabilities {
            namespace_add_request_supported: true,
            signal_process_supported: true,
            dump_stacks_supported: true,
            delete_container_state_supported: true,
        },
    }
}
