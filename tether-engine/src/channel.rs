//! Per-connection protocol handling.
//!
//! The first frame decides what a connection is: `Hello` opens a signaling
//! channel bound to one session role, `Control` starts a stream of
//! control-plane calls that each carry their own token. Anything else is
//! answered with an `Error` frame and the connection is closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::error::{ErrorCode, RelayError};
use tether_core::listener::{Connection, ListenerFactory};
use tether_core::protocol::{
    ApiResponse, ControlPayload, ErrorPayload, Frame, HelloPayload, MessageType, RequestPayload,
    ResponsePayload, decode_payload,
};

use crate::auth::Authenticator;
use crate::control::ControlPlane;
use crate::engine::EngineEvent;
use crate::framing::{FrameReader, write_frame};
use crate::message_processor::{invalid_request, process_control, process_request};
use crate::router::OpenedChannel;

/// Trait for handling accepted connections.
///
/// The engine calls [`handle`](ConnectionHandler::handle) for every inbound
/// connection, each in its own spawned task.
pub trait ConnectionHandler<C: Connection>: Send + Sync + 'static {
    fn handle(&self, conn: C) -> impl Future<Output = ()> + Send;
}

pub struct ChannelHandler<F: ListenerFactory> {
    control: Arc<ControlPlane<F>>,
    auth: Arc<dyn Authenticator>,
    handshake_timeout: Duration,
    events: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
}

impl<F: ListenerFactory> ChannelHandler<F> {
    pub fn new(
        control: Arc<ControlPlane<F>>,
        auth: Arc<dyn Authenticator>,
        handshake_timeout: Duration,
        events: broadcast::Sender<EngineEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            control,
            auth,
            handshake_timeout,
            events,
            shutdown,
        }
    }

    async fn serve_signaling<C: Connection>(
        &self,
        conn: &mut C,
        reader: &mut FrameReader,
        peer: &str,
        hello: &Frame,
    ) {
        let hello: HelloPayload = match decode_payload(&hello.payload) {
            Ok(hello) => hello,
            Err(e) => {
                send_fatal(conn, ErrorCode::InvalidRequest, format!("malformed hello: {e}")).await;
                return;
            }
        };
        let Some(user_id) = self.auth.authenticate(&hello.token) else {
            warn!(peer = %peer, session_id = %hello.session_id, "Hello rejected: unknown token");
            send_fatal(conn, ErrorCode::AuthRequired, "invalid or missing token").await;
            return;
        };

        let router = self.control.router();
        let OpenedChannel {
            connection_id,
            ack,
            mut events,
        } = match router.open(&hello.session_id, &user_id) {
            Ok(opened) => opened,
            Err(e) => {
                info!(peer = %peer, user = %user_id, error = %e, "Channel open refused");
                send_relay_error(conn, &e).await;
                return;
            }
        };

        let session_id = ack.session_id.clone();
        let role = ack.role;
        if let Err(e) = write_frame(conn, MessageType::HelloAck, &ack).await {
            warn!(peer = %peer, error = %e, "Failed to send HELLO_ACK");
            router.close(connection_id);
            return;
        }
        let _ = self.events.send(EngineEvent::ChannelOpened {
            connection_id,
            session_id: session_id.clone(),
            user_id,
            role,
            peer: peer.to_owned(),
        });

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    debug!(connection_id, "Engine shutting down, closing channel");
                    break;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        info!(connection_id, session_id = %session_id, "Channel superseded");
                        break;
                    };
                    if let Err(e) = write_frame(conn, MessageType::Event, &event).await {
                        warn!(connection_id, error = %e, "Failed to push event");
                        break;
                    }
                }

                frame = reader.next_frame(conn) => match frame {
                    Ok(Some(frame)) if frame.header.msg_type == MessageType::Request => {
                        let (request_id, response) =
                            match decode_payload::<RequestPayload>(&frame.payload) {
                                Ok(request) => (
                                    request.request_id,
                                    process_request(router, connection_id, request.request),
                                ),
                                Err(e) => invalid_request(&frame.payload, &e),
                            };
                        if let Err(e) = send_response(conn, request_id, response).await {
                            warn!(connection_id, error = %e, "Failed to send response");
                            break;
                        }
                    }
                    Ok(Some(frame)) => {
                        let msg_type = frame.header.msg_type;
                        warn!(connection_id, msg_type = ?msg_type, "Unexpected frame on signaling channel");
                        send_fatal(
                            conn,
                            ErrorCode::InvalidRequest,
                            format!("unexpected {msg_type:?} frame on a signaling channel"),
                        )
                        .await;
                        break;
                    }
                    Ok(None) => {
                        debug!(connection_id, "Peer closed signaling channel");
                        break;
                    }
                    Err(e) => {
                        warn!(connection_id, error = %e, "Signaling channel read failed");
                        send_fatal(conn, ErrorCode::InvalidRequest, e.to_string()).await;
                        break;
                    }
                }
            }
        }

        router.close(connection_id);
        let _ = self.events.send(EngineEvent::ChannelClosed {
            connection_id,
            session_id,
        });
    }

    async fn serve_control<C: Connection>(
        &self,
        conn: &mut C,
        reader: &mut FrameReader,
        peer: &str,
        first: Frame,
    ) {
        let mut next = Some(first);
        let mut served: u64 = 0;

        loop {
            let frame = match next.take() {
                Some(frame) => frame,
                None => tokio::select! {
                    biased;

                    () = self.shutdown.cancelled() => break,

                    frame = reader.next_frame(conn) => match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Control connection read failed");
                            send_fatal(conn, ErrorCode::InvalidRequest, e.to_string()).await;
                            break;
                        }
                    }
                },
            };

            if frame.header.msg_type != MessageType::Control {
                let msg_type = frame.header.msg_type;
                send_fatal(
                    conn,
                    ErrorCode::InvalidRequest,
                    format!("unexpected {msg_type:?} frame on a control connection"),
                )
                .await;
                break;
            }

            let (request_id, response) = self.answer_control(&frame).await;
            if let Err(e) = send_response(conn, request_id, response).await {
                warn!(peer = %peer, error = %e, "Failed to send control response");
                break;
            }
            served += 1;
        }

        debug!(peer = %peer, served, "Control connection finished");
    }

    async fn answer_control(&self, frame: &Frame) -> (u64, ApiResponse) {
        let payload: ControlPayload = match decode_payload(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => return invalid_request(&frame.payload, &e),
        };
        let Some(user_id) = self.auth.authenticate(&payload.token) else {
            return (
                payload.request_id,
                ApiResponse::failure(&RelayError::new(
                    ErrorCode::AuthRequired,
                    "invalid or missing token",
                )),
            );
        };
        let response = process_control(&self.control, &user_id, payload.request).await;
        (payload.request_id, response)
    }
}

impl<F: ListenerFactory, C: Connection> ConnectionHandler<C> for ChannelHandler<F> {
    async fn handle(&self, mut conn: C) {
        let peer = conn.peer();
        let mut reader = FrameReader::new();

        let first = match timeout(self.handshake_timeout, reader.next_frame(&mut conn)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!(peer = %peer, "Connection closed before first frame");
                return;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Protocol error on first frame");
                send_fatal(&mut conn, ErrorCode::InvalidRequest, e.to_string()).await;
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "Handshake timed out");
                send_fatal(&mut conn, ErrorCode::AuthRequired, "handshake timed out").await;
                return;
            }
        };

        match first.header.msg_type {
            MessageType::Hello => {
                self.serve_signaling(&mut conn, &mut reader, &peer, &first)
                    .await;
            }
            MessageType::Control => {
                self.serve_control(&mut conn, &mut reader, &peer, first)
                    .await;
            }
            other => {
                warn!(peer = %peer, msg_type = ?other, "Unexpected first frame");
                send_fatal(
                    &mut conn,
                    ErrorCode::InvalidRequest,
                    format!("expected HELLO or CONTROL, got {other:?}"),
                )
                .await;
                return;
            }
        }

        if let Err(e) = conn.shutdown().await {
            debug!(peer = %peer, error = %e, "Shutdown after channel end failed");
        }
    }
}

async fn send_response<C: Connection>(
    conn: &mut C,
    request_id: u64,
    response: ApiResponse,
) -> anyhow::Result<()> {
    write_frame(
        conn,
        MessageType::Response,
        &ResponsePayload {
            request_id,
            response,
        },
    )
    .await
}

async fn send_relay_error<C: Connection>(conn: &mut C, err: &RelayError) {
    send_fatal(conn, err.code, err.message.clone()).await;
}

/// Sends a final `Error` frame. The caller closes the connection next.
async fn send_fatal<C: Connection>(conn: &mut C, code: ErrorCode, message: impl Into<String>) {
    let payload = ErrorPayload {
        code,
        message: message.into(),
    };
    if let Err(e) = write_frame(conn, MessageType::Error, &payload).await {
        debug!(error = %e, "Failed to send ERROR frame");
    }
}

#[cfg(test)]
mod tests {
    use tether_core::listener::{Connector, Listener};
    use tether_core::protocol::{ControlRequest, HelloAckPayload, ServerEvent};

    use super::*;
    use crate::auth::TokenTable;
    use crate::rendezvous::{Rendezvous, RendezvousConfig};
    use crate::router::Router;
    use crate::store::{MemoryStore, SessionRecord};
    use crate::tcp::{TcpConnection, TcpConnector, TcpListener, TcpListenerFactory};

    struct Harness {
        handler: Arc<ChannelHandler<TcpListenerFactory>>,
        control: Arc<ControlPlane<TcpListenerFactory>>,
        listener: TcpListener,
    }

    async fn harness(handshake_timeout: Duration) -> Harness {
        let router = Arc::new(Router::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            64,
        ));
        let (events, _) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let rendezvous = Rendezvous::new(
            Arc::new(TcpListenerFactory),
            Arc::clone(&router),
            RendezvousConfig {
                host: "127.0.0.1".into(),
                accept_timeout: Duration::from_secs(5),
                chunk_size: 8192,
                bind_attempts: 3,
            },
            events.clone(),
            shutdown.clone(),
        );
        let control = Arc::new(ControlPlane::new(router, rendezvous));
        let auth = TokenTable::default();
        auth.insert("tok-u1", "u1");
        auth.insert("tok-u2", "u2");
        let handler = Arc::new(ChannelHandler::new(
            Arc::clone(&control),
            Arc::new(auth),
            handshake_timeout,
            events,
            shutdown,
        ));
        let listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        Harness {
            handler,
            control,
            listener,
        }
    }

    /// Dials the harness listener and hands the server side to the handler.
    async fn dial(h: &mut Harness) -> TcpConnection {
        let addr = h.listener.local_addr();
        let (client, server) = tokio::join!(TcpConnector.connect(&addr), h.listener.accept());
        let server = server.unwrap();
        let handler = Arc::clone(&h.handler);
        tokio::spawn(async move { handler.handle(server).await });
        client.unwrap()
    }

    async fn read_frame(conn: &mut TcpConnection, reader: &mut FrameReader) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), reader.next_frame(conn))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("connection closed")
    }

    async fn hello(
        h: &mut Harness,
        session_id: &str,
        token: &str,
    ) -> (TcpConnection, FrameReader, Frame) {
        let mut conn = dial(h).await;
        let mut reader = FrameReader::new();
        write_frame(
            &mut conn,
            MessageType::Hello,
            &HelloPayload {
                session_id: session_id.into(),
                token: token.into(),
            },
        )
        .await
        .unwrap();
        let frame = read_frame(&mut conn, &mut reader).await;
        (conn, reader, frame)
    }

    fn joined(h: &Harness) -> SessionRecord {
        let session = h.control.start_session("u1").unwrap();
        h.control.join_session(&session.session_id, "u2").unwrap()
    }

    #[tokio::test]
    async fn given_valid_token_when_hello_sent_then_ack_carries_role_and_key_pair() {
        let mut h = harness(Duration::from_secs(5)).await;
        let session = joined(&h);

        let (_conn, _reader, frame) = hello(&mut h, &session.session_id, "tok-u2").await;
        assert_eq!(frame.header.msg_type, MessageType::HelloAck);
        let ack: HelloAckPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(ack.user_id, "u2");
        assert_eq!(ack.role, tether_core::protocol::Role::Client);
        assert!(!ack.key_pair.public_key.is_empty());
    }

    #[tokio::test]
    async fn given_unknown_token_when_hello_sent_then_error_frame_with_auth_required() {
        let mut h = harness(Duration::from_secs(5)).await;
        let session = joined(&h);

        let (_conn, _reader, frame) = hello(&mut h, &session.session_id, "forged").await;
        assert_eq!(frame.header.msg_type, MessageType::Error);
        let err: ErrorPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(err.code, ErrorCode::AuthRequired);
    }

    #[tokio::test]
    async fn given_stranger_when_hello_sent_then_error_frame_with_not_authorized() {
        let mut h = harness(Duration::from_secs(5)).await;
        let session = h.control.start_session("u1").unwrap();

        let (_conn, _reader, frame) = hello(&mut h, &session.session_id, "tok-u2").await;
        let err: ErrorPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(err.code, ErrorCode::NotAuthorized);
    }

    #[tokio::test]
    async fn given_silent_peer_when_handshake_times_out_then_error_frame_is_sent() {
        let mut h = harness(Duration::from_millis(50)).await;
        let mut conn = dial(&mut h).await;
        let mut reader = FrameReader::new();

        let frame = read_frame(&mut conn, &mut reader).await;
        assert_eq!(frame.header.msg_type, MessageType::Error);
    }

    #[tokio::test]
    async fn given_open_channel_when_request_is_garbage_then_invalid_request_keeps_channel_open() {
        let mut h = harness(Duration::from_secs(5)).await;
        let session = joined(&h);
        let (mut conn, mut reader, _) = hello(&mut h, &session.session_id, "tok-u1").await;

        conn.write_all(&tether_core::protocol::encode_frame_to_bytes(
            MessageType::Request,
            br#"{"request_id":5,"op":"teleport"}"#,
        ))
        .await
        .unwrap();
        let frame = read_frame(&mut conn, &mut reader).await;
        let response: ResponsePayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(response.request_id, 5);
        assert_eq!(response.response.code, Some(ErrorCode::InvalidRequest));

        write_frame(
            &mut conn,
            MessageType::Request,
            &RequestPayload {
                request_id: 6,
                request: tether_core::protocol::ChannelRequest::ReportError {
                    error: serde_json::json!({"reason": "decoder stalled"}),
                },
            },
        )
        .await
        .unwrap();
        let frame = read_frame(&mut conn, &mut reader).await;
        let response: ResponsePayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(response.request_id, 6);
        assert!(response.response.success);
    }

    #[tokio::test]
    async fn given_host_bound_when_client_opens_then_host_receives_peer_connected_event() {
        let mut h = harness(Duration::from_secs(5)).await;
        let session = joined(&h);
        let (mut host, mut host_reader, _) = hello(&mut h, &session.session_id, "tok-u1").await;
        let (_client, _client_reader, _) = hello(&mut h, &session.session_id, "tok-u2").await;

        let frame = read_frame(&mut host, &mut host_reader).await;
        assert_eq!(frame.header.msg_type, MessageType::Event);
        let event: ServerEvent = decode_payload(&frame.payload).unwrap();
        assert!(matches!(event, ServerEvent::PeerConnected { ref user_id, .. } if user_id == "u2"));
    }

    #[tokio::test]
    async fn given_control_connection_when_token_is_bad_then_auth_required_and_next_call_still_served() {
        let mut h = harness(Duration::from_secs(5)).await;
        let mut conn = dial(&mut h).await;
        let mut reader = FrameReader::new();

        for (request_id, token) in [(1, "forged"), (2, "tok-u1")] {
            write_frame(
                &mut conn,
                MessageType::Control,
                &ControlPayload {
                    request_id,
                    token: token.into(),
                    request: ControlRequest::StartSession,
                },
            )
            .await
            .unwrap();
        }

        let first: ResponsePayload =
            decode_payload(&read_frame(&mut conn, &mut reader).await.payload).unwrap();
        assert_eq!(first.request_id, 1);
        assert_eq!(first.response.code, Some(ErrorCode::AuthRequired));

        let second: ResponsePayload =
            decode_payload(&read_frame(&mut conn, &mut reader).await.payload).unwrap();
        assert_eq!(second.request_id, 2);
        let session: SessionRecord = second.response.into_data().unwrap();
        assert_eq!(session.host_user_id, "u1");
    }

    #[tokio::test]
    async fn given_event_frame_first_when_connecting_then_error_frame_is_sent() {
        let mut h = harness(Duration::from_secs(5)).await;
        let mut conn = dial(&mut h).await;
        let mut reader = FrameReader::new();

        write_frame(&mut conn, MessageType::Event, &serde_json::json!({}))
            .await
            .unwrap();
        let frame = read_frame(&mut conn, &mut reader).await;
        let err: ErrorPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }
}
