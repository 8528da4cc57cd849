//! Client side of the signaling and control protocols.
//!
//! Used by embedders that talk to a relay over the framed transport, and
//! by the engine's own end-to-end tests.

use std::collections::VecDeque;

use anyhow::{Context, bail};
use serde_json::Value;
use tracing::debug;

use tether_core::listener::{Connection, Connector};
use tether_core::protocol::{
    ApiResponse, ChannelRequest, ControlPayload, ControlRequest, ErrorPayload, Frame,
    HelloAckPayload, HelloPayload, MessageType, RequestPayload, ResponsePayload, ServerEvent,
    SignalEnvelope, SignalKind, decode_payload,
};

use crate::framing::{FrameReader, write_frame};
use crate::rendezvous::PortGrant;
use crate::store::SessionRecord;

/// Receives locally produced media-negotiation output and ships it to the
/// remote peer.
///
/// The capture/codec layer calls these; the relay never looks inside.
pub trait MediaSignalSink: Send {
    /// A local SDP offer or answer is ready.
    fn on_local_description<'a>(
        &'a mut self,
        kind: SignalKind,
        sdp: &'a str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// A local ICE candidate was gathered.
    fn on_ice_candidate(
        &mut self,
        candidate: Value,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}

/// A bound signaling channel.
///
/// Events that arrive while a [`call`](Self::call) waits for its response
/// are queued and returned by [`next_event`](Self::next_event) in order.
pub struct SignalingClient<C: Connection> {
    conn: C,
    reader: FrameReader,
    ack: HelloAckPayload,
    next_request_id: u64,
    pending: VecDeque<ServerEvent>,
}

impl<C: Connection> SignalingClient<C> {
    /// Dials `addr` and performs the hello handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the server refuses the
    /// channel.
    pub async fn open<K>(
        connector: &K,
        addr: &str,
        session_id: &str,
        token: &str,
    ) -> anyhow::Result<Self>
    where
        K: Connector<Conn = C>,
    {
        let mut conn = connector.connect(addr).await?;
        let mut reader = FrameReader::new();
        write_frame(
            &mut conn,
            MessageType::Hello,
            &HelloPayload {
                session_id: session_id.to_owned(),
                token: token.to_owned(),
            },
        )
        .await?;

        let frame = reader
            .next_frame(&mut conn)
            .await?
            .context("server closed the channel during the handshake")?;
        match frame.header.msg_type {
            MessageType::HelloAck => {
                let ack: HelloAckPayload = decode_payload(&frame.payload)?;
                debug!(connection_id = ack.connection_id, role = ?ack.role, "Signaling channel open");
                Ok(Self {
                    conn,
                    reader,
                    ack,
                    next_request_id: 1,
                    pending: VecDeque::new(),
                })
            }
            MessageType::Error => Err(refusal(&frame)),
            other => bail!("unexpected {other:?} frame during the handshake"),
        }
    }

    /// The server's handshake answer, including the ephemeral key pair.
    #[must_use]
    pub fn ack(&self) -> &HelloAckPayload {
        &self.ack
    }

    /// Sends one request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or if the server closes the
    /// channel first.
    pub async fn call(&mut self, request: ChannelRequest) -> anyhow::Result<ApiResponse> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        write_frame(
            &mut self.conn,
            MessageType::Request,
            &RequestPayload {
                request_id,
                request,
            },
        )
        .await?;

        loop {
            let frame = self
                .reader
                .next_frame(&mut self.conn)
                .await?
                .context("channel closed while awaiting a response")?;
            match frame.header.msg_type {
                MessageType::Response => {
                    let response: ResponsePayload = decode_payload(&frame.payload)?;
                    if response.request_id == request_id {
                        return Ok(response.response);
                    }
                    debug!(expected = request_id, got = response.request_id, "Stale response ignored");
                }
                MessageType::Event => self.pending.push_back(decode_payload(&frame.payload)?),
                MessageType::Error => return Err(refusal(&frame)),
                other => bail!("unexpected {other:?} frame on a signaling channel"),
            }
        }
    }

    /// The next routed event, or `None` once the server closed the channel.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a fatal `Error` frame.
    pub async fn next_event(&mut self) -> anyhow::Result<Option<ServerEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        loop {
            let Some(frame) = self.reader.next_frame(&mut self.conn).await? else {
                return Ok(None);
            };
            match frame.header.msg_type {
                MessageType::Event => return Ok(Some(decode_payload(&frame.payload)?)),
                MessageType::Error => return Err(refusal(&frame)),
                other => debug!(msg_type = ?other, "Ignoring frame while waiting for an event"),
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.conn.shutdown().await
    }

    async fn signal(&mut self, kind: SignalKind, data: Value) -> anyhow::Result<()> {
        let response = self
            .call(ChannelRequest::SendSignal {
                session_id: self.ack.session_id.clone(),
                signal: SignalEnvelope { kind, data },
            })
            .await?;
        if !response.success {
            bail!("signal rejected: {}", response.message);
        }
        Ok(())
    }
}

impl<C: Connection> MediaSignalSink for SignalingClient<C> {
    fn on_local_description<'a>(
        &'a mut self,
        kind: SignalKind,
        sdp: &'a str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            if !matches!(kind, SignalKind::Offer | SignalKind::Answer) {
                bail!("{kind:?} is not a session description");
            }
            self.signal(kind, Value::String(sdp.to_owned())).await
        }
    }

    fn on_ice_candidate(
        &mut self,
        candidate: Value,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move { self.signal(SignalKind::IceCandidate, candidate).await }
    }
}

/// A connection carrying control-plane calls for one bearer token.
pub struct ControlClient<C: Connection> {
    conn: C,
    reader: FrameReader,
    token: String,
    next_request_id: u64,
}

impl<C: Connection> ControlClient<C> {
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn open<K>(connector: &K, addr: &str, token: &str) -> anyhow::Result<Self>
    where
        K: Connector<Conn = C>,
    {
        Ok(Self {
            conn: connector.connect(addr).await?,
            reader: FrameReader::new(),
            token: token.to_owned(),
            next_request_id: 1,
        })
    }

    /// Sends one control request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a fatal `Error` frame.
    pub async fn call(&mut self, request: ControlRequest) -> anyhow::Result<ApiResponse> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        write_frame(
            &mut self.conn,
            MessageType::Control,
            &ControlPayload {
                request_id,
                token: self.token.clone(),
                request,
            },
        )
        .await?;

        loop {
            let frame = self
                .reader
                .next_frame(&mut self.conn)
                .await?
                .context("server closed the control connection")?;
            match frame.header.msg_type {
                MessageType::Response => {
                    let response: ResponsePayload = decode_payload(&frame.payload)?;
                    if response.request_id == request_id {
                        return Ok(response.response);
                    }
                }
                MessageType::Error => return Err(refusal(&frame)),
                other => bail!("unexpected {other:?} frame on a control connection"),
            }
        }
    }

    /// # Errors
    ///
    /// Transport failures or a failed envelope.
    pub async fn start_session(&mut self) -> anyhow::Result<SessionRecord> {
        self.call(ControlRequest::StartSession).await?.into_data()
    }

    /// # Errors
    ///
    /// Transport failures or a failed envelope.
    pub async fn join_session(&mut self, session_id: &str) -> anyhow::Result<SessionRecord> {
        self.call(ControlRequest::JoinSession {
            session_id: session_id.to_owned(),
        })
        .await?
        .into_data()
    }

    /// # Errors
    ///
    /// Transport failures or a failed envelope.
    pub async fn initiate_tcp_transfer(
        &mut self,
        session_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> anyhow::Result<PortGrant> {
        self.call(ControlRequest::InitiateTcpTransfer {
            session_id: session_id.to_owned(),
            file_name: file_name.to_owned(),
            file_size,
        })
        .await?
        .into_data()
    }

    /// # Errors
    ///
    /// Transport failures or a failed envelope.
    pub async fn connect_to_receiver(&mut self, session_id: &str) -> anyhow::Result<PortGrant> {
        self.call(ControlRequest::ConnectToReceiver {
            session_id: session_id.to_owned(),
        })
        .await?
        .into_data()
    }
}

fn refusal(frame: &Frame) -> anyhow::Error {
    match decode_payload::<ErrorPayload>(&frame.payload) {
        Ok(err) => anyhow::anyhow!("server refused ({}): {}", err.code, err.message),
        Err(e) => e.context("server sent an unreadable ERROR frame"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    use tether_core::listener::{Listener, ListenerFactory};

    use super::*;
    use crate::auth::TokenTable;
    use crate::channel::{ChannelHandler, ConnectionHandler};
    use crate::control::ControlPlane;
    use crate::rendezvous::{Rendezvous, RendezvousConfig};
    use crate::router::Router;
    use crate::store::MemoryStore;
    use crate::tcp::{TcpConnection, TcpConnector, TcpListenerFactory};

    /// Serves every accepted connection with a fresh handler over one shared
    /// router. Returns the listen address and the router.
    async fn serve() -> (String, Arc<Router>) {
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
        let auth = TokenTable::default();
        auth.insert("tok-u1", "u1");
        auth.insert("tok-u2", "u2");
        let handler = Arc::new(ChannelHandler::new(
            Arc::new(ControlPlane::new(Arc::clone(&router), rendezvous)),
            Arc::new(auth),
            Duration::from_secs(5),
            events,
            shutdown,
        ));

        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        tokio::spawn(async move {
            while let Ok(conn) = listener.accept().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.handle(conn).await });
            }
        });
        (addr, router)
    }

    async fn pair(addr: &str) -> (SignalingClient<TcpConnection>, SignalingClient<TcpConnection>) {
        let mut control = ControlClient::open(&TcpConnector, addr, "tok-u1").await.unwrap();
        let session = control.start_session().await.unwrap();
        ControlClient::open(&TcpConnector, addr, "tok-u2")
            .await
            .unwrap()
            .join_session(&session.session_id)
            .await
            .unwrap();
        let host = SignalingClient::open(&TcpConnector, addr, &session.session_id, "tok-u1")
            .await
            .unwrap();
        let client = SignalingClient::open(&TcpConnector, addr, &session.session_id, "tok-u2")
            .await
            .unwrap();
        (host, client)
    }

    async fn next_signal(client: &mut SignalingClient<TcpConnection>) -> SignalEnvelope {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next_event().await.unwrap() {
                    Some(ServerEvent::Signal { signal, .. }) => return signal,
                    Some(_) => {}
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for signal")
    }

    #[tokio::test]
    async fn given_unknown_session_when_opening_then_error_names_the_code() {
        let (addr, _router) = serve().await;
        let Err(err) = SignalingClient::open(&TcpConnector, &addr, "nope", "tok-u1").await else {
            panic!("open should fail");
        };
        assert!(err.to_string().contains("SESSION_NOT_FOUND"), "{err:#}");
    }

    #[tokio::test]
    async fn given_media_sink_when_offer_and_candidate_emitted_then_peer_receives_both_in_order() {
        let (addr, _router) = serve().await;
        let (mut host, mut client) = pair(&addr).await;

        host.on_local_description(SignalKind::Offer, "v=0\r\no=- 1 2 IN IP4 127.0.0.1")
            .await
            .unwrap();
        host.on_ice_candidate(json!({"candidate": "candidate:1", "sdpMid": "0"}))
            .await
            .unwrap();

        let offer = next_signal(&mut client).await;
        assert_eq!(offer.kind, SignalKind::Offer);
        assert_eq!(offer.data, json!("v=0\r\no=- 1 2 IN IP4 127.0.0.1"));
        let candidate = next_signal(&mut client).await;
        assert_eq!(candidate.kind, SignalKind::IceCandidate);
        assert_eq!(candidate.data["sdpMid"], "0");
    }

    #[tokio::test]
    async fn given_sink_when_state_passed_as_description_then_error_without_sending() {
        let (addr, _router) = serve().await;
        let (mut host, _client) = pair(&addr).await;
        assert!(
            host.on_local_description(SignalKind::State, "connected")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn given_event_arriving_during_call_when_next_event_then_it_is_not_lost() {
        let (addr, _router) = serve().await;
        let (mut host, mut client) = pair(&addr).await;

        client
            .on_ice_candidate(json!({"candidate": "candidate:7"}))
            .await
            .unwrap();
        // The host's next call reads past the routed signal to find its response.
        let response = host
            .call(ChannelRequest::ReportError {
                error: json!({"stage": "ice"}),
            })
            .await
            .unwrap();
        assert!(response.success);

        let signal = next_signal(&mut host).await;
        assert_eq!(signal.data["candidate"], "candidate:7");
    }

    #[tokio::test]
    async fn given_peer_closes_when_waiting_then_peer_disconnected_event() {
        let (addr, _router) = serve().await;
        let (mut host, client) = pair(&addr).await;
        client.close().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match host.next_event().await.unwrap() {
                    Some(ev @ ServerEvent::PeerDisconnected { .. }) => return ev,
                    Some(_) => {}
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(event, ServerEvent::PeerDisconnected { ref user_id, .. } if user_id == "u2"));
    }
}
