//! Signaling router: validates each call against the registry, then routes
//! its effect to the bound peer connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::crypto::{self, EphemeralKeyPair};
use tether_core::error::{ErrorCode, RelayError, RelayResult};
use tether_core::protocol::{
    ConnectionId, HelloAckPayload, InputPayload, Role, ServerEvent, SignalEnvelope,
};

use crate::hub::ConnectionHub;
use crate::keys::SessionKeyStore;
use crate::registry::{CallContext, SessionRegistry};
use crate::store::{ActionLog, ErrorReport, FileTransfer, SessionRecord, SessionStore};
use crate::transfers::TransferBook;

/// A freshly bound signaling channel.
pub struct OpenedChannel {
    pub connection_id: ConnectionId,
    pub ack: HelloAckPayload,
    pub events: mpsc::Receiver<ServerEvent>,
}

pub struct Router {
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    keys: Arc<SessionKeyStore>,
    transfers: Arc<TransferBook>,
    store: Arc<dyn SessionStore>,
    next_connection_id: AtomicU64,
}

impl Router {
    pub fn new(
        store: Arc<dyn SessionStore>,
        inactivity_timeout: Duration,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(store.clone(), inactivity_timeout)),
            hub: Arc::new(ConnectionHub::new(outbox_capacity)),
            keys: Arc::new(SessionKeyStore::new()),
            transfers: Arc::new(TransferBook::new(store.clone())),
            store,
            next_connection_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn transfers(&self) -> &TransferBook {
        &self.transfers
    }

    #[must_use]
    pub fn keys(&self) -> &SessionKeyStore {
        &self.keys
    }

    // ── Channel lifecycle ───────────────────────────────────────────

    /// Binds a new connection for `user_id` in `session_id`, hands it a fresh
    /// ephemeral key pair and tells the bound peer.
    ///
    /// A connection previously bound to the same role loses its outbox, which
    /// ends its channel.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`, `SESSION_INACTIVE`, `NOT_AUTHORIZED`.
    pub fn open(&self, session_id: &str, user_id: &str) -> RelayResult<OpenedChannel> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let events = self.hub.register(connection_id);

        let binding = match self.registry.connect(session_id, user_id, connection_id) {
            Ok(binding) => binding,
            Err(e) => {
                self.hub.unregister(connection_id);
                return Err(e);
            }
        };

        if let Some(old) = binding.superseded {
            info!(session_id = %session_id, old, new = connection_id, "Connection superseded");
            self.hub.unregister(old);
        }

        if let (Some(peer), Some(peer_user)) = (binding.peer_connection, &binding.peer_user_id) {
            self.hub.deliver(
                peer,
                ServerEvent::PeerConnected {
                    session_id: session_id.to_owned(),
                    user_id: user_id.to_owned(),
                    role: binding.role,
                },
            );
            self.hub.deliver(
                connection_id,
                ServerEvent::PeerConnected {
                    session_id: session_id.to_owned(),
                    user_id: peer_user.clone(),
                    role: binding.role.peer(),
                },
            );
        }

        let key_pair = EphemeralKeyPair::generate();
        info!(session_id = %session_id, user = %user_id, connection_id, role = ?binding.role, "Channel opened");

        Ok(OpenedChannel {
            connection_id,
            ack: HelloAckPayload {
                connection_id,
                session_id: session_id.to_owned(),
                user_id: user_id.to_owned(),
                role: binding.role,
                key_pair: key_pair.to_payload(),
            },
            events,
        })
    }

    /// Unbinds `connection_id`. A superseded connection closing leaves the
    /// newer binding, the peer and the session key untouched.
    pub fn close(&self, connection_id: ConnectionId) {
        let Some(unbound) = self.registry.disconnect(connection_id) else {
            self.hub.unregister(connection_id);
            return;
        };
        if !unbound.cleared {
            debug!(connection_id, "Superseded connection closed");
            return;
        }
        self.hub.unregister(connection_id);

        let info = unbound.info;
        if let Some(peer) = unbound.peer_connection {
            self.hub.deliver(
                peer,
                ServerEvent::PeerDisconnected {
                    session_id: info.session_id.clone(),
                    user_id: info.user_id.clone(),
                    role: info.role,
                },
            );
        }
        self.keys.clear(&info.session_id);
        info!(session_id = %info.session_id, user = %info.user_id, connection_id, "Channel closed");
    }

    // ── Routed calls ────────────────────────────────────────────────

    /// Forwards a remote-input action from the host to the client and
    /// records it in the action log.
    ///
    /// # Errors
    ///
    /// Registry failures, then `NOT_HOST`, then `CLIENT_DISCONNECTED`.
    pub fn send_input(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        payload: InputPayload,
    ) -> RelayResult<()> {
        let ctx = self.registry.resolve_call(connection_id, session_id)?;
        if ctx.role != Role::Host {
            return Err(RelayError::new(
                ErrorCode::NotHost,
                "only the host may send input",
            ));
        }
        let Some(client) = ctx.peer_connection else {
            return Err(RelayError::new(
                ErrorCode::ClientDisconnected,
                format!("client of session {session_id} is not connected"),
            ));
        };

        let entry = ActionLog {
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            kind: payload.kind,
            payload: payload.data.clone(),
            at: Utc::now(),
        };
        self.hub.deliver(
            client,
            ServerEvent::Input {
                session_id: ctx.session_id,
                payload,
            },
        );
        if let Err(e) = self.store.log_action(&entry) {
            warn!(session_id = %session_id, error = %e, "Failed to log input action");
        }
        Ok(())
    }

    /// Relays a media-negotiation envelope to the peer. Without a bound
    /// peer the envelope is dropped.
    ///
    /// # Errors
    ///
    /// Registry failures only.
    pub fn send_signal(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        signal: SignalEnvelope,
    ) -> RelayResult<()> {
        let ctx = self.registry.resolve_call(connection_id, session_id)?;
        let Some(peer) = ctx.peer_connection else {
            debug!(session_id = %session_id, kind = ?signal.kind, "Peer not connected, signal dropped");
            return Ok(());
        };
        self.hub.deliver(
            peer,
            ServerEvent::Signal {
                session_id: ctx.session_id,
                from_user_id: ctx.user_id,
                signal,
            },
        );
        Ok(())
    }

    /// Routes the caller's public key to the named peer.
    ///
    /// # Errors
    ///
    /// `NOT_AUTHORIZED` if `peer_id` is not the other participant,
    /// `INVALID_KEY` if `public_key` is not base64.
    pub fn exchange_public_key(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        peer_id: &str,
        public_key: String,
    ) -> RelayResult<()> {
        let ctx = self.call_with_peer(connection_id, session_id, peer_id)?;
        crypto::decode_b64(&public_key)?;

        let Some(peer) = ctx.peer_connection else {
            debug!(session_id = %session_id, "Peer not connected, public key dropped");
            return Ok(());
        };
        self.hub.deliver(
            peer,
            ServerEvent::PublicKeyOffered {
                session_id: ctx.session_id,
                from_user_id: ctx.user_id,
                public_key,
            },
        );
        Ok(())
    }

    /// Derives the session key from the caller's private key and the peer's
    /// public key, and caches it under the session.
    ///
    /// # Errors
    ///
    /// `NOT_AUTHORIZED` for a wrong `peer_id`, `INVALID_KEY` for unusable
    /// key material.
    pub fn complete_key_exchange(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        peer_id: &str,
        private_key: &str,
        peer_public_key: &str,
    ) -> RelayResult<()> {
        let ctx = self.call_with_peer(connection_id, session_id, peer_id)?;
        self.keys
            .derive_and_install(&ctx.session_id, private_key, peer_public_key)?;
        info!(session_id = %session_id, user = %ctx.user_id, "Key exchange completed");
        Ok(())
    }

    /// Seals base64 `plaintext` under the session key; returns base64.
    ///
    /// # Errors
    ///
    /// `KEY_NOT_FOUND` before a completed key exchange.
    pub fn encrypt_message(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        plaintext: &str,
    ) -> RelayResult<String> {
        self.registry.resolve_call(connection_id, session_id)?;
        let plaintext = crypto::decode_b64(plaintext)?;
        let sealed = self.keys.encrypt(session_id, &plaintext)?;
        Ok(crypto::encode_b64(&sealed))
    }

    /// Opens base64 `nonce ‖ ciphertext ‖ tag`; returns base64 plaintext.
    ///
    /// # Errors
    ///
    /// `KEY_NOT_FOUND`, or `CRYPTO_VERIFICATION_FAILED` on tampering.
    pub fn decrypt_message(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        ciphertext: &str,
    ) -> RelayResult<String> {
        self.registry.resolve_call(connection_id, session_id)?;
        let sealed = crypto::decode_b64(ciphertext).map_err(|_| {
            RelayError::new(
                ErrorCode::CryptoVerificationFailed,
                "ciphertext is not valid base64",
            )
        })?;
        let plaintext = self.keys.decrypt(session_id, &sealed)?;
        Ok(crypto::encode_b64(&plaintext))
    }

    /// Persists a client-side diagnostic. Never routed.
    ///
    /// # Errors
    ///
    /// `AUTH_REQUIRED` for an unbound connection.
    pub fn report_error(&self, connection_id: ConnectionId, error: Value) -> RelayResult<()> {
        let info = self.registry.connection(connection_id).ok_or_else(|| {
            RelayError::new(ErrorCode::AuthRequired, "connection is not bound to a session")
        })?;
        warn!(session_id = %info.session_id, user = %info.user_id, "Client reported an error");
        self.store
            .log_error(&ErrorReport {
                session_id: info.session_id,
                user_id: info.user_id,
                role: info.role,
                payload: error,
                at: Utc::now(),
            })
            .map_err(RelayError::internal)
    }

    // ── Transfer control ────────────────────────────────────────────

    /// # Errors
    ///
    /// `TRANSFER_NOT_FOUND`, registry failures, `NOT_AUTHORIZED` unless the
    /// caller receives, `INVALID_TRANSFER_STATE` unless pending.
    pub fn accept_transfer(
        &self,
        connection_id: ConnectionId,
        transfer_id: &str,
    ) -> RelayResult<FileTransfer> {
        let ctx = self.call_for_transfer(connection_id, transfer_id)?;
        let transfer = self.transfers.accept(transfer_id, &ctx.user_id)?;
        self.notify_participants(
            &transfer.session_id,
            &ServerEvent::TransferAccepted {
                session_id: transfer.session_id.clone(),
                transfer_id: transfer.id.clone(),
            },
        );
        Ok(transfer)
    }

    /// # Errors
    ///
    /// Same as [`accept_transfer`](Self::accept_transfer).
    pub fn reject_transfer(
        &self,
        connection_id: ConnectionId,
        transfer_id: &str,
    ) -> RelayResult<FileTransfer> {
        let ctx = self.call_for_transfer(connection_id, transfer_id)?;
        let transfer = self.transfers.reject(transfer_id, &ctx.user_id)?;
        self.notify_participants(
            &transfer.session_id,
            &ServerEvent::TransferRejected {
                session_id: transfer.session_id.clone(),
                transfer_id: transfer.id.clone(),
            },
        );
        Ok(transfer)
    }

    /// Forwards a participant-reported progress figure to both sides.
    ///
    /// # Errors
    ///
    /// Registry failures, `TRANSFER_NOT_FOUND`, `NOT_AUTHORIZED` when the
    /// transfer belongs to another session.
    pub fn notify_progress(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        transfer_id: &str,
        progress: u8,
    ) -> RelayResult<()> {
        self.registry.resolve_call(connection_id, session_id)?;
        let transfer = self.transfer_in(session_id, transfer_id)?;
        let progress = progress.min(100);
        let bytes = transfer.file_size.saturating_mul(u64::from(progress)) / 100;
        let transfer = self.transfers.record_progress(transfer_id, bytes)?;
        self.notify_participants(
            session_id,
            &ServerEvent::TransferProgress {
                session_id: session_id.to_owned(),
                transfer_id: transfer_id.to_owned(),
                progress,
                bytes_transferred: transfer.bytes_transferred,
            },
        );
        Ok(())
    }

    /// Forwards a participant's completion notice to both sides. The record
    /// itself is settled through the control plane.
    ///
    /// # Errors
    ///
    /// Same as [`notify_progress`](Self::notify_progress).
    pub fn notify_completed(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        transfer_id: &str,
    ) -> RelayResult<()> {
        self.registry.resolve_call(connection_id, session_id)?;
        self.transfer_in(session_id, transfer_id)?;
        self.notify_participants(
            session_id,
            &ServerEvent::TransferCompleted {
                session_id: session_id.to_owned(),
                transfer_id: transfer_id.to_owned(),
            },
        );
        Ok(())
    }

    // ── Notifications ───────────────────────────────────────────────

    /// Delivers `event` to every connection currently bound to the session.
    pub fn notify_participants(&self, session_id: &str, event: &ServerEvent) -> usize {
        self.hub
            .deliver_all(&self.registry.participant_connections(session_id), event)
    }

    /// Delivers `event` to whichever connection `user_id` currently has in
    /// the session.
    pub fn notify_user(&self, session_id: &str, user_id: &str, event: ServerEvent) -> bool {
        let connection = self
            .registry
            .session(session_id)
            .ok()
            .and_then(|current| {
                current
                    .role_of(user_id)
                    .and_then(|role| current.connection_for(role))
            });
        match connection {
            Some(id) => self.hub.deliver(id, event),
            None => {
                debug!(session_id = %session_id, user = %user_id, "User not connected, event dropped");
                false
            }
        }
    }

    /// Tells the bound participants that `session` ended and forgets its key.
    pub fn session_ended(&self, session: &SessionRecord) {
        let delivered = self.hub.deliver_all(
            &session.bound_connections(),
            &ServerEvent::SessionEnded {
                session_id: session.session_id.clone(),
            },
        );
        self.keys.clear(&session.session_id);
        debug!(session_id = %session.session_id, delivered, "Session end announced");
    }

    // ── Internals ───────────────────────────────────────────────────

    fn call_with_peer(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        peer_id: &str,
    ) -> RelayResult<CallContext> {
        let ctx = self.registry.resolve_call(connection_id, session_id)?;
        if ctx.peer_user_id.as_deref() != Some(peer_id) {
            return Err(RelayError::new(
                ErrorCode::NotAuthorized,
                format!("{peer_id} is not the peer in session {session_id}"),
            ));
        }
        Ok(ctx)
    }

    fn call_for_transfer(
        &self,
        connection_id: ConnectionId,
        transfer_id: &str,
    ) -> RelayResult<CallContext> {
        let transfer = self.transfers.get(transfer_id)?;
        self.registry
            .resolve_call(connection_id, &transfer.session_id)
    }

    fn transfer_in(&self, session_id: &str, transfer_id: &str) -> RelayResult<FileTransfer> {
        let transfer = self.transfers.get(transfer_id)?;
        if transfer.session_id != session_id {
            return Err(RelayError::new(
                ErrorCode::NotAuthorized,
                format!("transfer {transfer_id} does not belong to session {session_id}"),
            ));
        }
        Ok(transfer)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use tether_core::crypto::encode_b64;
    use tether_core::protocol::{InputKind, SignalKind};

    use super::*;
    use crate::store::{MemoryStore, TransferStatus};

    struct Fixture {
        router: Router,
        store: Arc<MemoryStore>,
        session_id: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let router = Router::new(store.clone(), Duration::from_secs(60), 16);
        let session = router.registry().start("u1").unwrap();
        router.registry().join(&session.session_id, "u2").unwrap();
        Fixture {
            router,
            store,
            session_id: session.session_id,
        }
    }

    fn click() -> InputPayload {
        InputPayload {
            kind: InputKind::Mouse,
            data: json!({"x": 10, "y": 20, "button": "left"}),
        }
    }

    #[test]
    fn given_host_without_client_when_sending_input_then_client_disconnected() {
        let fx = fixture();
        let host = fx.router.open(&fx.session_id, "u1").unwrap();

        let err = fx
            .router
            .send_input(host.connection_id, &fx.session_id, click())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ClientDisconnected);
        assert!(fx.store.actions().is_empty());
    }

    #[tokio::test]
    async fn given_both_connected_when_host_sends_input_then_client_receives_and_action_is_logged() {
        let fx = fixture();
        let host = fx.router.open(&fx.session_id, "u1").unwrap();
        let mut client = fx.router.open(&fx.session_id, "u2").unwrap();
        assert_eq!(client.ack.role, Role::Client);

        // The client first learns that the host is already there.
        assert!(matches!(
            client.events.recv().await,
            Some(ServerEvent::PeerConnected { role: Role::Host, .. })
        ));

        fx.router
            .send_input(host.connection_id, &fx.session_id, click())
            .unwrap();
        let Some(ServerEvent::Input { payload, .. }) = client.events.recv().await else {
            panic!("expected input event");
        };
        assert_eq!(payload, click());
        assert_eq!(fx.store.actions().len(), 1);
        assert_eq!(fx.store.actions()[0].kind, InputKind::Mouse);
    }

    #[test]
    fn given_client_when_sending_input_then_not_host() {
        let fx = fixture();
        let _host = fx.router.open(&fx.session_id, "u1").unwrap();
        let client = fx.router.open(&fx.session_id, "u2").unwrap();
        let err = fx
            .router
            .send_input(client.connection_id, &fx.session_id, click())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotHost);
    }

    #[test]
    fn given_unbound_connection_when_sending_input_then_auth_required() {
        let fx = fixture();
        let err = fx.router.send_input(999, &fx.session_id, click()).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRequired);
    }

    #[tokio::test]
    async fn given_disconnected_peer_when_sending_ice_candidate_then_ok_and_nothing_delivered() {
        let fx = fixture();
        let host = fx.router.open(&fx.session_id, "u1").unwrap();
        let client = fx.router.open(&fx.session_id, "u2").unwrap();
        let mut client_events = client.events;
        fx.router.close(client.connection_id);

        let signal = SignalEnvelope {
            kind: SignalKind::IceCandidate,
            data: json!({"candidate": "c"}),
        };
        fx.router
            .send_signal(host.connection_id, &fx.session_id, signal)
            .unwrap();

        // The closed client sees only the initial peer notice, then the end of
        // its outbox.
        assert!(matches!(
            client_events.recv().await,
            Some(ServerEvent::PeerConnected { .. })
        ));
        assert_eq!(client_events.recv().await, None);
    }

    #[tokio::test]
    async fn given_both_connected_when_signal_sent_then_peer_receives_envelope_verbatim() {
        let fx = fixture();
        let mut host = fx.router.open(&fx.session_id, "u1").unwrap();
        let client = fx.router.open(&fx.session_id, "u2").unwrap();
        let offer = SignalEnvelope {
            kind: SignalKind::Offer,
            data: json!({"sdp": "v=0"}),
        };
        fx.router
            .send_signal(client.connection_id, &fx.session_id, offer.clone())
            .unwrap();

        assert!(matches!(
            host.events.recv().await,
            Some(ServerEvent::PeerConnected { role: Role::Client, .. })
        ));
        let Some(ServerEvent::Signal { from_user_id, signal, .. }) = host.events.recv().await else {
            panic!("expected signal");
        };
        assert_eq!(from_user_id, "u2");
        assert_eq!(signal, offer);
    }

    #[tokio::test]
    async fn given_client_closes_when_host_listening_then_peer_disconnected_and_key_cleared() {
        let fx = fixture();
        let mut host = fx.router.open(&fx.session_id, "u1").unwrap();
        let client = fx.router.open(&fx.session_id, "u2").unwrap();
        fx.router.keys().install(&fx.session_id, [1u8; 32]);

        fx.router.close(client.connection_id);

        assert!(matches!(host.events.recv().await, Some(ServerEvent::PeerConnected { .. })));
        assert!(matches!(
            host.events.recv().await,
            Some(ServerEvent::PeerDisconnected { role: Role::Client, .. })
        ));
        assert!(!fx.router.keys().contains(&fx.session_id));
    }

    #[tokio::test]
    async fn given_superseded_connection_when_it_closes_then_new_binding_and_key_survive() {
        let fx = fixture();
        let mut old = fx.router.open(&fx.session_id, "u1").unwrap();
        let new = fx.router.open(&fx.session_id, "u1").unwrap();
        fx.router.keys().install(&fx.session_id, [1u8; 32]);

        assert_eq!(old.events.recv().await, None, "old outbox must be dropped");
        fx.router.close(old.connection_id);

        let record = fx.router.registry().session(&fx.session_id).unwrap();
        assert_eq!(record.host_connection_id, Some(new.connection_id));
        assert!(fx.router.keys().contains(&fx.session_id));
    }

    #[test]
    fn given_outsider_when_opening_then_not_authorized() {
        let fx = fixture();
        let err = fx.router.open(&fx.session_id, "u9").err().unwrap();
        assert_eq!(err.code, ErrorCode::NotAuthorized);
    }

    #[tokio::test]
    async fn given_both_sides_when_exchanging_keys_then_each_can_open_the_others_messages() {
        let fx = fixture();
        let mut host = fx.router.open(&fx.session_id, "u1").unwrap();
        let mut client = fx.router.open(&fx.session_id, "u2").unwrap();
        let _ = host.events.recv().await;
        let _ = client.events.recv().await;

        fx.router
            .exchange_public_key(
                host.connection_id,
                &fx.session_id,
                "u2",
                host.ack.key_pair.public_key.clone(),
            )
            .unwrap();
        let Some(ServerEvent::PublicKeyOffered { public_key, .. }) = client.events.recv().await else {
            panic!("expected public key");
        };
        assert_eq!(public_key, host.ack.key_pair.public_key);

        fx.router
            .complete_key_exchange(
                client.connection_id,
                &fx.session_id,
                "u1",
                &client.ack.key_pair.private_key,
                &host.ack.key_pair.public_key,
            )
            .unwrap();

        let sealed = fx
            .router
            .encrypt_message(client.connection_id, &fx.session_id, &encode_b64(b"ping"))
            .unwrap();
        let opened = fx
            .router
            .decrypt_message(host.connection_id, &fx.session_id, &sealed)
            .unwrap();
        assert_eq!(crypto::decode_b64(&opened).unwrap(), b"ping");

        // The host derives the same key from its own half.
        let reference = SessionKeyStore::new();
        reference
            .derive_and_install(
                "x",
                &host.ack.key_pair.private_key,
                &client.ack.key_pair.public_key,
            )
            .unwrap();
        let sealed = crypto::decode_b64(&sealed).unwrap();
        assert_eq!(reference.decrypt("x", &sealed).unwrap(), b"ping");
    }

    #[test]
    fn given_wrong_peer_id_when_exchanging_key_then_not_authorized() {
        let fx = fixture();
        let host = fx.router.open(&fx.session_id, "u1").unwrap();
        let err = fx
            .router
            .exchange_public_key(host.connection_id, &fx.session_id, "u9", "AAAA".into())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotAuthorized);
    }

    #[test]
    fn given_no_key_when_encrypting_then_key_not_found() {
        let fx = fixture();
        let host = fx.router.open(&fx.session_id, "u1").unwrap();
        let err = fx
            .router
            .encrypt_message(host.connection_id, &fx.session_id, &encode_b64(b"x"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::KeyNotFound);
    }

    #[tokio::test]
    async fn given_tampered_ciphertext_when_decrypting_then_verification_failed() {
        let fx = fixture();
        let host = fx.router.open(&fx.session_id, "u1").unwrap();
        fx.router.keys().install(&fx.session_id, [9u8; 32]);
        let sealed = fx
            .router
            .encrypt_message(host.connection_id, &fx.session_id, &encode_b64(b"payload"))
            .unwrap();
        let mut raw = crypto::decode_b64(&sealed).unwrap();
        raw[14] ^= 0x01;
        let err = fx
            .router
            .decrypt_message(host.connection_id, &fx.session_id, &encode_b64(&raw))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CryptoVerificationFailed);
    }

    #[test]
    fn given_bound_connection_when_reporting_error_then_persisted_not_routed() {
        let fx = fixture();
        let host = fx.router.open(&fx.session_id, "u1").unwrap();
        fx.router
            .report_error(host.connection_id, json!({"message": "decoder crashed"}))
            .unwrap();
        let errors = fx.store.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].role, Role::Host);
        assert_eq!(
            fx.router.report_error(404, json!({})).unwrap_err().code,
            ErrorCode::AuthRequired
        );
    }

    #[tokio::test]
    async fn given_pending_transfer_when_receiver_accepts_then_both_are_notified() {
        let fx = fixture();
        let mut host = fx.router.open(&fx.session_id, "u1").unwrap();
        let mut client = fx.router.open(&fx.session_id, "u2").unwrap();
        let _ = host.events.recv().await;
        let _ = client.events.recv().await;

        let session = fx.router.registry().session(&fx.session_id).unwrap();
        let t = fx.router.transfers().create(&session, "u1", "a.bin", 10).unwrap();

        assert_eq!(
            fx.router.accept_transfer(host.connection_id, &t.id).unwrap_err().code,
            ErrorCode::NotAuthorized
        );
        let accepted = fx.router.accept_transfer(client.connection_id, &t.id).unwrap();
        assert_eq!(accepted.status, TransferStatus::Accepted);

        for rx in [&mut host.events, &mut client.events] {
            assert!(matches!(
                rx.recv().await,
                Some(ServerEvent::TransferAccepted { .. })
            ));
        }
    }

    #[tokio::test]
    async fn given_transfer_when_progress_notified_then_both_sides_receive_it() {
        let fx = fixture();
        let mut host = fx.router.open(&fx.session_id, "u1").unwrap();
        let client = fx.router.open(&fx.session_id, "u2").unwrap();
        let _ = host.events.recv().await;
        let session = fx.router.registry().session(&fx.session_id).unwrap();
        let t = fx.router.transfers().create(&session, "u1", "a.bin", 200).unwrap();

        fx.router
            .notify_progress(client.connection_id, &fx.session_id, &t.id, 150)
            .unwrap();
        let Some(ServerEvent::TransferProgress { progress, bytes_transferred, .. }) =
            host.events.recv().await
        else {
            panic!("expected progress");
        };
        assert_eq!(progress, 100);
        assert_eq!(bytes_transferred, 200);
    }
}
