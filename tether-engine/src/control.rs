//! Request/response calls that do not need a bound signaling channel.

use std::sync::Arc;

use tracing::{debug, info};

use tether_core::error::{ErrorCode, RelayError, RelayResult};
use tether_core::listener::ListenerFactory;
use tether_core::protocol::ServerEvent;

use crate::rendezvous::{PortGrant, Rendezvous};
use crate::router::Router;
use crate::store::{FileTransfer, SessionRecord};

pub struct ControlPlane<F: ListenerFactory> {
    router: Arc<Router>,
    rendezvous: Rendezvous<F>,
}

impl<F: ListenerFactory> ControlPlane<F> {
    pub fn new(router: Arc<Router>, rendezvous: Rendezvous<F>) -> Self {
        Self { router, rendezvous }
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// # Errors
    ///
    /// `ALREADY_HAS_ACTIVE_SESSION`.
    pub fn start_session(&self, user_id: &str) -> RelayResult<SessionRecord> {
        self.router.registry().start(user_id)
    }

    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`, `SESSION_INACTIVE`, `SESSION_FULL`,
    /// `ALREADY_HAS_ACTIVE_SESSION`.
    pub fn join_session(&self, session_id: &str, user_id: &str) -> RelayResult<SessionRecord> {
        self.router.registry().join(session_id, user_id)
    }

    /// Ends the session, tears down its rendezvous and tells whoever is
    /// still bound.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`, `NOT_AUTHORIZED`, `SESSION_INACTIVE`.
    pub fn stop_session(&self, session_id: &str, user_id: &str) -> RelayResult<SessionRecord> {
        let session = self.router.registry().stop(session_id, user_id)?;
        let cancelled = self.router.transfers().cancel_session(session_id);
        self.router.session_ended(&session);
        debug!(session_id = %session_id, cancelled, "Session teardown done");
        Ok(session)
    }

    /// # Errors
    ///
    /// `INTERNAL` if the store cannot be read.
    pub fn active_sessions(&self, user_id: &str) -> RelayResult<Vec<SessionRecord>> {
        self.router.registry().active_sessions(user_id)
    }

    /// # Errors
    ///
    /// See [`Rendezvous::initiate_tcp`].
    pub async fn initiate_tcp_transfer(
        &self,
        session_id: &str,
        user_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> RelayResult<PortGrant> {
        self.rendezvous
            .initiate_tcp(session_id, user_id, file_name, file_size)
            .await
    }

    /// # Errors
    ///
    /// See [`Rendezvous::connect_to_receiver`].
    pub async fn connect_to_receiver(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> RelayResult<PortGrant> {
        self.rendezvous.connect_to_receiver(session_id, user_id).await
    }

    /// Settles a transfer from the byte count its receiver reports.
    ///
    /// Participants hear `TransferCompleted` the first time the transfer
    /// completes, or `TransferFailed` on a size mismatch.
    ///
    /// # Errors
    ///
    /// `TRANSFER_NOT_FOUND`, `NOT_AUTHORIZED`, `TRANSFER_SIZE_MISMATCH`,
    /// `INVALID_TRANSFER_STATE`.
    pub fn complete_transfer(
        &self,
        transfer_id: &str,
        user_id: &str,
        bytes_received: u64,
    ) -> RelayResult<FileTransfer> {
        let transfers = self.router.transfers();
        let before = transfers.get(transfer_id)?;
        match transfers.complete(transfer_id, user_id, bytes_received) {
            Ok(transfer) => {
                if transfer.status != before.status {
                    self.router.notify_participants(
                        &transfer.session_id,
                        &ServerEvent::TransferCompleted {
                            session_id: transfer.session_id.clone(),
                            transfer_id: transfer.id.clone(),
                        },
                    );
                }
                Ok(transfer)
            }
            Err(e) if e.code == ErrorCode::TransferSizeMismatch && !before.status.is_terminal() => {
                info!(transfer_id = %transfer_id, bytes_received, "Transfer rejected on size check");
                self.router.notify_participants(
                    &before.session_id,
                    &ServerEvent::TransferFailed {
                        session_id: before.session_id.clone(),
                        transfer_id: transfer_id.to_owned(),
                        reason: e.message.clone(),
                    },
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Looks a transfer up on behalf of one of its participants.
    ///
    /// # Errors
    ///
    /// `TRANSFER_NOT_FOUND`, `NOT_AUTHORIZED`.
    pub fn transfer(&self, transfer_id: &str, user_id: &str) -> RelayResult<FileTransfer> {
        let transfer = self.router.transfers().get(transfer_id)?;
        if transfer.sender_user_id != user_id && transfer.receiver_user_id != user_id {
            return Err(RelayError::new(
                ErrorCode::NotAuthorized,
                format!("caller does not take part in transfer {transfer_id}"),
            ));
        }
        Ok(transfer)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::{broadcast, mpsc};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::rendezvous::RendezvousConfig;
    use crate::router::OpenedChannel;
    use crate::store::{MemoryStore, TransferStatus};
    use crate::tcp::TcpListenerFactory;

    fn control() -> ControlPlane<TcpListenerFactory> {
        let router = Arc::new(Router::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            64,
        ));
        let (events, _) = broadcast::channel(16);
        let rendezvous = Rendezvous::new(
            Arc::new(TcpListenerFactory),
            Arc::clone(&router),
            RendezvousConfig {
                host: "127.0.0.1".into(),
                accept_timeout: Duration::from_secs(5),
                chunk_size: 8192,
                bind_attempts: 3,
            },
            events,
            CancellationToken::new(),
        );
        ControlPlane::new(router, rendezvous)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn joined(control: &ControlPlane<TcpListenerFactory>) -> (String, OpenedChannel, OpenedChannel) {
        let session = control.start_session("u1").unwrap();
        control.join_session(&session.session_id, "u2").unwrap();
        let host = control.router().open(&session.session_id, "u1").unwrap();
        let client = control.router().open(&session.session_id, "u2").unwrap();
        (session.session_id, host, client)
    }

    #[test]
    fn given_active_session_when_host_starts_again_then_already_has_active_session() {
        let control = control();
        control.start_session("u1").unwrap();
        let err = control.start_session("u1").unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyHasActiveSession);
    }

    #[test]
    fn given_bound_participants_when_session_stopped_then_both_hear_session_ended() {
        let control = control();
        let (sid, mut host, mut client) = joined(&control);
        drain(&mut host.events);
        drain(&mut client.events);

        let stopped = control.stop_session(&sid, "u2").unwrap();
        assert!(!stopped.is_active());

        for rx in [&mut host.events, &mut client.events] {
            assert!(
                drain(rx)
                    .iter()
                    .any(|ev| matches!(ev, ServerEvent::SessionEnded { session_id } if *session_id == sid))
            );
        }
        assert!(control.active_sessions("u1").unwrap().is_empty());
    }

    #[test]
    fn given_stopped_session_when_stopped_again_then_session_inactive() {
        let control = control();
        let session = control.start_session("u1").unwrap();
        control.stop_session(&session.session_id, "u1").unwrap();
        let err = control.stop_session(&session.session_id, "u1").unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionInactive);
    }

    #[test]
    fn given_stranger_when_stopping_session_then_not_authorized() {
        let control = control();
        let session = control.start_session("u1").unwrap();
        let err = control.stop_session(&session.session_id, "u9").unwrap_err();
        assert_eq!(err.code, ErrorCode::NotAuthorized);
    }

    #[tokio::test]
    async fn given_accepted_transfer_when_completed_with_full_size_then_participants_hear_completion_once() {
        let control = control();
        let (sid, mut host, mut client) = joined(&control);
        let transfer = control
            .router()
            .transfers()
            .create(&control.router().registry().session(&sid).unwrap(), "u1", "a.bin", 10)
            .unwrap();
        control.router().transfers().accept(&transfer.id, "u2").unwrap();
        drain(&mut host.events);
        drain(&mut client.events);

        let done = control.complete_transfer(&transfer.id, "u2", 10).unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        let again = control.complete_transfer(&transfer.id, "u2", 10).unwrap();
        assert_eq!(again.status, TransferStatus::Completed);

        let completions = drain(&mut host.events)
            .into_iter()
            .filter(|ev| matches!(ev, ServerEvent::TransferCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn given_accepted_transfer_when_completed_short_then_size_mismatch_and_failed() {
        let control = control();
        let (sid, _host, mut client) = joined(&control);
        let session = control.router().registry().session(&sid).unwrap();
        let transfer = control
            .router()
            .transfers()
            .create(&session, "u1", "a.bin", 10)
            .unwrap();
        control.router().transfers().accept(&transfer.id, "u2").unwrap();
        drain(&mut client.events);

        let err = control.complete_transfer(&transfer.id, "u2", 7).unwrap_err();
        assert_eq!(err.code, ErrorCode::TransferSizeMismatch);
        assert_eq!(
            control.transfer(&transfer.id, "u1").unwrap().status,
            TransferStatus::Failed
        );
        assert!(
            drain(&mut client.events)
                .iter()
                .any(|ev| matches!(ev, ServerEvent::TransferFailed { .. }))
        );
    }

    #[test]
    fn given_stranger_when_looking_up_transfer_then_not_authorized() {
        let control = control();
        let (sid, _host, _client) = joined(&control);
        let session = control.router().registry().session(&sid).unwrap();
        let transfer = control
            .router()
            .transfers()
            .create(&session, "u1", "a.bin", 10)
            .unwrap();

        let err = control.transfer(&transfer.id, "u9").unwrap_err();
        assert_eq!(err.code, ErrorCode::NotAuthorized);
        assert!(control.transfer("missing", "u1").is_err());
    }
}
