//! TCP file-transfer rendezvous.
//!
//! ```text
//! sender                        relay                          receiver
//!   │ initiate_tcp_transfer ──▶ bind :0 (A), Pending
//!   │ ◀──────────── port A      TransferRequested ─────────────▶ │
//!   │ connect A ──────────────▶ accept
//!   │                           ReceiverConnectRequested ──────▶ │
//!   │                           bind :0 (B), Accepted ◀── connect_to_receiver
//!   │                           port B ─────────────────────────▶ │
//!   │                           accept ◀──────────────────── connect B
//!   │ bytes ──────────────────▶ pump ──────────────────────────▶ │
//!   │ ◀──── TransferProgress 0..100, TransferCompleted ────────▶ │
//! ```
//!
//! One [`CancellationToken`] governs each rendezvous; the slot, both
//! listeners and both sockets are released on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::error::{ErrorCode, RelayError, RelayResult};
use tether_core::listener::{Connection, Listener, ListenerFactory};
use tether_core::protocol::ServerEvent;

use crate::engine::EngineEvent;
use crate::router::Router;
use crate::store::{FileTransfer, TransferStatus};

/// Where and how rendezvous listeners are bound.
#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    pub host: String,
    /// Bound on each accept and on the wait for the receiver's listener.
    pub accept_timeout: Duration,
    pub chunk_size: usize,
    pub bind_attempts: u32,
}

/// A port handed back to one side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGrant {
    pub transfer_id: String,
    pub port: u16,
}

struct Slot<L> {
    transfer_id: String,
    receiver_tx: Option<oneshot::Sender<L>>,
    receiver_port: Option<u16>,
}

type Slots<L> = Arc<Mutex<HashMap<String, Slot<L>>>>;

pub struct Rendezvous<F: ListenerFactory> {
    factory: Arc<F>,
    router: Arc<Router>,
    config: RendezvousConfig,
    slots: Slots<F::L>,
    events: broadcast::Sender<EngineEvent>,
    /// Parent of every rendezvous token.
    shutdown: CancellationToken,
}

impl<F: ListenerFactory> Rendezvous<F> {
    pub fn new(
        factory: Arc<F>,
        router: Arc<Router>,
        config: RendezvousConfig,
        events: broadcast::Sender<EngineEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            factory,
            router,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
            events,
            shutdown,
        }
    }

    /// Creates a `Pending` transfer, binds the sender's listener and starts
    /// the relay task. The receiver is told about the offer.
    ///
    /// # Errors
    ///
    /// Registry failures, `TRANSFER_IN_PROGRESS` while the session already
    /// has a rendezvous, `NETWORK_ERROR` if no port could be bound.
    pub async fn initiate_tcp(
        &self,
        session_id: &str,
        user_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> RelayResult<PortGrant> {
        let session = self.router.registry().authorize(session_id, user_id)?;
        if self.is_active(session_id) {
            return Err(in_progress(session_id));
        }
        let transfer = self
            .router
            .transfers()
            .create(&session, user_id, file_name, file_size)?;

        let listener = match self.bind_ephemeral().await {
            Ok(listener) => listener,
            Err(e) => {
                let reason = format!("{e:#}");
                self.abandon(&transfer, &reason);
                return Err(RelayError::new(ErrorCode::NetworkError, reason));
            }
        };
        let port = listener.local_port();

        let (receiver_tx, receiver_rx) = oneshot::channel();
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(session_id) {
                drop(slots);
                self.abandon(&transfer, "another transfer claimed the session");
                return Err(in_progress(session_id));
            }
            slots.insert(
                session_id.to_owned(),
                Slot {
                    transfer_id: transfer.id.clone(),
                    receiver_tx: Some(receiver_tx),
                    receiver_port: None,
                },
            );
        }

        let token = self.shutdown.child_token();
        self.router
            .transfers()
            .register_token(&transfer.id, session_id, token.clone());

        self.router.notify_user(
            session_id,
            &transfer.receiver_user_id,
            ServerEvent::TransferRequested {
                session_id: session_id.to_owned(),
                transfer_id: transfer.id.clone(),
                sender_user_id: transfer.sender_user_id.clone(),
                file_name: transfer.file_name.clone(),
                file_size,
            },
        );

        info!(session_id = %session_id, transfer_id = %transfer.id, port, "Rendezvous opened for sender");

        let task = RelayTask {
            router: Arc::clone(&self.router),
            slots: Arc::clone(&self.slots),
            events: self.events.clone(),
            accept_timeout: self.config.accept_timeout,
            chunk_size: self.config.chunk_size,
            transfer: transfer.clone(),
            token,
        };
        tokio::spawn(task.run(listener, receiver_rx));

        Ok(PortGrant {
            transfer_id: transfer.id,
            port,
        })
    }

    /// Accepts the session's pending transfer on behalf of its receiver and
    /// binds the receiver's listener. Repeated calls return the same port.
    ///
    /// # Errors
    ///
    /// Registry failures, `TRANSFER_NOT_FOUND` without a live rendezvous,
    /// `NOT_AUTHORIZED` for the sender, `INVALID_TRANSFER_STATE` for a
    /// settled transfer, `NETWORK_ERROR` if no port could be bound.
    pub async fn connect_to_receiver(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> RelayResult<PortGrant> {
        self.router.registry().authorize(session_id, user_id)?;

        let (transfer_id, granted) = {
            let slots = self.slots.lock();
            let slot = slots.get(session_id).ok_or_else(|| no_rendezvous(session_id))?;
            (slot.transfer_id.clone(), slot.receiver_port)
        };

        let transfer = self.router.transfers().get(&transfer_id)?;
        if transfer.receiver_user_id != user_id {
            return Err(RelayError::new(
                ErrorCode::NotAuthorized,
                format!("only the receiver may connect to transfer {transfer_id}"),
            ));
        }
        if let Some(port) = granted {
            return Ok(PortGrant { transfer_id, port });
        }

        match transfer.status {
            TransferStatus::Pending => {
                let accepted = self.router.transfers().accept(&transfer_id, user_id)?;
                self.router.notify_participants(
                    session_id,
                    &ServerEvent::TransferAccepted {
                        session_id: session_id.to_owned(),
                        transfer_id: accepted.id,
                    },
                );
            }
            TransferStatus::Accepted => {}
            status => {
                return Err(RelayError::new(
                    ErrorCode::InvalidTransferState,
                    format!("transfer {transfer_id} is {status:?}"),
                ));
            }
        }

        let listener = match self.bind_ephemeral().await {
            Ok(listener) => listener,
            Err(e) => {
                let reason = format!("{e:#}");
                self.fail_rendezvous(session_id, &transfer_id, &reason);
                return Err(RelayError::new(ErrorCode::NetworkError, reason));
            }
        };
        let port = listener.local_port();

        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(session_id)
            .filter(|slot| slot.transfer_id == transfer_id)
            .ok_or_else(|| no_rendezvous(session_id))?;
        if let Some(port) = slot.receiver_port {
            return Ok(PortGrant { transfer_id, port });
        }
        let tx = slot.receiver_tx.take().ok_or_else(|| no_rendezvous(session_id))?;
        if tx.send(listener).is_err() {
            return Err(no_rendezvous(session_id));
        }
        slot.receiver_port = Some(port);

        info!(session_id = %session_id, transfer_id = %transfer_id, port, "Rendezvous opened for receiver");
        Ok(PortGrant { transfer_id, port })
    }

    /// Whether `session_id` currently has a rendezvous.
    #[must_use]
    pub fn is_active(&self, session_id: &str) -> bool {
        self.slots.lock().contains_key(session_id)
    }

    async fn bind_ephemeral(&self) -> anyhow::Result<F::L> {
        let addr = format!("{}:0", self.config.host);
        let attempts = self.config.bind_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.factory.bind(&addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Rendezvous bind failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no bind attempt was made")))
    }

    /// Fails an announced transfer, tells both sides, and stops its relay
    /// task.
    fn fail_rendezvous(&self, session_id: &str, transfer_id: &str, reason: &str) {
        match self.router.transfers().fail(transfer_id, reason) {
            Ok(_) => {
                self.router.notify_participants(
                    session_id,
                    &ServerEvent::TransferFailed {
                        session_id: session_id.to_owned(),
                        transfer_id: transfer_id.to_owned(),
                        reason: reason.to_owned(),
                    },
                );
            }
            Err(e) => debug!(transfer_id = %transfer_id, error = %e, "Transfer already settled"),
        }
        self.router.transfers().cancel(transfer_id);
    }

    fn abandon(&self, transfer: &FileTransfer, reason: &str) {
        if let Err(e) = self.router.transfers().fail(&transfer.id, reason) {
            debug!(transfer_id = %transfer.id, error = %e, "Could not fail abandoned transfer");
        }
    }
}

// ── Relay task ──────────────────────────────────────────────────────

struct RelayTask<L> {
    router: Arc<Router>,
    slots: Slots<L>,
    events: broadcast::Sender<EngineEvent>,
    accept_timeout: Duration,
    chunk_size: usize,
    transfer: FileTransfer,
    token: CancellationToken,
}

impl<L: Listener> RelayTask<L> {
    async fn run(self, sender_listener: L, receiver_rx: oneshot::Receiver<L>) {
        let _guard = SlotGuard {
            router: Arc::clone(&self.router),
            slots: Arc::clone(&self.slots),
            session_id: self.transfer.session_id.clone(),
            transfer_id: self.transfer.id.clone(),
            token: self.token.clone(),
        };

        let outcome = tokio::select! {
            biased;
            () = self.token.cancelled() => Err(anyhow!("cancelled")),
            result = self.relay(sender_listener, receiver_rx) => result,
        };
        self.settle(outcome);
    }

    async fn relay(&self, mut sender_listener: L, receiver_rx: oneshot::Receiver<L>) -> anyhow::Result<u64> {
        let t = &self.transfer;

        let mut sender = timeout(self.accept_timeout, sender_listener.accept())
            .await
            .context("timed out waiting for the sender")??;
        drop(sender_listener);
        info!(transfer_id = %t.id, peer = %sender.peer(), "Sender connected");

        self.router.notify_user(
            &t.session_id,
            &t.receiver_user_id,
            ServerEvent::ReceiverConnectRequested {
                session_id: t.session_id.clone(),
                transfer_id: t.id.clone(),
            },
        );

        let mut receiver_listener = timeout(self.accept_timeout, receiver_rx)
            .await
            .context("timed out waiting for the receiver to connect")?
            .context("rendezvous closed before the receiver connected")?;
        let mut receiver = timeout(self.accept_timeout, receiver_listener.accept())
            .await
            .context("timed out waiting for the receiver")??;
        drop(receiver_listener);
        info!(transfer_id = %t.id, peer = %receiver.peer(), "Receiver connected");

        self.router.transfers().mark_transferring(&t.id)?;
        let mut reported = progress_percent(0, t.file_size);
        self.push_progress(0);

        // One event per whole percent, at most 101 per transfer.
        let total = pump(&mut sender, &mut receiver, t.file_size, self.chunk_size, |total| {
            if let Err(e) = self.router.transfers().record_progress(&t.id, total) {
                debug!(transfer_id = %t.id, error = %e, "Failed to record progress");
            }
            let percent = progress_percent(total, t.file_size);
            if percent != reported {
                reported = percent;
                self.push_progress(total);
            }
        })
        .await?;

        if total < t.file_size {
            bail!("incomplete: sender closed after {total} of {} bytes", t.file_size);
        }
        if let Err(e) = receiver.shutdown().await {
            debug!(transfer_id = %t.id, error = %e, "Receiver shutdown failed");
        }
        Ok(total)
    }

    fn push_progress(&self, total: u64) {
        let t = &self.transfer;
        self.router.notify_participants(
            &t.session_id,
            &ServerEvent::TransferProgress {
                session_id: t.session_id.clone(),
                transfer_id: t.id.clone(),
                progress: progress_percent(total, t.file_size),
                bytes_transferred: total,
            },
        );
    }

    fn settle(&self, outcome: anyhow::Result<u64>) {
        let t = &self.transfer;
        let transfers = self.router.transfers();

        let (event, status, bytes) = match outcome {
            Ok(total) => match transfers.finish(&t.id, total) {
                Ok(done) => (
                    Some(ServerEvent::TransferCompleted {
                        session_id: t.session_id.clone(),
                        transfer_id: t.id.clone(),
                    }),
                    done.status,
                    done.bytes_transferred,
                ),
                Err(e) => {
                    debug!(transfer_id = %t.id, error = %e, "Transfer already settled");
                    (None, current_status(&self.router, t), total)
                }
            },
            Err(e) => {
                let reason = format!("{e:#}");
                match transfers.fail(&t.id, &reason) {
                    Ok(failed) => (
                        Some(ServerEvent::TransferFailed {
                            session_id: t.session_id.clone(),
                            transfer_id: t.id.clone(),
                            reason,
                        }),
                        failed.status,
                        failed.bytes_transferred,
                    ),
                    Err(_) => {
                        debug!(transfer_id = %t.id, reason = %reason, "Rendezvous ended on a settled transfer");
                        let status = current_status(&self.router, t);
                        (None, status, 0)
                    }
                }
            }
        };

        if let Some(event) = event {
            self.router.notify_participants(&t.session_id, &event);
        }
        info!(transfer_id = %t.id, ?status, bytes, "Rendezvous finished");
        let _ = self.events.send(EngineEvent::TransferFinished {
            session_id: t.session_id.clone(),
            transfer_id: t.id.clone(),
            status,
            bytes,
        });
    }
}

fn current_status(router: &Router, transfer: &FileTransfer) -> TransferStatus {
    router
        .transfers()
        .get(&transfer.id)
        .map_or(transfer.status, |t| t.status)
}

/// Frees the session's slot and cancels the token however the task ends.
struct SlotGuard<L> {
    router: Arc<Router>,
    slots: Slots<L>,
    session_id: String,
    transfer_id: String,
    token: CancellationToken,
}

impl<L> Drop for SlotGuard<L> {
    fn drop(&mut self) {
        {
            let mut slots = self.slots.lock();
            if slots
                .get(&self.session_id)
                .is_some_and(|slot| slot.transfer_id == self.transfer_id)
            {
                slots.remove(&self.session_id);
            }
        }
        self.token.cancel();
        self.router.transfers().release_token(&self.transfer_id);
        debug!(session_id = %self.session_id, transfer_id = %self.transfer_id, "Rendezvous slot released");
    }
}

// ── Data plane ──────────────────────────────────────────────────────

/// Copies at most `file_size` bytes from `src` to `dst` in chunks of up to
/// `chunk_size`, calling `on_chunk` with the running total after each one.
///
/// Returns the total forwarded, which is short of `file_size` only when
/// `src` reached EOF early.
///
/// # Errors
///
/// Returns an error if either side fails.
pub async fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    file_size: u64,
    chunk_size: usize,
    mut on_chunk: impl FnMut(u64) + Send,
) -> anyhow::Result<u64>
where
    R: Connection,
    W: Connection,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total: u64 = 0;

    while total < file_size {
        let remaining = file_size - total;
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = src
            .read(&mut buf[..want])
            .await
            .context("failed to read from sender")?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .await
            .context("failed to write to receiver")?;
        total += n as u64;
        on_chunk(total);
    }
    Ok(total)
}

/// `floor(total * 100 / file_size)`, with an empty file counting as done.
#[must_use]
pub fn progress_percent(total: u64, file_size: u64) -> u8 {
    if file_size == 0 {
        return 100;
    }
    u8::try_from(u128::from(total) * 100 / u128::from(file_size)).map_or(100, |p| p.min(100))
}

fn in_progress(session_id: &str) -> RelayError {
    RelayError::new(
        ErrorCode::TransferInProgress,
        format!("session {session_id} already has a transfer in progress"),
    )
}

fn no_rendezvous(session_id: &str) -> RelayError {
    RelayError::new(
        ErrorCode::TransferNotFound,
        format!("session {session_id} has no pending transfer"),
    )
}
