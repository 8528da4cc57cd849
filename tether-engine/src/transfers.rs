//! File-transfer records and their state machine.
//!
//! ```text
//! Pending ──accept──▶ Accepted ──relay──▶ Transferring ──▶ Completed
//!    │                   │                     │
//!    └──reject──▶ Rejected                     └──────────▶ Failed
//!    └───────────── teardown ──────────────────────────────▶ Failed
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_core::error::{ErrorCode, RelayError, RelayResult};

use crate::store::{FileTransfer, SessionRecord, SessionStore, TransferStatus};

struct Registration {
    session_id: String,
    token: CancellationToken,
}

pub struct TransferBook {
    store: Arc<dyn SessionStore>,
    transfers: RwLock<HashMap<String, Arc<Mutex<FileTransfer>>>>,
    /// transfer id → the token governing its rendezvous.
    tokens: Mutex<HashMap<String, Registration>>,
}

impl TransferBook {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            transfers: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a `Pending` transfer from `sender_user_id` to the other
    /// participant of `session`.
    ///
    /// # Errors
    ///
    /// `NOT_AUTHORIZED` for a non-participant sender, `CLIENT_DISCONNECTED`
    /// when the session has no client to receive.
    pub fn create(
        &self,
        session: &SessionRecord,
        sender_user_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> RelayResult<FileTransfer> {
        let role = session
            .role_of(sender_user_id)
            .ok_or_else(|| RelayError::not_authorized(&session.session_id))?;
        let Some(receiver) = session.user_for(role.peer()) else {
            return Err(RelayError::new(
                ErrorCode::ClientDisconnected,
                format!("session {} has no client to receive", session.session_id),
            ));
        };

        let transfer = FileTransfer {
            id: Uuid::new_v4().to_string(),
            session_id: session.session_id.clone(),
            sender_user_id: sender_user_id.to_owned(),
            receiver_user_id: receiver.to_owned(),
            file_name: file_name.to_owned(),
            file_size,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.store
            .insert_transfer(&transfer)
            .map_err(RelayError::internal)?;
        self.transfers.write().insert(transfer.id.clone(), Arc::new(Mutex::new(transfer.clone())));

        info!(
            transfer_id = %transfer.id,
            session_id = %transfer.session_id,
            file = %transfer.file_name,
            size = transfer.file_size,
            "Transfer created"
        );
        Ok(transfer)
    }

    /// # Errors
    ///
    /// `TRANSFER_NOT_FOUND`, `NOT_AUTHORIZED` for anyone but the receiver,
    /// `INVALID_TRANSFER_STATE` unless `Pending`.
    pub fn accept(&self, transfer_id: &str, user_id: &str) -> RelayResult<FileTransfer> {
        self.update(transfer_id, |t| {
            ensure_receiver(t, user_id)?;
            t.advance(TransferStatus::Accepted)
        })
    }

    /// Rejects a pending transfer and tears down its rendezvous, if any.
    ///
    /// # Errors
    ///
    /// Same as [`accept`](Self::accept).
    pub fn reject(&self, transfer_id: &str, user_id: &str) -> RelayResult<FileTransfer> {
        let transfer = self.update(transfer_id, |t| {
            ensure_receiver(t, user_id)?;
            t.advance(TransferStatus::Rejected)
        })?;
        self.cancel(transfer_id);
        Ok(transfer)
    }

    /// # Errors
    ///
    /// `INVALID_TRANSFER_STATE` unless `Accepted`.
    pub fn mark_transferring(&self, transfer_id: &str) -> RelayResult<FileTransfer> {
        self.update(transfer_id, |t| t.advance(TransferStatus::Transferring))
    }

    /// Records relay progress. Counts never go backwards.
    ///
    /// # Errors
    ///
    /// `TRANSFER_NOT_FOUND`.
    pub fn record_progress(&self, transfer_id: &str, bytes: u64) -> RelayResult<FileTransfer> {
        self.update(transfer_id, |t| {
            t.bytes_transferred = t.bytes_transferred.max(bytes);
            Ok(())
        })
    }

    /// # Errors
    ///
    /// `INVALID_TRANSFER_STATE` unless `Transferring`.
    pub fn finish(&self, transfer_id: &str, bytes: u64) -> RelayResult<FileTransfer> {
        self.update(transfer_id, |t| {
            t.bytes_transferred = t.bytes_transferred.max(bytes);
            t.advance(TransferStatus::Completed)
        })
    }

    /// # Errors
    ///
    /// `INVALID_TRANSFER_STATE` if the transfer is already terminal.
    pub fn fail(&self, transfer_id: &str, reason: &str) -> RelayResult<FileTransfer> {
        let transfer = self.update(transfer_id, |t| {
            t.advance(TransferStatus::Failed)?;
            t.error_message = Some(reason.to_owned());
            Ok(())
        })?;
        warn!(transfer_id = %transfer_id, reason = %reason, "Transfer failed");
        Ok(transfer)
    }

    /// Verifies the byte count a participant reports at the end of a
    /// transfer and settles the record.
    ///
    /// An `Accepted` transfer is moved through `Transferring` first. A
    /// matching report on an already `Completed` transfer is a no-op.
    ///
    /// # Errors
    ///
    /// `NOT_AUTHORIZED` for a non-participant, `TRANSFER_SIZE_MISMATCH`
    /// (after marking the transfer `Failed`) when `bytes_received` differs
    /// from the announced size, `INVALID_TRANSFER_STATE` otherwise.
    pub fn complete(
        &self,
        transfer_id: &str,
        user_id: &str,
        bytes_received: u64,
    ) -> RelayResult<FileTransfer> {
        let cell = self.cell(transfer_id)?;
        let mut current = cell.lock();
        if current.sender_user_id != user_id && current.receiver_user_id != user_id {
            return Err(RelayError::new(
                ErrorCode::NotAuthorized,
                format!("caller does not take part in transfer {transfer_id}"),
            ));
        }

        let matches = bytes_received == current.file_size;
        match current.status {
            TransferStatus::Completed if matches => return Ok(current.clone()),
            TransferStatus::Completed => return Err(size_mismatch(&current, bytes_received)),
            TransferStatus::Accepted | TransferStatus::Transferring => {}
            status => {
                return Err(RelayError::new(
                    ErrorCode::InvalidTransferState,
                    format!("transfer {transfer_id} cannot complete from {status:?}"),
                ));
            }
        }

        let mut next = current.clone();
        if next.status == TransferStatus::Accepted {
            next.advance(TransferStatus::Transferring)?;
        }
        next.bytes_transferred = next.bytes_transferred.max(bytes_received);
        let outcome = if matches {
            next.advance(TransferStatus::Completed)?;
            Ok(())
        } else {
            let err = size_mismatch(&next, bytes_received);
            next.advance(TransferStatus::Failed)?;
            next.error_message = Some(err.message.clone());
            Err(err)
        };

        self.store
            .update_transfer(&next)
            .map_err(RelayError::internal)?;
        *current = next.clone();
        drop(current);
        if outcome.is_err() {
            self.cancel(transfer_id);
        }

        info!(transfer_id = %transfer_id, bytes_received, status = ?next.status, "Transfer settled");
        outcome.map(|()| next)
    }

    /// # Errors
    ///
    /// `TRANSFER_NOT_FOUND`.
    pub fn get(&self, transfer_id: &str) -> RelayResult<FileTransfer> {
        Ok(self.cell(transfer_id)?.lock().clone())
    }

    // ── Cancellation ────────────────────────────────────────────────

    pub fn register_token(&self, transfer_id: &str, session_id: &str, token: CancellationToken) {
        self.tokens.lock().insert(
            transfer_id.to_owned(),
            Registration {
                session_id: session_id.to_owned(),
                token,
            },
        );
    }

    pub fn release_token(&self, transfer_id: &str) {
        self.tokens.lock().remove(transfer_id);
    }

    /// Cancels the rendezvous of one transfer. Returns whether one was live.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        let registration = self.tokens.lock().remove(transfer_id);
        registration.is_some_and(|r| {
            debug!(transfer_id = %transfer_id, "Cancelling rendezvous");
            r.token.cancel();
            true
        })
    }

    /// Cancels every rendezvous of `session_id`. Returns how many were live.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let mut tokens = self.tokens.lock();
        let doomed: Vec<String> = tokens
            .iter()
            .filter(|(_, r)| r.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(r) = tokens.remove(id) {
                r.token.cancel();
            }
        }
        if !doomed.is_empty() {
            info!(session_id = %session_id, count = doomed.len(), "Cancelled session rendezvous");
        }
        doomed.len()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn cell(&self, transfer_id: &str) -> RelayResult<Arc<Mutex<FileTransfer>>> {
        if let Some(cell) = self.transfers.read().get(transfer_id) {
            return Ok(Arc::clone(cell));
        }
        let transfer = self
            .store
            .get_transfer(transfer_id)
            .map_err(RelayError::internal)?
            .ok_or_else(|| RelayError::transfer_not_found(transfer_id))?;
        Ok(Arc::clone(
            self.transfers
                .write()
                .entry(transfer_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(transfer))),
        ))
    }

    fn update(
        &self,
        transfer_id: &str,
        apply: impl FnOnce(&mut FileTransfer) -> RelayResult<()>,
    ) -> RelayResult<FileTransfer> {
        let cell = self.cell(transfer_id)?;
        let mut current = cell.lock();
        let mut next = current.clone();
        apply(&mut next)?;
        self.store
            .update_transfer(&next)
            .map_err(RelayError::internal)?;
        *current = next.clone();
        Ok(next)
    }
}

fn ensure_receiver(transfer: &FileTransfer, user_id: &str) -> RelayResult<()> {
    if transfer.receiver_user_id == user_id {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::NotAuthorized,
            format!("only the receiver may answer transfer {}", transfer.id),
        ))
    }
}

fn size_mismatch(transfer: &FileTransfer, bytes_received: u64) -> RelayError {
    RelayError::new(
        ErrorCode::TransferSizeMismatch,
        format!(
            "transfer {} received {bytes_received} of {} bytes",
            transfer.id, transfer.file_size
        ),
    )
}
