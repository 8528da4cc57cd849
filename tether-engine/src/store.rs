//! Durable records and the narrow store interface the relay writes through.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::error::{ErrorCode, RelayError, RelayResult};
use tether_core::protocol::{ConnectionId, InputKind, Role};


// ── Sessions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// A host/client pairing under one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub host_user_id: String,
    pub client_user_id: Option<String>,
    pub status: SessionStatus,
    pub host_connection_id: Option<ConnectionId>,
    pub client_connection_id: Option<ConnectionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    #[must_use]
    pub fn new(session_id: String, host_user_id: String, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            host_user_id,
            client_user_id: None,
            status: SessionStatus::Active,
            host_connection_id: None,
            client_connection_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// The role `user_id` plays in this session, if any.
    #[must_use]
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.host_user_id == user_id {
            Some(Role::Host)
        } else if self.client_user_id.as_deref() == Some(user_id) {
            Some(Role::Client)
        } else {
            None
        }
    }

    #[must_use]
    pub fn user_for(&self, role: Role) -> Option<&str> {
        match role {
            Role::Host => Some(self.host_user_id.as_str()),
            Role::Client => self.client_user_id.as_deref(),
        }
    }

    #[must_use]
    pub fn connection_for(&self, role: Role) -> Option<ConnectionId> {
        match role {
            Role::Host => self.host_connection_id,
            Role::Client => self.client_connection_id,
        }
    }

    pub(crate) fn set_connection(&mut self, role: Role, connection_id: Option<ConnectionId>) {
        match role {
            Role::Host => self.host_connection_id = connection_id,
            Role::Client => self.client_connection_id = connection_id,
        }
    }

    /// Both participants' current connections, host first.
    #[must_use]
    pub fn bound_connections(&self) -> Vec<ConnectionId> {
        [self.host_connection_id, self.client_connection_id]
            .into_iter()
            .flatten()
            .collect()
    }
}

// ── File transfers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Rejected,
    Transferring,
    Completed,
    Failed,
}

impl TransferStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows `self → next`.
    ///
    /// Every non-terminal state may fail: a torn-down rendezvous fails the
    /// transfer whatever leg it was waiting on.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted | Self::Rejected)
                | (Self::Accepted, Self::Transferring)
                | (Self::Transferring, Self::Completed)
                | (
                    Self::Pending | Self::Accepted | Self::Transferring,
                    Self::Failed
                )
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub id: String,
    pub session_id: String,
    pub sender_user_id: String,
    pub receiver_user_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileTransfer {
    /// Moves the transfer to `next`, stamping `completed_at` on terminal
    /// states.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_TRANSFER_STATE` if the state machine forbids the move.
    pub fn advance(&mut self, next: TransferStatus) -> RelayResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(RelayError::new(
                ErrorCode::InvalidTransferState,
                format!(
                    "transfer {} cannot move from {:?} to {next:?}",
                    self.id, self.status
                ),
            ));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ── Audit records ───────────────────────────────────────────────────

/// One relayed remote-input action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub session_id: String,
    pub user_id: String,
    pub kind: InputKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// A diagnostic reported by a connected party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

// ── Store ───────────────────────────────────────────────────────────

/// Durable CRUD for relay records.
///
/// The registry and transfer book keep the authoritative in-memory copy
/// and write every change through; the store is read back only on a cache
/// miss. Records are never deleted.
pub trait SessionStore: Send + Sync + 'static {
    fn insert_session(&self, record: &SessionRecord) -> anyhow::Result<()>;
    fn update_session(&self, record: &SessionRecord) -> anyhow::Result<()>;
    fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>>;
    /// Every session `user_id` ever took part in, in any state.
    fn sessions_for_user(&self, user_id: &str) -> anyhow::Result<Vec<SessionRecord>>;

    fn insert_transfer(&self, transfer: &FileTransfer) -> anyhow::Result<()>;
    fn update_transfer(&self, transfer: &FileTransfer) -> anyhow::Result<()>;
    fn get_transfer(&self, transfer_id: &str) -> anyhow::Result<Option<FileTransfer>>;

    fn log_action(&self, entry: &ActionLog) -> anyhow::Result<()>;
    fn log_error(&self, entry: &ErrorReport) -> anyhow::Result<()>;
}

/// In-process [`SessionStore`]. Contents live as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    transfers: Mutex<HashMap<String, FileTransfer>>,
    actions: Mutex<Vec<ActionLog>>,
    errors: Mutex<Vec<ErrorReport>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn actions(&self) -> Vec<ActionLog> {
        self.actions.lock().clone()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<ErrorReport> {
        self.errors.lock().clone()
    }
}

impl SessionStore for MemoryStore {
    fn insert_session(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock();
        anyhow::ensure!(
            !sessions.contains_key(&record.session_id),
            "session {} already exists",
            record.session_id
        );
        sessions.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn update_session(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock();
        let Some(slot) = sessions.get_mut(&record.session_id) else {
            anyhow::bail!("session {} does not exist", record.session_id);
        };
        *slot = record.clone();
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    fn sessions_for_user(&self, user_id: &str) -> anyhow::Result<Vec<SessionRecord>> {
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|s| s.role_of(user_id).is_some())
            .cloned()
            .collect())
    }

    fn insert_transfer(&self, transfer: &FileTransfer) -> anyhow::Result<()> {
        self.transfers.lock().insert(transfer.id.clone(), transfer.clone());
        Ok(())
    }

    fn update_transfer(&self, transfer: &FileTransfer) -> anyhow::Result<()> {
        let mut transfers = self.transfers.lock();
        let Some(slot) = transfers.get_mut(&transfer.id) else {
            anyhow::bail!("transfer {} does not exist", transfer.id);
        };
        *slot = transfer.clone();
        Ok(())
    }

    fn get_transfer(&self, transfer_id: &str) -> anyhow::Result<Option<FileTransfer>> {
        Ok(self.transfers.lock().get(transfer_id).cloned())
    }

    fn log_action(&self, entry: &ActionLog) -> anyhow::Result<()> {
        self.actions.lock().push(entry.clone());
        Ok(())
    }

    fn log_error(&self, entry: &ErrorReport) -> anyhow::Result<()> {
        self.errors.lock().push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(status: TransferStatus) -> FileTransfer {
        FileTransfer {
            id: "t1".into(),
            session_id: "S1".into(),
            sender_user_id: "u1".into(),
            receiver_user_id: "u2".into(),
            file_name: "a.bin".into(),
            file_size: 10,
            bytes_transferred: 0,
            status,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn given_terminal_states_when_advancing_anywhere_then_rejected() {
        for terminal in [
            TransferStatus::Rejected,
            TransferStatus::Completed,
            TransferStatus::Failed,
        ] {
            for next in [
                TransferStatus::Pending,
                TransferStatus::Accepted,
                TransferStatus::Transferring,
                TransferStatus::Completed,
                TransferStatus::Failed,
            ] {
                let mut t = transfer(terminal);
                let err = t.advance(next).unwrap_err();
                assert_eq!(err.code, ErrorCode::InvalidTransferState);
                assert_eq!(t.status, terminal);
            }
        }
    }

    #[test]
    fn given_pending_transfer_when_walking_happy_path_then_completed_is_stamped() {
        let mut t = transfer(TransferStatus::Pending);
        t.advance(TransferStatus::Accepted).unwrap();
        t.advance(TransferStatus::Transferring).unwrap();
        assert!(t.completed_at.is_none());
        t.advance(TransferStatus::Completed).unwrap();
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn given_pending_transfer_when_skipping_to_transferring_then_rejected() {
        let mut t = transfer(TransferStatus::Pending);
        assert!(t.advance(TransferStatus::Transferring).is_err());
        assert!(t.advance(TransferStatus::Completed).is_err());
    }

    #[test]
    fn given_session_when_role_of_then_matches_participants_only() {
        let mut s = SessionRecord::new("S1".into(), "u1".into(), Utc::now());
        s.client_user_id = Some("u2".into());
        assert_eq!(s.role_of("u1"), Some(Role::Host));
        assert_eq!(s.role_of("u2"), Some(Role::Client));
        assert_eq!(s.role_of("u3"), None);
    }

    #[test]
    fn given_store_when_updating_unknown_session_then_error() {
        let store = MemoryStore::new();
        let s = SessionRecord::new("S1".into(), "u1".into(), Utc::now());
        assert!(store.update_session(&s).is_err());
        store.insert_session(&s).unwrap();
        assert!(store.insert_session(&s).is_err());
        assert_eq!(store.sessions_for_user("u1").unwrap().len(), 1);
    }
}
