//! Session registry: durable session identity ↔ ephemeral connection
//! identity.
//!
//! Only non-ended sessions are cached; an ended session is evicted and later
//! lookups read it back from the store.
//!
//! Lock order is one session's mutex → `sessions` map → `users` index, and
//! `connections` is only ever taken on its own or after a session mutex.
//! No lock is held across an `.await`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_core::error::{ErrorCode, RelayError, RelayResult};
use tether_core::protocol::{ConnectionId, Role};

use crate::store::{SessionRecord, SessionStatus, SessionStore};

/// One live signaling connection and what it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
}

/// Result of [`SessionRegistry::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub role: Role,
    /// The connection previously bound to the same role, now replaced.
    pub superseded: Option<ConnectionId>,
    pub peer_connection: Option<ConnectionId>,
    pub peer_user_id: Option<String>,
}

/// Result of [`SessionRegistry::disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unbound {
    pub info: ConnectionInfo,
    /// `false` when the connection had already been superseded, in which
    /// case the session binding was left alone.
    pub cleared: bool,
    pub peer_connection: Option<ConnectionId>,
}

/// Everything a signaling call needs once its caller is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub peer_user_id: Option<String>,
    pub peer_connection: Option<ConnectionId>,
}

type Cell = Arc<Mutex<SessionRecord>>;

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    inactivity: TimeDelta,
    sessions: RwLock<HashMap<String, Cell>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    /// user id → the one non-ended session that user takes part in.
    users: Mutex<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, inactivity_timeout: Duration) -> Self {
        Self {
            store,
            inactivity: TimeDelta::from_std(inactivity_timeout).unwrap_or(TimeDelta::MAX),
            sessions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Creates an `Active` session hosted by `user_id`.
    ///
    /// # Errors
    ///
    /// `ALREADY_HAS_ACTIVE_SESSION` if the user takes part in another
    /// non-ended session.
    pub fn start(&self, user_id: &str) -> RelayResult<SessionRecord> {
        if self.active_session_of(user_id)?.is_some() {
            return Err(already_active(user_id));
        }

        let record = SessionRecord::new(Uuid::new_v4().to_string(), user_id.to_owned(), Utc::now());
        match self.users.lock().entry(user_id.to_owned()) {
            Entry::Occupied(_) => return Err(already_active(user_id)),
            Entry::Vacant(slot) => {
                slot.insert(record.session_id.clone());
            }
        }

        if let Err(e) = self.store.insert_session(&record) {
            self.users.lock().remove(user_id);
            return Err(RelayError::internal(e));
        }
        self.sessions.write().insert(
            record.session_id.clone(),
            Arc::new(Mutex::new(record.clone())),
        );

        info!(session_id = %record.session_id, host = %user_id, "Session started");
        Ok(record)
    }

    /// Binds `user_id` as the session's client.
    ///
    /// # Errors
    ///
    /// In order of precedence: `SESSION_NOT_FOUND`, `SESSION_INACTIVE`,
    /// `SESSION_FULL`, `ALREADY_HAS_ACTIVE_SESSION`.
    pub fn join(&self, session_id: &str, user_id: &str) -> RelayResult<SessionRecord> {
        let cell = self.cell(session_id)?;
        {
            let mut record = cell.lock();
            self.ensure_active(&mut record)?;
            ensure_joinable(&record)?;
        }

        if self.active_session_of(user_id)?.is_some() {
            return Err(already_active(user_id));
        }

        let mut record = cell.lock();
        self.ensure_active(&mut record)?;
        ensure_joinable(&record)?;

        match self.users.lock().entry(user_id.to_owned()) {
            Entry::Occupied(_) => return Err(already_active(user_id)),
            Entry::Vacant(slot) => {
                slot.insert(session_id.to_owned());
            }
        }

        record.client_user_id = Some(user_id.to_owned());
        record.updated_at = Utc::now();
        if let Err(e) = self.store.update_session(&record) {
            record.client_user_id = None;
            self.users.lock().remove(user_id);
            return Err(RelayError::internal(e));
        }

        info!(session_id = %session_id, client = %user_id, "Client joined session");
        Ok(record.clone())
    }

    /// Records `connection_id` as the current connection for the caller's
    /// role. Last write wins.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`, `SESSION_INACTIVE`, or `NOT_AUTHORIZED` when the
    /// caller is neither participant.
    pub fn connect(
        &self,
        session_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> RelayResult<Binding> {
        let cell = self.cell(session_id)?;
        let mut record = cell.lock();
        self.ensure_active(&mut record)?;
        let role = record
            .role_of(user_id)
            .ok_or_else(|| RelayError::not_authorized(session_id))?;

        let superseded = record
            .connection_for(role)
            .filter(|&previous| previous != connection_id);
        record.set_connection(role, Some(connection_id));
        record.updated_at = Utc::now();
        self.store
            .update_session(&record)
            .map_err(RelayError::internal)?;

        self.connections.write().insert(
            connection_id,
            ConnectionInfo {
                connection_id,
                session_id: session_id.to_owned(),
                user_id: user_id.to_owned(),
                role,
            },
        );

        debug!(
            session_id = %session_id,
            connection_id,
            ?role,
            superseded = ?superseded,
            "Connection bound"
        );

        Ok(Binding {
            role,
            superseded,
            peer_connection: record.connection_for(role.peer()),
            peer_user_id: record.user_for(role.peer()).map(str::to_owned),
        })
    }

    /// Forgets `connection_id`. The session's role binding is cleared only
    /// if it still points at this connection; the session stays `Active`.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<Unbound> {
        let info = self.connections.write().remove(&connection_id)?;

        let Some(cell) = self.sessions.read().get(&info.session_id).cloned() else {
            return Some(Unbound {
                info,
                cleared: false,
                peer_connection: None,
            });
        };

        let mut record = cell.lock();
        let cleared = record.connection_for(info.role) == Some(connection_id);
        if cleared {
            record.set_connection(info.role, None);
            if let Err(e) = self.store.update_session(&record) {
                warn!(session_id = %info.session_id, error = %e, "Failed to persist disconnect");
            }
        }
        debug!(session_id = %info.session_id, connection_id, cleared, "Connection unbound");

        Some(Unbound {
            peer_connection: record.connection_for(info.role.peer()),
            info,
            cleared,
        })
    }

    /// Ends the session on behalf of one of its participants.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`, `NOT_AUTHORIZED`, or `SESSION_INACTIVE` if it has
    /// already ended.
    pub fn stop(&self, session_id: &str, user_id: &str) -> RelayResult<SessionRecord> {
        let cell = self.cell(session_id)?;
        let mut record = cell.lock();
        if record.role_of(user_id).is_none() {
            return Err(RelayError::not_authorized(session_id));
        }
        self.ensure_active(&mut record)?;

        record.status = SessionStatus::Ended;
        record.updated_at = Utc::now();
        self.release_users(&record);
        self.store
            .update_session(&record)
            .map_err(RelayError::internal)?;
        self.evict(session_id);

        info!(session_id = %session_id, by = %user_id, "Session stopped");
        Ok(record.clone())
    }

    /// Non-ended sessions `user_id` takes part in, newest first.
    ///
    /// # Errors
    ///
    /// `INTERNAL` if the store cannot be read.
    pub fn active_sessions(&self, user_id: &str) -> RelayResult<Vec<SessionRecord>> {
        let stored = self
            .store
            .sessions_for_user(user_id)
            .map_err(RelayError::internal)?;

        let mut active = Vec::new();
        for candidate in stored {
            let cell = self.cell(&candidate.session_id)?;
            let mut record = cell.lock();
            self.expire_if_idle(&mut record, Utc::now());
            if record.is_active() && record.role_of(user_id).is_some() {
                active.push(record.clone());
            }
        }
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    /// Verifies that `connection_id` is the live connection of a participant
    /// of the active session `session_id`, and refreshes its activity.
    ///
    /// # Errors
    ///
    /// `AUTH_REQUIRED` for an unbound or superseded connection,
    /// `NOT_AUTHORIZED` when the connection belongs to a different session,
    /// then `SESSION_NOT_FOUND` / `SESSION_INACTIVE`.
    pub fn resolve_call(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
    ) -> RelayResult<CallContext> {
        let info = self
            .connection(connection_id)
            .ok_or_else(|| auth_required(connection_id))?;
        if info.session_id != session_id {
            return Err(RelayError::not_authorized(session_id));
        }

        let cell = self.cell(session_id)?;
        let mut record = cell.lock();
        self.ensure_active(&mut record)?;
        if record.connection_for(info.role) != Some(connection_id) {
            return Err(auth_required(connection_id));
        }

        record.updated_at = Utc::now();
        if let Err(e) = self.store.update_session(&record) {
            warn!(session_id = %session_id, error = %e, "Failed to persist activity");
        }

        Ok(CallContext {
            session_id: info.session_id,
            user_id: info.user_id,
            role: info.role,
            peer_user_id: record.user_for(info.role.peer()).map(str::to_owned),
            peer_connection: record.connection_for(info.role.peer()),
        })
    }

    /// Verifies that `user_id` participates in the active session and
    /// returns a snapshot of it.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`, `SESSION_INACTIVE`, `NOT_AUTHORIZED`.
    pub fn authorize(&self, session_id: &str, user_id: &str) -> RelayResult<SessionRecord> {
        let cell = self.cell(session_id)?;
        let mut record = cell.lock();
        self.ensure_active(&mut record)?;
        if record.role_of(user_id).is_none() {
            return Err(RelayError::not_authorized(session_id));
        }
        record.updated_at = Utc::now();
        if let Err(e) = self.store.update_session(&record) {
            warn!(session_id = %session_id, error = %e, "Failed to persist activity");
        }
        Ok(record.clone())
    }

    /// Snapshot of a session after applying inactivity expiry.
    ///
    /// # Errors
    ///
    /// `SESSION_NOT_FOUND`.
    pub fn session(&self, session_id: &str) -> RelayResult<SessionRecord> {
        let cell = self.cell(session_id)?;
        let mut record = cell.lock();
        self.expire_if_idle(&mut record, Utc::now());
        Ok(record.clone())
    }

    #[must_use]
    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().get(&connection_id).cloned()
    }

    /// Currently bound connections of a cached session, host first.
    #[must_use]
    pub fn participant_connections(&self, session_id: &str) -> Vec<ConnectionId> {
        let cell = self.sessions.read().get(session_id).cloned();
        cell.map(|cell| cell.lock().bound_connections()).unwrap_or_default()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn cell(&self, session_id: &str) -> RelayResult<Cell> {
        if let Some(cell) = self.sessions.read().get(session_id) {
            return Ok(Arc::clone(cell));
        }

        let Some(mut record) = self
            .store
            .get_session(session_id)
            .map_err(RelayError::internal)?
        else {
            return Err(RelayError::session_not_found(session_id));
        };
        // Connections never outlive the process that accepted them.
        record.host_connection_id = None;
        record.client_connection_id = None;

        if !record.is_active() {
            return Ok(Arc::new(Mutex::new(record)));
        }

        let mut sessions = self.sessions.write();
        if let Some(cell) = sessions.get(session_id) {
            return Ok(Arc::clone(cell));
        }
        let mut users = self.users.lock();
        for user in [Some(&record.host_user_id), record.client_user_id.as_ref()]
            .into_iter()
            .flatten()
        {
            users
                .entry(user.clone())
                .or_insert_with(|| session_id.to_owned());
        }
        drop(users);
        debug!(session_id = %session_id, "Session loaded from store");
        let cell = Arc::new(Mutex::new(record));
        sessions.insert(session_id.to_owned(), Arc::clone(&cell));
        Ok(cell)
    }

    /// The id of the non-ended session `user_id` takes part in, expiring
    /// idle candidates on the way.
    fn active_session_of(&self, user_id: &str) -> RelayResult<Option<String>> {
        let indexed = self.users.lock().get(user_id).cloned();
        let candidates = if let Some(session_id) = indexed {
            vec![session_id]
        } else {
            self.store
                .sessions_for_user(user_id)
                .map_err(RelayError::internal)?
                .into_iter()
                .filter(SessionRecord::is_active)
                .map(|s| s.session_id)
                .collect()
        };

        for session_id in candidates {
            let cell = match self.cell(&session_id) {
                Ok(cell) => cell,
                Err(e) if e.code == ErrorCode::SessionNotFound => {
                    // A reservation whose record never made it to the store.
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut record = cell.lock();
            self.expire_if_idle(&mut record, Utc::now());
            if record.is_active() && record.role_of(user_id).is_some() {
                return Ok(Some(session_id));
            }
        }
        Ok(None)
    }

    fn ensure_active(&self, record: &mut SessionRecord) -> RelayResult<()> {
        self.expire_if_idle(record, Utc::now());
        if record.is_active() {
            Ok(())
        } else {
            Err(RelayError::session_inactive(&record.session_id))
        }
    }

    fn expire_if_idle(&self, record: &mut SessionRecord, now: DateTime<Utc>) {
        if !record.is_active() || now.signed_duration_since(record.updated_at) < self.inactivity {
            return;
        }
        record.status = SessionStatus::Ended;
        record.updated_at = now;
        self.release_users(record);
        if let Err(e) = self.store.update_session(record) {
            warn!(session_id = %record.session_id, error = %e, "Failed to persist expiry");
        }
        self.evict(&record.session_id);
        info!(session_id = %record.session_id, "Session ended after inactivity");
    }

    /// Drops an ended session from the cache along with its connections.
    fn evict(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
        self.connections
            .write()
            .retain(|_, info| info.session_id != session_id);
    }

    fn release_users(&self, record: &SessionRecord) {
        let mut users = self.users.lock();
        for user in [Some(&record.host_user_id), record.client_user_id.as_ref()]
            .into_iter()
            .flatten()
        {
            if users.get(user) == Some(&record.session_id) {
                users.remove(user);
            }
        }
    }
}

fn ensure_joinable(record: &SessionRecord) -> RelayResult<()> {
    if record.client_user_id.is_some() {
        return Err(RelayError::new(
            ErrorCode::SessionFull,
            format!("session {} already has a client", record.session_id),
        ));
    }
    Ok(())
}

fn already_active(user_id: &str) -> RelayError {
    RelayError::new(
        ErrorCode::AlreadyHasActiveSession,
        format!("user {user_id} already takes part in an active session"),
    )
}

fn auth_required(connection_id: ConnectionId) -> RelayError {
    RelayError::new(
        ErrorCode::AuthRequired,
        format!("connection {connection_id} is not bound to a session"),
    )
}
