use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use tether_core::crypto::{self, SessionKey};
use tether_core::error::{ErrorCode, RelayError, RelayResult};


/// In-memory cache of derived session keys. Never persisted.
#[derive(Default)]
pub struct SessionKeyStore {
    keys: RwLock<HashMap<String, SessionKey>>,
}

impl SessionKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, session_id: &str, key: SessionKey) {
        self.keys.write().insert(session_id.to_owned(), key);
    }

    /// Derives the session key from base64 key material and caches it.
    ///
    /// # Errors
    ///
    /// `INVALID_KEY` when either key fails to decode or parse.
    pub fn derive_and_install(
        &self,
        session_id: &str,
        private_key_b64: &str,
        peer_public_key_b64: &str,
    ) -> RelayResult<()> {
        let private = crypto::decode_b64(private_key_b64)?;
        let peer_public = crypto::decode_b64(peer_public_key_b64)?;
        let key = crypto::derive_session_key(&private, &peer_public)?;
        self.install(session_id, key);
        debug!(session_id = %session_id, "Session key derived");
        Ok(())
    }

    /// # Errors
    ///
    /// `KEY_NOT_FOUND` without a cached key.
    pub fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> RelayResult<Vec<u8>> {
        let key = self.key(session_id)?;
        Ok(crypto::encrypt(&key, plaintext)?)
    }

    /// # Errors
    ///
    /// `KEY_NOT_FOUND` without a cached key, `CRYPTO_VERIFICATION_FAILED` when
    /// the message was tampered with.
    pub fn decrypt(&self, session_id: &str, sealed: &[u8]) -> RelayResult<Vec<u8>> {
        let key = self.key(session_id)?;
        Ok(crypto::decrypt(&key, sealed)?)
    }

    /// Returns whether a key was present.
    pub fn clear(&self, session_id: &str) -> bool {
        let removed = self.keys.write().remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, "Session key cleared");
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.keys.read().contains_key(session_id)
    }

    fn key(&self, session_id: &str) -> RelayResult<SessionKey> {
        self.keys.read().get(session_id).copied().ok_or_else(|| {
            RelayError::new(
                ErrorCode::KeyNotFound,
                format!("no session key for session {session_id}"),
            )
        })
    }
}
