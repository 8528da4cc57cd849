use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use parking_lot::RwLock;
use tracing::info;


/// Resolves a bearer token to a stable user identifier.
///
/// Token issuance lives outside the relay; the engine only ever sees the
/// user id an implementation returns.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &str) -> Option<String>;
}

/// A fixed token → user id table.
#[derive(Default)]
pub struct TokenTable {
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenTable {
    #[must_use]
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }

    /// Loads a JSON object of `{"<token>": "<user id>"}` pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not such an object.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        let tokens: HashMap<String, String> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse token file {}", path.display()))?;
        info!(path = %path.display(), count = tokens.len(), "Loaded token table");
        Ok(Self::new(tokens))
    }

    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.write().insert(token.into(), user_id.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Authenticator for TokenTable {
    fn authenticate(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.tokens.read().get(token).cloned()
    }
}
