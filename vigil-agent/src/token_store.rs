//! Bearer tokens accepted by the `auth` message.
//!
//! The set is loaded once at startup from a JSON file of the form
//! `{"tokens": ["..."]}`. Any failure to read or parse that file leaves the
//! store empty, so no connection can authenticate until the agent is
//! restarted with a readable file (fail-closed). The failure is logged.
//!
//! Token lookup uses a full linear scan with constant-time equality (via
//! `subtle`) to prevent timing side-channels.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: Vec<String>,
}

/// Read the token list from disk, dropping empty entries
fn read_tokens(path: &Path) -> Result<Vec<String>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
    let file: TokenFile = serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse '{}': {}", path.display(), e))?;
    Ok(file.tokens.into_iter().filter(|t| !t.is_empty()).collect())
}

/// Process-wide set of valid tokens.
///
/// Read-only once loaded; [`TokenStore::reload`] and [`TokenStore::clear`]
/// exist for tests and for an explicit reload step.
pub struct TokenStore {
    tokens: RwLock<Vec<String>>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the actual token values
        f.debug_struct("TokenStore")
            .field("tokens", &self.len())
            .finish()
    }
}

impl TokenStore {
    /// Create an empty store; nothing validates
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(Vec::new()),
        }
    }

    /// Create a store holding the given tokens
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        store.replace(tokens);
        store
    }

    /// Load tokens from a file. Never fails: unreadable input yields an empty store.
    pub fn load(path: &Path) -> Self {
        let store = Self::new();
        store.reload(path);
        store
    }

    /// Replace the current set with the file contents, returning the new count.
    ///
    /// On failure the set becomes empty.
    pub fn reload(&self, path: &Path) -> usize {
        match read_tokens(path) {
            Ok(tokens) => {
                let count = tokens.len();
                *self.tokens.write() = tokens;
                if count == 0 {
                    warn!("Token file '{}' holds no tokens; authentication will always fail", path.display());
                } else {
                    info!("Loaded {} token(s) from '{}'", count, path.display());
                }
                count
            }
            Err(e) => {
                self.clear();
                warn!("No tokens loaded ({}); authentication will always fail", e);
                0
            }
        }
    }

    /// Replace the current set with the given tokens
    pub fn replace<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.tokens.write() = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.is_empty())
            .collect();
    }

    /// Drop every token
    pub fn clear(&self) {
        self.tokens.write().clear();
    }

    /// Exact membership test, constant-time per stored token
    pub fn is_valid(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let tokens = self.tokens.read();
        tokens
            .iter()
            .fold(subtle::Choice::from(0u8), |found, stored| {
                found | stored.as_bytes().ct_eq(token.as_bytes())
            })
            .into()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

/// Shared token store reference.
pub type SharedTokenStore = Arc<TokenStore>;

#[cfg(test)]
mod tests;
