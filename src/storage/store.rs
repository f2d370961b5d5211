//! Token store backed by redb embedded database.
//!
//! Plays the role browser storage plays for a single-page app:
//! - the current token set, mirrored in memory for synchronous reads
//! - pending authorizations (state, nonce, PKCE verifier) that must survive
//!   the redirect to the identity provider and back
//! - one-time redemption of each pending authorization

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{AuthState, PendingAuthorization, TokenSet};

/// redb table for the token set (single row under `CURRENT_KEY`, MessagePack value).
const TOKENS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("oauth_tokens");

/// redb table for pending authorizations (key: state, value: MessagePack bytes).
const PENDING_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("oauth_pending");

const CURRENT_KEY: &str = "current";

/// Token store with in-memory cache and persistent storage.
pub struct TokenStore {
    /// redb database handle.
    db: Database,

    /// Cached copy of the persisted token set.
    cache: RwLock<Option<TokenSet>>,
}

impl TokenStore {
    /// Open or create a token store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open token database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TOKENS_TABLE)?;
            let _ = write_txn.open_table(PENDING_TABLE)?;
        }
        write_txn.commit()?;

        let cached = Self::load_tokens(&db)?;
        debug!(has_tokens = cached.is_some(), "Loaded token store");

        Ok(Self {
            db,
            cache: RwLock::new(cached),
        })
    }

    /// Current token set, expired or not.
    pub fn tokens(&self) -> Option<TokenSet> {
        self.cache.read().ok().and_then(|guard| guard.clone())
    }

    /// Replace the token set wholesale.
    pub fn save_tokens(&self, tokens: TokenSet) -> Result<()> {
        let data = rmp_serde::to_vec(&tokens).context("Failed to serialize token set")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TOKENS_TABLE)?;
            table.insert(CURRENT_KEY, data.as_slice())?;
        }
        write_txn.commit()?;

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(tokens);
        }
        Ok(())
    }

    /// Remove the token set. Returns whether one was held.
    pub fn clear_tokens(&self) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            *cache = None;
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TOKENS_TABLE)?;
            let result = table.remove(CURRENT_KEY)?;
            result.is_some()
        };
        write_txn.commit()?;

        Ok(removed)
    }

    /// Persist a pending authorization until the redirect comes back.
    pub fn save_pending(&self, pending: &PendingAuthorization) -> Result<()> {
        let data = rmp_serde::to_vec(pending).context("Failed to serialize pending authorization")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            table.insert(pending.state.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove and return the pending authorization for `state`.
    ///
    /// A state can be redeemed once; expired entries are dropped and reported
    /// as absent.
    pub fn take_pending(&self, state: &AuthState) -> Result<Option<PendingAuthorization>> {
        let write_txn = self.db.begin_write()?;
        let bytes = {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            let removed = table.remove(state.as_str())?;
            removed.map(|value| value.value().to_vec())
        };
        write_txn.commit()?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let pending: PendingAuthorization = rmp_serde::from_slice(&bytes)
            .context("Failed to deserialize pending authorization")?;

        if pending.is_expired() {
            debug!(state = %state, "Pending authorization expired");
            return Ok(None);
        }

        Ok(Some(pending))
    }

    /// Evict expired or unreadable pending authorizations.
    /// Returns the number evicted.
    pub fn evict_expired(&self) -> Result<usize> {
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(PENDING_TABLE)?;

            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<PendingAuthorization>(value.value()) {
                    Ok(pending) if pending.is_expired() => {
                        keys.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(
                            key = key.value(),
                            error = %e,
                            "Unreadable pending authorization, evicting"
                        );
                        keys.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            keys
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            for key in &expired {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;

        Ok(expired.len())
    }

    /// Number of logins awaiting their redirect.
    pub fn pending_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn load_tokens(db: &Database) -> Result<Option<TokenSet>> {
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(TOKENS_TABLE)?;

        let tokens = match table.get(CURRENT_KEY)? {
            Some(value) => match rmp_serde::from_slice::<TokenSet>(value.value()) {
                Ok(tokens) => Some(tokens),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable token set");
                    None
                }
            },
            None => None,
        };

        Ok(tokens)
    }
}
