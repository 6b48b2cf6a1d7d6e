// src/bot/seen.rs - Session seen-users set and the durable first-time ledger

use log::{error, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::storage::Storage;

/// Usernames greeted this session. Session-scoped on purpose: restarting the
/// bot greets everyone again, which is what streamers expect day to day.
pub struct SeenUsers {
    users: RwLock<HashSet<String>>,
}

impl SeenUsers {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashSet::new()),
        }
    }

    pub async fn has_seen(&self, name_key: &str) -> bool {
        self.users.read().await.contains(name_key)
    }

    /// Insert the user; returns true if they were not seen before. The
    /// check-and-insert is one operation so a user can never be greeted
    /// twice by racing callers.
    pub async fn mark_seen(&self, name_key: &str) -> bool {
        self.users.write().await.insert(name_key.to_string())
    }

    pub async fn add(&self, name_key: &str) {
        self.users.write().await.insert(name_key.to_string());
        info!("added '{}' to seen list", name_key);
    }

    pub async fn remove(&self, name_key: &str) {
        self.users.write().await.remove(name_key);
        info!("removed '{}' from seen list", name_key);
    }

    pub async fn clear(&self) {
        self.users.write().await.clear();
        info!("seen list cleared");
    }
}

impl Default for SeenUsers {
    fn default() -> Self {
        Self::new()
    }
}

const LEDGER_KEY: &str = "all_chatters";

/// Append-only record of everyone who has ever chatted, across restarts.
/// Only used to pick the first-time-chatter greeting variant.
pub struct FirstTimeLedger {
    storage: Arc<dyn Storage>,
}

impl FirstTimeLedger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// True if this username has never chatted before; records it either
    /// way. Callers must invoke this at most once per message: the call
    /// itself marks the user, so a second call would answer differently.
    pub async fn check_and_record(&self, username: &str) -> bool {
        let name = username.to_lowercase();
        match self.storage.read(LEDGER_KEY).await {
            Ok(Some(contents)) if contents.lines().any(|l| l.trim() == name) => false,
            Ok(_) => {
                if let Err(e) = self.storage.append(LEDGER_KEY, &name).await {
                    error!("failed to record '{}' in first-time ledger: {e:#}", name);
                }
                true
            }
            Err(e) => {
                // A broken data dir must not spam first-time greetings.
                error!("first-time ledger unavailable: {e:#}");
                false
            }
        }
    }
}
