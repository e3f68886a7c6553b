//! Authoritative user lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::principal::{AccountStatus, UserRecord};
use crate::backend::BackendClient;

const USERS_TABLE: &str = "users";

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("user lookup transport error: {0}")]
    Transport(String),
    #[error("user lookup returned a malformed row: {0}")]
    Malformed(String),
    #[error("user lookup returned {count} rows for '{username}'")]
    Ambiguous { username: String, count: usize },
}

/// Fetches the authoritative `users` row by username. `Ok(None)` means no such user.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, DirectoryError>;
}

/// Directory over the hosted backend's `users` table.
pub struct RestUserDirectory {
    client: BackendClient,
}

impl RestUserDirectory {
    pub fn new(client: BackendClient) -> Self { Self { client } }
}

#[async_trait]
impl UserDirectory for RestUserDirectory {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, DirectoryError> {
        let rows: Vec<serde_json::Value> = self.client
            .select(USERS_TABLE, &[BackendClient::eq("username", username)])
            .await
            .map_err(|e| DirectoryError::Transport(format!("{:#}", e)))?;
        single_record(username, rows)
    }
}

/// Enforce at-most-one and decode the row.
pub fn single_record(username: &str, mut rows: Vec<serde_json::Value>) -> Result<Option<UserRecord>, DirectoryError> {
    match rows.len() {
        0 => Ok(None),
        1 => {
            let row = rows.remove(0);
            let rec: UserRecord = serde_json::from_value(row).map_err(|e| DirectoryError::Malformed(e.to_string()))?;
            if rec.username != username {
                return Err(DirectoryError::Malformed(format!("asked for '{}', got '{}'", username, rec.username)));
            }
            Ok(Some(rec))
        }
        count => Err(DirectoryError::Ambiguous { username: username.to_string(), count }),
    }
}

/// In-process directory used for development seeds and tests.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
    offline: AtomicBool,
}

impl MemoryUserDirectory {
    pub fn new() -> Self { Self::default() }

    pub fn from_records<I: IntoIterator<Item = UserRecord>>(records: I) -> Self {
        let d = Self::new();
        for r in records { d.upsert(r); }
        d
    }

    pub fn upsert(&self, record: UserRecord) {
        self.users.write().insert(record.username.clone(), record);
    }

    pub fn remove(&self, username: &str) -> Option<UserRecord> {
        self.users.write().remove(username)
    }

    pub fn set_status(&self, username: &str, status: AccountStatus) -> bool {
        match self.users.write().get_mut(username) {
            Some(r) => { r.status = status; true }
            None => false,
        }
    }

    /// While offline every lookup fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize { self.users.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, DirectoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DirectoryError::Transport("directory offline".into()));
        }
        Ok(self.users.read().get(username).cloned())
    }
}
