use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::RwLock;
use serde::Serialize;

use super::authorizer::GateController;
use super::principal::{Role, UserRecord};
use crate::tprintln;

pub type SessionToken = String;

/// Cached subset of the user record for one browser session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub user_access: Option<String>,
    pub department: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    Username,
    Role,
    UserAccess,
    Department,
}

/// Fields to overwrite in one `set`; `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub user_access: Option<String>,
    pub department: Option<String>,
}

#[derive(Debug, Default)]
struct StoreInner {
    state: SessionState,
    // bumped by init/clear so in-flight gate activations can tell the identity changed under them
    epoch: u64,
}

/// Session context handed to the gate by reference. Cloning shares the same session.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl SessionStore {
    pub fn new() -> Self { Self::default() }

    /// Seed the session from a freshly authenticated record.
    pub fn init(&self, record: &UserRecord) {
        let access = record.effective_access();
        let mut g = self.inner.write();
        g.state = SessionState {
            username: Some(record.username.clone()),
            role: Some(record.role),
            user_access: Some(access.session_value().to_string()),
            department: record.department.clone(),
        };
        g.epoch += 1;
    }

    /// Reconcile role and access with the authoritative record read while the
    /// session was at `epoch`. Returns `None` without writing when the identity
    /// changed since (logout, expiry), else whether either field changed.
    pub fn update(&self, epoch: u64, role: Role, user_access: &str) -> Option<bool> {
        let mut g = self.inner.write();
        if g.epoch != epoch || g.state.username.is_none() { return None; }
        let changed = g.state.role != Some(role) || g.state.user_access.as_deref() != Some(user_access);
        g.state.role = Some(role);
        g.state.user_access = Some(user_access.to_string());
        Some(changed)
    }

    /// Overwrite the named fields under a single lock.
    pub fn set(&self, fields: SessionUpdate) {
        let mut g = self.inner.write();
        let identity_changed = fields.username.is_some() && fields.username != g.state.username;
        if let Some(v) = fields.username { g.state.username = Some(v); }
        if let Some(v) = fields.role { g.state.role = Some(v); }
        if let Some(v) = fields.user_access { g.state.user_access = Some(v); }
        if let Some(v) = fields.department { g.state.department = Some(v); }
        if identity_changed { g.epoch += 1; }
    }

    pub fn get(&self, field: SessionField) -> Option<String> {
        let g = self.inner.read();
        match field {
            SessionField::Username => g.state.username.clone(),
            SessionField::Role => g.state.role.map(|r| r.as_str().to_string()),
            SessionField::UserAccess => g.state.user_access.clone(),
            SessionField::Department => g.state.department.clone(),
        }
    }

    pub fn clear(&self) {
        let mut g = self.inner.write();
        g.state = SessionState::default();
        g.epoch += 1;
    }

    pub fn username(&self) -> Option<String> { self.inner.read().state.username.clone() }
    pub fn role(&self) -> Option<Role> { self.inner.read().state.role }
    pub fn snapshot(&self) -> SessionState { self.inner.read().state.clone() }
    pub fn epoch(&self) -> u64 { self.inner.read().epoch }
    pub fn is_empty(&self) -> bool { self.inner.read().state.username.is_none() }
}

/// One issued browser session: its store, CSRF token and gate controller.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub csrf: String,
    pub store: SessionStore,
    pub gate: Arc<GateController>,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session id generation failed: {0}")]
    Entropy(getrandom::Error),
}

type EntropySource = fn(&mut [u8]) -> Result<(), getrandom::Error>;

fn gen_id(fill: EntropySource) -> Result<String, SessionError> {
    let mut buf = [0u8; 32];
    fill(&mut buf).map_err(SessionError::Entropy)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<SessionToken, Session>,
    user_index: HashMap<String, HashSet<SessionToken>>,
}

/// Issues and tracks browser sessions. Cloning shares the registry.
#[derive(Debug, Clone)]
pub struct SessionManager {
    pub ttl: Duration,
    registry: Arc<RwLock<Registry>>,
    entropy: EntropySource,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, registry: Arc::new(RwLock::new(Registry::default())), entropy: getrandom::getrandom }
    }

    #[cfg(test)]
    pub(crate) fn with_entropy(mut self, entropy: EntropySource) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn issue(&self, record: &UserRecord) -> Result<Session, SessionError> {
        let token = gen_id(self.entropy)?;
        let csrf = gen_id(self.entropy)?;
        let now = Instant::now();
        let store = SessionStore::new();
        store.init(record);
        let sess = Session {
            token,
            csrf,
            store,
            gate: Arc::new(GateController::default()),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        {
            let mut reg = self.registry.write();
            reg.sessions.insert(sess.token.clone(), sess.clone());
            reg.user_index.entry(record.username.clone()).or_default().insert(sess.token.clone());
        }
        tprintln!("session.issue user={} ttl_secs={}", record.username, self.ttl.as_secs());
        Ok(sess)
    }

    /// Live session for a token. Each hit pushes the idle deadline out by `ttl`;
    /// expired sessions are cleared and dropped.
    pub fn validate(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        {
            let mut reg = self.registry.write();
            match reg.sessions.get_mut(token) {
                Some(s) if s.expires_at > now => {
                    s.expires_at = now + self.ttl;
                    return Some(s.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        self.remove(token);
        None
    }

    pub fn logout(&self, token: &str) -> Option<String> {
        let username = self.remove(token);
        if let Some(u) = &username {
            tprintln!("session.logout user={}", u);
        }
        username
    }

    pub fn revoke_user(&self, username: &str) -> usize {
        let tokens: Vec<SessionToken> = self.registry.read()
            .user_index.get(username)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let count = tokens.iter().filter(|t| self.remove(t).is_some()).count();
        tprintln!("session.revoke user={} count={}", username, count);
        count
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<SessionToken> = self.registry.read()
            .sessions.iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(t, _)| t.clone())
            .collect();
        stale.iter().filter(|t| self.remove(t).is_some()).count()
    }

    /// Whether the token is registered, without touching its idle deadline.
    pub fn contains(&self, token: &str) -> bool { self.registry.read().sessions.contains_key(token) }

    pub fn len(&self) -> usize { self.registry.read().sessions.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    // Removes the token and clears its store. Returns the username the session was issued to.
    fn remove(&self, token: &str) -> Option<String> {
        let mut reg = self.registry.write();
        let sess = reg.sessions.remove(token)?;
        let mut owner = None;
        for (user, set) in reg.user_index.iter_mut() {
            if set.remove(token) { owner = Some(user.clone()); }
        }
        reg.user_index.retain(|_, set| !set.is_empty());
        drop(reg);
        let current = sess.store.username();
        sess.store.clear();
        current.or(owner)
    }
}
