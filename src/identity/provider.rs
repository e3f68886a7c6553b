use std::sync::Arc;

use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use password_hash::PasswordHash;
use tracing::{info, warn};

use super::directory::UserDirectory;
use super::session::{Session, SessionManager, SessionState};
use crate::routes;
use crate::tprintln;

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub session: Session,
    pub state: SessionState,
    pub landing: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("invalid_credentials")]
    InvalidCredentials,
    #[error("account_inactive")]
    Inactive,
    #[error("lookup_failed: {0}")]
    Lookup(String),
    #[error("session_unavailable: {0}")]
    Session(String),
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn login(&self, req: &LoginRequest) -> Result<LoginResponse, LoginError>;
}

/// Stored secrets are compared verbatim unless they are Argon2 PHC strings.
pub fn verify_password(stored: &str, given: &str) -> bool {
    if stored.starts_with("$argon2") {
        return match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default().verify_password(given.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        };
    }
    !stored.is_empty() && stored == given
}

/// Authenticates against the user directory and seeds a new session.
pub struct DirectoryAuthProvider {
    directory: Arc<dyn UserDirectory>,
    sessions: SessionManager,
}

impl DirectoryAuthProvider {
    pub fn new(directory: Arc<dyn UserDirectory>, sessions: SessionManager) -> Self {
        Self { directory, sessions }
    }
}

#[async_trait]
impl AuthProvider for DirectoryAuthProvider {
    async fn login(&self, req: &LoginRequest) -> Result<LoginResponse, LoginError> {
        let record = match self.directory.find_user(&req.username).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                info!(target: "auth", user = %req.username, "login rejected: unknown user");
                return Err(LoginError::InvalidCredentials);
            }
            Err(e) => {
                warn!(target: "auth", user = %req.username, "login lookup failed: {}", e);
                return Err(LoginError::Lookup(e.to_string()));
            }
        };
        if !verify_password(&record.password, &req.password) {
            info!(target: "auth", user = %req.username, "login rejected: bad password");
            return Err(LoginError::InvalidCredentials);
        }
        if !record.is_active() {
            info!(target: "auth", user = %req.username, "login rejected: account inactive");
            return Err(LoginError::Inactive);
        }
        let session = self.sessions.issue(&record).map_err(|e| {
            warn!(target: "auth", user = %record.username, "login could not issue a session: {}", e);
            LoginError::Session(e.to_string())
        })?;
        let state = session.store.snapshot();
        tprintln!("auth.login user={} role={} ip={:?}", record.username, record.role, req.ip);
        info!(target: "auth", user = %record.username, role = %record.role, "login ok");
        Ok(LoginResponse { session, state, landing: routes::landing_path(Some(record.role)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::directory::MemoryUserDirectory;
    use crate::identity::principal::{AccountStatus, Role, UserRecord};
    use argon2::PasswordHasher;
    use password_hash::SaltString;

    fn provider(dir: Arc<MemoryUserDirectory>) -> DirectoryAuthProvider {
        DirectoryAuthProvider::new(dir, SessionManager::default())
    }

    fn req(u: &str, p: &str) -> LoginRequest {
        LoginRequest { username: u.into(), password: p.into(), ip: None }
    }

    #[test]
    fn verbatim_and_argon2_passwords() {
        assert!(verify_password("secret", "secret"));
        assert!(!verify_password("secret", "Secret"));
        assert!(!verify_password("", ""));
        let salt = SaltString::encode_b64(b"0123456789abcdef").unwrap();
        let phc = Argon2::default().hash_password(b"secret", &salt).unwrap().to_string();
        assert!(verify_password(&phc, "secret"));
        assert!(!verify_password(&phc, "nope"));
        assert!(!verify_password("$argon2id$garbage", "secret"));
    }

    #[tokio::test]
    async fn login_seeds_session() {
        let dir = Arc::new(MemoryUserDirectory::from_records([
            UserRecord::new("carol", "pw", Role::Admin).with_department("Ops"),
            UserRecord::new("bob", "pw", Role::User).with_access("dashboard"),
        ]));
        let p = provider(dir);
        let r = p.login(&req("carol", "pw")).await.unwrap();
        assert_eq!(r.state.user_access.as_deref(), Some("all"));
        assert_eq!(r.state.department.as_deref(), Some("Ops"));
        assert_eq!(r.landing, "/dashboard/admin");
        let r = p.login(&req("bob", "pw")).await.unwrap();
        assert_eq!(r.state.user_access.as_deref(), Some("dashboard"));
        assert_eq!(r.landing, routes::landing_path(Some(Role::User)));
    }

    #[tokio::test]
    async fn login_rejections() {
        let dir = Arc::new(MemoryUserDirectory::from_records([
            UserRecord::new("bob", "pw", Role::User),
            UserRecord::new("dave", "pw", Role::User).with_status(AccountStatus::Inactive),
        ]));
        let p = provider(dir.clone());
        assert!(matches!(p.login(&req("bob", "bad")).await, Err(LoginError::InvalidCredentials)));
        assert!(matches!(p.login(&req("nobody", "pw")).await, Err(LoginError::InvalidCredentials)));
        assert!(matches!(p.login(&req("dave", "pw")).await, Err(LoginError::Inactive)));
        // wrong password on an inactive account does not reveal the status
        assert!(matches!(p.login(&req("dave", "bad")).await, Err(LoginError::InvalidCredentials)));
        dir.set_offline(true);
        assert!(matches!(p.login(&req("bob", "pw")).await, Err(LoginError::Lookup(_))));
    }

    #[tokio::test]
    async fn login_fails_when_no_session_id_can_be_drawn() {
        let dir = Arc::new(MemoryUserDirectory::from_records([UserRecord::new("bob", "pw", Role::User)]));
        let sessions = SessionManager::default().with_entropy(|_| Err(getrandom::Error::UNSUPPORTED));
        let p = DirectoryAuthProvider::new(dir, sessions.clone());
        assert!(matches!(p.login(&req("bob", "pw")).await, Err(LoginError::Session(_))));
        assert!(sessions.is_empty());
    }
}
