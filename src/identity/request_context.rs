use axum::http::HeaderMap;

use super::session::{Session, SessionManager};

pub const SESSION_COOKIE: &str = "portal_session";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Identity attached to one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub token: Option<String>,
    pub session: Option<Session>,
    csrf_provided: Option<String>,
}

impl RequestContext {
    pub fn from_headers(sessions: &SessionManager, headers: &HeaderMap) -> Self {
        let token = parse_cookie(headers, SESSION_COOKIE);
        let session = token.as_deref().and_then(|t| sessions.validate(t));
        let csrf_provided = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
        Self { request_id: uuid::Uuid::new_v4().to_string(), token, session, csrf_provided }
    }

    pub fn username(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.store.username())
    }

    pub fn csrf_ok(&self) -> bool {
        match (&self.session, &self.csrf_provided) {
            (Some(s), Some(p)) => &s.csrf == p,
            _ => false,
        }
    }
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all("cookie").iter() {
        let Ok(s) = cookie.to_str() else { continue };
        for part in s.split(';') {
            if let Some((k, v)) = part.trim().split_once('=') {
                if k == name { return Some(v.to_string()); }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::principal::{Role, UserRecord};
    use axum::http::HeaderValue;

    #[test]
    fn parses_named_cookie() {
        let mut h = HeaderMap::new();
        h.insert("cookie", HeaderValue::from_static("theme=dark; portal_session=abc=; other=1"));
        assert_eq!(parse_cookie(&h, SESSION_COOKIE).as_deref(), Some("abc="));
        assert!(parse_cookie(&h, "missing").is_none());
    }

    #[test]
    fn context_resolves_session_and_csrf() {
        let sm = SessionManager::default();
        let sess = sm.issue(&UserRecord::new("bob", "pw", Role::User)).unwrap();
        let mut h = HeaderMap::new();
        h.insert("cookie", HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, sess.token)).unwrap());
        let ctx = RequestContext::from_headers(&sm, &h);
        assert_eq!(ctx.username().as_deref(), Some("bob"));
        assert!(!ctx.csrf_ok());
        h.insert(CSRF_HEADER, HeaderValue::from_str(&sess.csrf).unwrap());
        assert!(RequestContext::from_headers(&sm, &h).csrf_ok());

        let anon = RequestContext::from_headers(&sm, &HeaderMap::new());
        assert!(anon.session.is_none());
        assert!(!anon.csrf_ok());
    }
}
