//! Service configuration, read once from `PORTAL_*` environment variables.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortalConfig {
    pub http_port: u16,
    /// Base URL of the hosted backend's REST surface. When unset the in-memory backend is used.
    pub backend_url: Option<String>,
    pub backend_key: Option<String>,
    pub backend_timeout_ms: u64,
    pub session_ttl_secs: u64,
    /// Decision cache ttl for authorized verdicts; 0 disables.
    pub authz_cache_allow_ms: u64,
    /// Decision cache ttl for unauthorized verdicts; 0 disables.
    pub authz_cache_deny_ms: u64,
    /// JSON file with `{"users": [...], "tasks": [...]}` for the in-memory backend
    pub seed_file: Option<String>,
    pub secure_cookies: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            http_port: 7878,
            backend_url: None,
            backend_key: None,
            backend_timeout_ms: 10_000,
            session_ttl_secs: 60 * 60,
            authz_cache_allow_ms: 0,
            authz_cache_deny_ms: 0,
            seed_file: None,
            secure_cookies: true,
        }
    }
}

impl PortalConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();
        if let Some(v) = get("PORTAL_HTTP_PORT") { cfg.http_port = parse_num("PORTAL_HTTP_PORT", &v)?; }
        cfg.backend_url = get("PORTAL_BACKEND_URL");
        cfg.backend_key = get("PORTAL_BACKEND_KEY");
        if let Some(v) = get("PORTAL_BACKEND_TIMEOUT_MS") { cfg.backend_timeout_ms = parse_num("PORTAL_BACKEND_TIMEOUT_MS", &v)?; }
        if let Some(v) = get("PORTAL_SESSION_TTL_SECS") { cfg.session_ttl_secs = parse_num("PORTAL_SESSION_TTL_SECS", &v)?; }
        if let Some(v) = get("PORTAL_AUTHZ_CACHE_ALLOW_MS") { cfg.authz_cache_allow_ms = parse_num("PORTAL_AUTHZ_CACHE_ALLOW_MS", &v)?; }
        if let Some(v) = get("PORTAL_AUTHZ_CACHE_DENY_MS") { cfg.authz_cache_deny_ms = parse_num("PORTAL_AUTHZ_CACHE_DENY_MS", &v)?; }
        cfg.seed_file = get("PORTAL_SEED_FILE");
        if let Some(v) = get("PORTAL_SECURE_COOKIES") {
            cfg.secure_cookies = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => return Err(anyhow!("PORTAL_SECURE_COOKIES: expected boolean, got '{}'", other)),
            };
        }
        if cfg.session_ttl_secs == 0 {
            return Err(anyhow!("PORTAL_SESSION_TTL_SECS must be positive"));
        }
        Ok(cfg)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, v: &str) -> Result<T> {
    v.parse::<T>().map_err(|_| anyhow!("{}: expected a number, got '{}'", key, v))
}
