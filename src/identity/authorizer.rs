//! Route access gate: re-reads the authoritative user row on every activation,
//! reconciles the session with it, then applies the role and permission checks.
//! Any failure to verify the row denies; only an inactive account or a missing
//! session sends the user back to the login view.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::directory::UserDirectory;
use super::principal::{PermissionTag, Role, UserRecord};
use super::session::SessionStore;
use crate::error::GateError;
use crate::routes;

/// Per-route gate inputs. An empty role set places no role restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GateParams {
    pub allowed_roles: BTreeSet<Role>,
    pub required_permission: Option<PermissionTag>,
}

impl GateParams {
    pub fn new() -> Self { Self::default() }

    pub fn permission(mut self, tag: &str) -> Self {
        self.required_permission = Some(PermissionTag::new(tag));
        self
    }

    pub fn roles<I: IntoIterator<Item = Role>>(mut self, roles: I) -> Self {
        self.allowed_roles = roles.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    RedirectToLogin { location: String },
    Denied {
        permission: Option<PermissionTag>,
        message: String,
        escape_to: String,
    },
    Authorized { role: Role },
}

impl Verdict {
    fn redirect() -> Self { Verdict::RedirectToLogin { location: routes::LOGIN_PATH.to_string() } }

    fn denied(permission: Option<PermissionTag>, role: Option<Role>) -> Self {
        let message = match &permission {
            Some(p) => format!("Access denied: you do not have the '{}' permission.", p),
            None => "Access denied.".to_string(),
        };
        Verdict::Denied { permission, message, escape_to: routes::landing_path(role).to_string() }
    }

    pub fn is_authorized(&self) -> bool { matches!(self, Verdict::Authorized { .. }) }
    pub fn is_redirect(&self) -> bool { matches!(self, Verdict::RedirectToLogin { .. }) }
    pub fn is_denied(&self) -> bool { matches!(self, Verdict::Denied { .. }) }
}

/// `Unchecked → Loading → {Redirect, Denied, Authorized}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Unchecked,
    Loading,
    Done { verdict: Verdict },
}

/// Identity and inputs an activation was started for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivationKey {
    pub username: Option<String>,
    pub params: GateParams,
}

/// Handle for one in-flight activation.
#[derive(Debug, Clone)]
pub struct Activation {
    generation: u64,
    session_epoch: u64,
    pub key: ActivationKey,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    key: Option<ActivationKey>,
    state: GateState,
}

impl Default for Slot {
    fn default() -> Self { Self { generation: 0, key: None, state: GateState::Unchecked } }
}

/// Tracks the current activation of one session's gate so that a lookup which
/// resolves after a newer activation started is dropped instead of applied.
#[derive(Debug, Default)]
pub struct GateController {
    slot: Mutex<Slot>,
}

impl GateController {
    pub fn state(&self) -> GateState { self.slot.lock().state.clone() }

    pub fn current_key(&self) -> Option<ActivationKey> { self.slot.lock().key.clone() }

    /// Start a new activation. Any earlier activation still in flight is superseded.
    pub fn begin(&self, key: ActivationKey, session: &SessionStore) -> Activation {
        let mut s = self.slot.lock();
        s.generation += 1;
        s.key = Some(key.clone());
        s.state = GateState::Loading;
        Activation { generation: s.generation, session_epoch: session.epoch(), key }
    }

    fn is_current(&self, act: &Activation, session: &SessionStore) -> bool {
        self.slot.lock().generation == act.generation && session.epoch() == act.session_epoch
    }

    fn finish(&self, act: &Activation, verdict: &Verdict) -> bool {
        let mut s = self.slot.lock();
        if s.generation != act.generation { return false; }
        s.state = GateState::Done { verdict: verdict.clone() };
        true
    }

    /// Forget the last verdict; the next activation starts from `Unchecked`.
    pub fn reset(&self) {
        let mut s = self.slot.lock();
        s.generation += 1;
        s.key = None;
        s.state = GateState::Unchecked;
    }
}

#[derive(Debug, Clone)]
struct CachedDecision {
    verdict: Verdict,
    expires_at: Instant,
}

/// Short-lived `(username, route)` decision cache. Disabled when both ttls are zero.
#[derive(Debug, Clone)]
pub struct DecisionCache {
    ttl_allow: Duration,
    ttl_deny: Duration,
    entries: Arc<RwLock<HashMap<(String, GateParams), CachedDecision>>>,
}

impl Default for DecisionCache {
    fn default() -> Self { Self::new(Duration::ZERO, Duration::ZERO) }
}

impl DecisionCache {
    pub fn new(ttl_allow: Duration, ttl_deny: Duration) -> Self {
        Self { ttl_allow, ttl_deny, entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn enabled(&self) -> bool { !self.ttl_allow.is_zero() || !self.ttl_deny.is_zero() }

    fn get(&self, username: &str, params: &GateParams) -> Option<Verdict> {
        if !self.enabled() { return None; }
        let key = (username.to_string(), params.clone());
        let now = Instant::now();
        {
            let m = self.entries.read();
            match m.get(&key) {
                Some(c) if c.expires_at > now => return Some(c.verdict.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().remove(&key);
        None
    }

    fn put(&self, username: &str, params: &GateParams, verdict: &Verdict) {
        let ttl = match verdict {
            Verdict::Authorized { .. } => self.ttl_allow,
            Verdict::Denied { .. } => self.ttl_deny,
            Verdict::RedirectToLogin { .. } => return,
        };
        if ttl.is_zero() { return; }
        let entry = CachedDecision { verdict: verdict.clone(), expires_at: Instant::now() + ttl };
        self.entries.write().insert((username.to_string(), params.clone()), entry);
    }

    pub fn invalidate_user(&self, username: &str) -> usize {
        let mut m = self.entries.write();
        let before = m.len();
        m.retain(|(u, _), _| u != username);
        before - m.len()
    }

    pub fn clear(&self) { self.entries.write().clear(); }
    pub fn len(&self) -> usize { self.entries.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

enum SessionEffect {
    Keep,
    Clear,
    Reconcile { role: Role, access: String },
}

struct Judgement {
    verdict: Verdict,
    effect: SessionEffect,
    cacheable: bool,
    error: Option<GateError>,
}

/// Pure decision over a lookup outcome. `cached_role` only picks the denial
/// escape target when no record could be read.
fn judge(
    username: &str,
    lookup: Result<Option<UserRecord>, String>,
    params: &GateParams,
    cached_role: Option<Role>,
) -> Judgement {
    let record = match lookup {
        Ok(Some(r)) => r,
        Ok(None) => {
            return Judgement {
                verdict: Verdict::denied(params.required_permission.clone(), cached_role),
                effect: SessionEffect::Keep,
                cacheable: false,
                error: Some(GateError::RecordAbsent(username.to_string())),
            };
        }
        Err(detail) => {
            return Judgement {
                verdict: Verdict::denied(params.required_permission.clone(), cached_role),
                effect: SessionEffect::Keep,
                cacheable: false,
                error: Some(GateError::LookupFailure { username: username.to_string(), detail }),
            };
        }
    };

    if !record.is_active() {
        return Judgement {
            verdict: Verdict::redirect(),
            effect: SessionEffect::Clear,
            cacheable: false,
            error: Some(GateError::AccountInactive(username.to_string())),
        };
    }

    let access = record.effective_access();
    let effect = SessionEffect::Reconcile { role: record.role, access: access.session_value().to_string() };

    let role_ok = params.allowed_roles.is_empty() || params.allowed_roles.contains(&record.role);
    let perm_ok = match &params.required_permission {
        Some(tag) if !record.role.is_admin() => access.permits(tag),
        _ => true,
    };

    if role_ok && perm_ok {
        Judgement { verdict: Verdict::Authorized { role: record.role }, effect, cacheable: true, error: None }
    } else {
        Judgement {
            verdict: Verdict::denied(params.required_permission.clone(), Some(record.role)),
            effect,
            cacheable: true,
            error: Some(GateError::Unauthorized {
                username: username.to_string(),
                permission: params.required_permission.as_ref().map(|p| p.to_string()),
            }),
        }
    }
}

/// The access gate. Cheap to clone; shares its directory and cache.
#[derive(Clone)]
pub struct AccessGate {
    directory: Arc<dyn UserDirectory>,
    cache: DecisionCache,
}

impl AccessGate {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory, cache: DecisionCache::default() }
    }

    pub fn with_cache(mut self, cache: DecisionCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &DecisionCache { &self.cache }

    /// Run one activation against `session` and apply its effects.
    pub async fn evaluate(&self, session: &SessionStore, params: &GateParams) -> Verdict {
        let Some(username) = session.username() else {
            debug!(target: "gate", "{}", GateError::NoSession);
            return Verdict::redirect();
        };
        if let Some(v) = self.cache.get(&username, params) {
            debug!(target: "gate", user = %username, "decision cache hit");
            return v;
        }
        let epoch = session.epoch();
        let j = self.lookup_and_judge(&username, session, params).await;
        self.apply(&username, session, epoch, params, j)
    }

    /// Like [`AccessGate::evaluate`], tracked by `controller`. Returns `None` when the
    /// activation was superseded before its lookup resolved; nothing is applied then.
    pub async fn activate(&self, controller: &GateController, session: &SessionStore, params: &GateParams) -> Option<Verdict> {
        let username = session.username();
        let act = controller.begin(ActivationKey { username: username.clone(), params: params.clone() }, session);

        let Some(username) = username else {
            let v = Verdict::redirect();
            return controller.finish(&act, &v).then_some(v);
        };
        if let Some(v) = self.cache.get(&username, params) {
            return controller.finish(&act, &v).then_some(v);
        }

        let j = self.lookup_and_judge(&username, session, params).await;
        if !controller.is_current(&act, session) {
            debug!(target: "gate", user = %username, "activation superseded; result discarded");
            return None;
        }
        let v = self.apply(&username, session, act.session_epoch, params, j);
        controller.finish(&act, &v).then_some(v)
    }

    async fn lookup_and_judge(&self, username: &str, session: &SessionStore, params: &GateParams) -> Judgement {
        let lookup = self.directory.find_user(username).await.map_err(|e| e.to_string());
        judge(username, lookup, params, session.role())
    }

    /// Apply a judgement made from a lookup started at session `epoch`. If the
    /// session was cleared or re-identified meanwhile nothing is written back and
    /// the caller gets a redirect.
    fn apply(&self, username: &str, session: &SessionStore, epoch: u64, params: &GateParams, j: Judgement) -> Verdict {
        match j.error.as_ref() {
            Some(e @ (GateError::LookupFailure { .. } | GateError::RecordAbsent(_))) => {
                warn!(target: "gate", user = %username, "denied: {}", e);
            }
            Some(e) if e.redirects() => {
                info!(target: "gate", user = %username, "{}; session cleared", e);
            }
            Some(e) => debug!(target: "gate", user = %username, "{}", e),
            None => {}
        }
        match j.effect {
            SessionEffect::Keep => {}
            SessionEffect::Clear => {
                session.clear();
                self.cache.invalidate_user(username);
            }
            SessionEffect::Reconcile { role, access } => match session.update(epoch, role, &access) {
                Some(true) => { self.cache.invalidate_user(username); }
                Some(false) => {}
                None => {
                    debug!(target: "gate", user = %username, "session changed during lookup; verdict dropped");
                    return Verdict::redirect();
                }
            },
        }
        if j.cacheable {
            self.cache.put(username, params, &j.verdict);
        }
        j.verdict
    }
}
