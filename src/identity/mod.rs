//! Identity, sessions and route authorization for the portal.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod directory;
mod provider;
mod request_context;
mod authorizer;

pub use principal::{AccountStatus, EffectiveAccess, PermissionSet, PermissionTag, Role, UserRecord, ALL_ACCESS};
pub use session::{Session, SessionError, SessionField, SessionManager, SessionState, SessionStore, SessionToken, SessionUpdate};
pub use directory::{single_record, DirectoryError, MemoryUserDirectory, RestUserDirectory, UserDirectory};
pub use provider::{verify_password, AuthProvider, DirectoryAuthProvider, LoginError, LoginRequest, LoginResponse};
pub use request_context::{parse_cookie, RequestContext, CSRF_HEADER, SESSION_COOKIE};
pub use authorizer::{AccessGate, Activation, ActivationKey, DecisionCache, GateController, GateParams, GateState, Verdict};
