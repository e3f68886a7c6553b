//! Protected route surface. Each view declares the permission tag it needs and,
//! for organization-wide data views, the roles allowed to open it.

use crate::identity::{GateParams, Role};

pub const LOGIN_PATH: &str = "/login";
pub const ADMIN_LANDING: &str = "/dashboard/admin";
pub const USER_LANDING: &str = "/dashboard/user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedRoute {
    pub path: &'static str,
    pub permission: Option<&'static str>,
    pub admin_only: bool,
}

impl ProtectedRoute {
    const fn any(path: &'static str, permission: &'static str) -> Self {
        Self { path, permission: Some(permission), admin_only: false }
    }

    const fn admin(path: &'static str, permission: &'static str) -> Self {
        Self { path, permission: Some(permission), admin_only: true }
    }

    pub fn params(&self) -> GateParams {
        let mut p = GateParams::new();
        if let Some(tag) = self.permission { p = p.permission(tag); }
        if self.admin_only { p = p.roles([Role::Admin]); }
        p
    }
}

pub const ROUTES: &[ProtectedRoute] = &[
    ProtectedRoute::admin(ADMIN_LANDING, "dashboard"),
    ProtectedRoute::any(USER_LANDING, "dashboard"),
    ProtectedRoute::any("/dashboard/assign-task", "assign_task"),
    ProtectedRoute::any("/dashboard/license", "license"),
    ProtectedRoute::any("/dashboard/training", "training"),
    ProtectedRoute::any("/dashboard/profile", "profile"),
    ProtectedRoute::any("/dashboard/calendar", "calendar"),
    ProtectedRoute::admin("/dashboard/approvals", "approve_task"),
    ProtectedRoute::admin("/dashboard/housekeeping", "housekeeping"),
    ProtectedRoute::admin("/dashboard/stores", "stores"),
    ProtectedRoute::admin("/dashboard/hr", "hr"),
    ProtectedRoute::admin("/dashboard/security", "security"),
];

/// Tasks API: list and submit need the dashboard, assignment needs `assign_task`,
/// review is admin-only.
pub fn tasks_view() -> GateParams { GateParams::new().permission("dashboard") }
pub fn tasks_assign() -> GateParams { GateParams::new().permission("assign_task") }
pub fn tasks_review() -> GateParams { GateParams::new().permission("approve_task").roles([Role::Admin]) }

/// Gate inputs for a routed path. Trailing slashes are ignored.
pub fn resolve(path: &str) -> Option<&'static ProtectedRoute> {
    let p = path.trim_end_matches('/');
    ROUTES.iter().find(|r| r.path == p)
}

/// Where the denial screen's escape action leads.
pub fn landing_path(role: Option<Role>) -> &'static str {
    match role {
        Some(Role::Admin) => ADMIN_LANDING,
        _ => USER_LANDING,
    }
}
