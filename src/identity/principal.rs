use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Session value of `user_access` for administrators.
pub const ALL_ACCESS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn is_admin(&self) -> bool { matches!(self, Role::Admin) }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Inactive,
}

impl FromStr for AccountStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(AccountStatus::Active),
            "inactive" => Ok(AccountStatus::Inactive),
            other => Err(format!("unknown account status '{}'", other)),
        }
    }
}

// Legacy rows carry a NULL status; those accounts predate deactivation and count as active.
fn status_or_active<'de, D: Deserializer<'de>>(d: D) -> Result<AccountStatus, D::Error> {
    match Option::<String>::deserialize(d)? {
        None => Ok(AccountStatus::Active),
        Some(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Opaque capability name such as `dashboard` or `assign_task`. Matching is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionTag(String);

impl PermissionTag {
    pub fn new(tag: impl Into<String>) -> Self { Self(tag.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PermissionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for PermissionTag {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Parsed `user_access` field. Built once when a record crosses the data boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    tags: BTreeSet<PermissionTag>,
}

impl PermissionSet {
    /// Split on `,` with no whitespace normalization; empty segments carry no tag.
    pub fn parse(raw: &str) -> Self {
        let tags = raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(PermissionTag::new)
            .collect();
        Self { tags }
    }

    pub fn contains(&self, tag: &PermissionTag) -> bool { self.tags.contains(tag) }
    pub fn len(&self) -> usize { self.tags.len() }
    pub fn is_empty(&self) -> bool { self.tags.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &PermissionTag> { self.tags.iter() }
}

/// Access a user effectively holds: everything for admins, the tag set otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveAccess {
    All,
    Tags { raw: String, set: PermissionSet },
}

impl EffectiveAccess {
    pub fn for_role(role: Role, user_access: Option<&str>) -> Self {
        match role {
            Role::Admin => EffectiveAccess::All,
            Role::User => {
                let raw = user_access.unwrap_or_default().to_string();
                let set = PermissionSet::parse(&raw);
                EffectiveAccess::Tags { raw, set }
            }
        }
    }

    /// Value stored in the session's `user_access` field.
    pub fn session_value(&self) -> &str {
        match self {
            EffectiveAccess::All => ALL_ACCESS,
            EffectiveAccess::Tags { raw, .. } => raw.as_str(),
        }
    }

    pub fn permits(&self, tag: &PermissionTag) -> bool {
        match self {
            EffectiveAccess::All => true,
            EffectiveAccess::Tags { set, .. } => set.contains(tag),
        }
    }
}

/// Authoritative `users` row.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub user_access: Option<String>,
    #[serde(default, deserialize_with = "status_or_active")]
    pub status: AccountStatus,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

impl UserRecord {
    pub fn new(username: &str, password: &str, role: Role) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            role,
            user_access: None,
            status: AccountStatus::Active,
            full_name: None,
            department: None,
        }
    }

    pub fn with_access(mut self, access: &str) -> Self { self.user_access = Some(access.to_string()); self }
    pub fn with_department(mut self, dept: &str) -> Self { self.department = Some(dept.to_string()); self }
    pub fn with_status(mut self, status: AccountStatus) -> Self { self.status = status; self }

    pub fn is_active(&self) -> bool { self.status == AccountStatus::Active }

    pub fn effective_access(&self) -> EffectiveAccess {
        EffectiveAccess::for_role(self.role, self.user_access.as_deref())
    }
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("role", &self.role)
            .field("user_access", &self.user_access)
            .field("status", &self.status)
            .field("full_name", &self.full_name)
            .field("department", &self.department)
            .finish()
    }
}
