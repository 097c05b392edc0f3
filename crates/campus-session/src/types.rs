//! Session data model
//!
//! Wire and persistence shapes shared across the crate. `Credentials` and
//! `TokenPair` redact their secrets in `Debug` output so tokens and
//! passwords never reach logs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// User role within the platform.
///
/// Kebab-case on the wire. `PlatformAdmin` is the only role scoped to the
/// operator portal; the rest belong to a tenant school.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    PlatformAdmin,
    SchoolAdmin,
    Teacher,
    Student,
    Parent,
    Staff,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PlatformAdmin => "platform-admin",
            Self::SchoolAdmin => "school-admin",
            Self::Teacher => "teacher",
            Self::Student => "student",
            Self::Parent => "parent",
            Self::Staff => "staff",
        }
    }

    /// True for roles that operate the platform itself rather than a school.
    #[must_use]
    pub const fn is_platform(&self) -> bool {
        matches!(self, Self::PlatformAdmin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant (school) the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRef {
    pub id: String,
    pub name: String,
    /// URL-safe subdomain label, e.g. `greenwood` in `greenwood.campus.school`.
    pub slug: String,
}

/// Authenticated user snapshot, cached alongside the tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub tenant: Option<TenantRef>,
}

/// Access/refresh token pair.
///
/// The refresh token is optional: short-lived logins (`remember_me = false`)
/// may not receive one, which is what makes `NoRefreshToken` reachable.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_len", &self.access.len())
            .field("has_refresh", &self.refresh.is_some())
            .finish_non_exhaustive()
    }
}

/// Login form input. Ephemeral, never persisted.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub remember_me: bool,
}

impl Credentials {
    #[must_use]
    pub const fn new(email: String, password: String, remember_me: bool) -> Self {
        Self {
            email,
            password,
            remember_me,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("remember_me", &self.remember_me)
            .finish_non_exhaustive()
    }
}

/// Capability tokens granted to the current user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(HashSet<String>);

impl PermissionSet {
    #[must_use]
    pub fn new() -> Self {
        Self(HashSet::new())
    }

    #[must_use]
    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    /// True when every listed capability is granted.
    #[must_use]
    pub fn contains_all<'a, I>(&self, capabilities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        capabilities.into_iter().all(|c| self.contains(c))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<String> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(String::from).collect())
    }
}
