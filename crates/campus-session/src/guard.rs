//! Route guarding
//!
//! Pure predicate composition over the session manager's live state. A
//! still-resolving session is reported as [`AccessDecision::Pending`] so the
//! UI can show a neutral loading state instead of flashing access-denied
//! before the session settles.

use std::sync::Arc;

use crate::portal::PortalKind;
use crate::session::SessionManager;
use crate::types::Role;

/// What a protected view demands. Empty role/permission lists mean "any".
#[derive(Debug, Clone, Default)]
pub struct AccessRequirement {
    pub roles: Vec<Role>,
    pub permissions: Vec<String>,
    pub portal: Option<PortalKind>,
}

impl AccessRequirement {
    #[must_use]
    pub fn any_authenticated() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_roles(mut self, roles: Vec<Role>) -> Self {
        self.roles = roles;
        self
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    #[must_use]
    pub const fn with_portal(mut self, portal: PortalKind) -> Self {
        self.portal = Some(portal);
        self
    }
}

/// Why access was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MissingRole,
    MissingPermission,
    WrongPortal,
}

/// Outcome of a navigation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// No valid session; send the user to the login view.
    RedirectToLogin,
    Deny(DenyReason),
    /// Session is still resolving (login or refresh in flight).
    Pending,
}

/// Guards navigation against the current session.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    session: Arc<SessionManager>,
}

impl RouteGuard {
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn can_access(&self, requirement: &AccessRequirement) -> bool {
        matches!(self.decide(requirement), AccessDecision::Allow)
    }

    #[must_use]
    pub fn decide(&self, requirement: &AccessRequirement) -> AccessDecision {
        if self.session.state().is_pending() {
            return AccessDecision::Pending;
        }

        if !self.session.is_authenticated() {
            return AccessDecision::RedirectToLogin;
        }
        let Some(user) = self.session.current_user() else {
            return AccessDecision::RedirectToLogin;
        };

        if let Some(required_portal) = requirement.portal
            && self.session.portal().kind() != required_portal
        {
            tracing::debug!(
                required = %required_portal,
                actual = %self.session.portal().kind(),
                "Navigation denied: wrong portal"
            );
            return AccessDecision::Deny(DenyReason::WrongPortal);
        }

        if !requirement.roles.is_empty() && !requirement.roles.contains(&user.role) {
            tracing::debug!(
                user = %user.id,
                role = %user.role,
                "Navigation denied: role not allowed"
            );
            return AccessDecision::Deny(DenyReason::MissingRole);
        }

        if !requirement.permissions.is_empty() {
            let granted = self.session.permissions();
            if !granted.contains_all(requirement.permissions.iter().map(String::as_str)) {
                tracing::debug!(user = %user.id, "Navigation denied: missing permission");
                return AccessDecision::Deny(DenyReason::MissingPermission);
            }
        }

        AccessDecision::Allow
    }
}
