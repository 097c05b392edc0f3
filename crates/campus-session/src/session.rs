//! Session lifecycle state machine
//!
//! Owns login, logout, silent refresh and expiry detection. One manager is
//! constructed per page load by the composition root, with the store, clock
//! and API injected so the whole lifecycle is testable against fakes.
//!
//! Refresh discipline: the scheduled [`SessionRefreshTask`] is the only
//! thing that initiates a timed refresh, armed at the token's known expiry
//! minus the threshold. Reads ([`SessionManager::is_authenticated`]) only
//! self-heal expired or undecodable state; they never refresh, so the two
//! paths cannot race each other into duplicate calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::AuthApi;
use crate::claims::decode_unverified;
use crate::clock::{Clock, SystemClock};
use crate::error::{AuthError, Result};
use crate::portal::PortalContext;
use crate::store::{StoredSession, TokenStore};
use crate::types::{Credentials, PermissionSet, Role, SessionUser, TokenPair};

/// Default window before expiry in which the access token is renewed.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(300);
/// Default pause before retrying a transiently failed scheduled refresh.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
    Expired,
    Failed,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// True while an operation is in flight and the outcome is unknown.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Authenticating | Self::Refreshing)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The session manager.
pub struct SessionManager {
    api: Arc<dyn AuthApi>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    portal: PortalContext,
    refresh_threshold: Duration,
    state: RwLock<SessionState>,
    /// Single-flight gate: whoever holds it performs the refresh, everyone
    /// else re-checks freshness after acquiring and finds nothing to do.
    refresh_gate: tokio::sync::Mutex<()>,
    /// Bumped on every successful token acquisition; lets the 401 path tell
    /// "refreshed while I waited" apart from "still stale".
    refresh_epoch: AtomicU64,
    /// Re-arms the scheduled refresh task after login/refresh/logout.
    rearm: tokio::sync::Notify,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("portal", &self.portal)
            .field("state", &*self.state.read())
            .field("refresh_threshold", &self.refresh_threshold)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(api: Arc<dyn AuthApi>, store: Arc<dyn TokenStore>, portal: PortalContext) -> Self {
        Self {
            api,
            store,
            clock: Arc::new(SystemClock),
            portal,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            state: RwLock::new(SessionState::Anonymous),
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_epoch: AtomicU64::new(0),
            rearm: tokio::sync::Notify::new(),
        }
    }

    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    #[must_use]
    pub const fn portal(&self) -> &PortalContext {
        &self.portal
    }

    /// Authenticate against the portal-appropriate login endpoint.
    ///
    /// On success the session is persisted and the refresh task re-armed; on
    /// failure the state returns to `Anonymous` and the typed error is
    /// surfaced as-is.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionUser> {
        self.set_state(SessionState::Authenticating);

        let response = match self.api.login(&self.portal, credentials).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Login failed");
                self.set_state(SessionState::Anonymous);
                return Err(e);
            }
        };

        let claims = match decode_unverified(&response.access_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!("Login response carried an undecodable access token");
                self.set_state(SessionState::Anonymous);
                return Err(e);
            }
        };

        if let Err(e) = ensure_portal_consistency(response.user.role, &self.portal) {
            tracing::warn!(
                role = %response.user.role,
                portal = %self.portal.kind(),
                "Rejecting login: role does not belong to this portal"
            );
            self.set_state(SessionState::Anonymous);
            return Err(e);
        }

        let session = StoredSession {
            tokens: TokenPair {
                access: response.access_token,
                refresh: response.refresh_token,
            },
            user: response.user,
            permissions: response.permissions,
        };

        if let Err(e) = self.store.save(&session) {
            self.set_state(SessionState::Anonymous);
            return Err(e);
        }

        self.set_state(SessionState::Authenticated);
        self.refresh_epoch.fetch_add(1, Ordering::AcqRel);
        self.rearm.notify_one();
        tracing::info!(
            user = %session.user.id,
            role = %session.user.role,
            exp = claims.exp,
            "Login successful"
        );
        Ok(session.user)
    }

    /// End the session. Never fails: the local clear is authoritative and
    /// happens first, then the server is told best-effort.
    pub async fn logout(&self) {
        let refresh_token = self
            .store
            .load()
            .ok()
            .flatten()
            .and_then(|s| s.tokens.refresh);

        self.store.clear();
        self.set_state(SessionState::Anonymous);
        self.rearm.notify_one();

        if let Some(token) = refresh_token {
            if let Err(e) = self.api.logout(&token).await {
                tracing::debug!(error = %e, "Server-side logout failed (ignored)");
            }
        }
        tracing::info!("Logged out");
    }

    /// Whether a valid session exists right now.
    ///
    /// Computed, never cached: the stored access token is re-decoded on
    /// every call, so a clear done by another manager sharing the store is
    /// observed immediately. Expired or undecodable stored state is cleared
    /// as a side effect (self-healing) and reported as unauthenticated.
    pub fn is_authenticated(&self) -> bool {
        let session = match self.store.load() {
            Ok(Some(session)) => session,
            Ok(None) => {
                // Logged out elsewhere, or never logged in
                if !self.state().is_pending() {
                    self.set_state(SessionState::Anonymous);
                }
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session storage unreadable");
                return false;
            }
        };

        let claims = match decode_unverified(&session.tokens.access) {
            Ok(claims) => claims,
            Err(_) => {
                tracing::warn!("Stored access token undecodable, clearing session");
                self.set_state(SessionState::Failed);
                self.store.clear();
                self.set_state(SessionState::Anonymous);
                return false;
            }
        };

        if claims.is_expired(self.clock.now_epoch()) {
            tracing::debug!(exp = claims.exp, "Access token expired, clearing session");
            self.set_state(SessionState::Expired);
            self.store.clear();
            self.set_state(SessionState::Anonymous);
            return false;
        }

        // Restore after a page reload: a fresh manager over a valid store
        if self.state() == SessionState::Anonymous {
            self.set_state(SessionState::Authenticated);
        }
        true
    }

    /// Last-known permissions; empty when unauthenticated.
    #[must_use]
    pub fn permissions(&self) -> PermissionSet {
        if !self.is_authenticated() {
            return PermissionSet::new();
        }
        self.store
            .load()
            .ok()
            .flatten()
            .map(|s| s.permissions)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn current_user(&self) -> Option<SessionUser> {
        if !self.is_authenticated() {
            return None;
        }
        self.store.load().ok().flatten().map(|s| s.user)
    }

    /// Current bearer token, only while the session is valid.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        if !self.is_authenticated() {
            return None;
        }
        self.store.load().ok().flatten().map(|s| s.tokens.access)
    }

    /// Renew the access token if it is inside the refresh window.
    ///
    /// Idempotent and safe to call concurrently: callers collapse onto a
    /// single in-flight refresh. An access token that is already expired
    /// still attempts the refresh as long as a refresh token is stored;
    /// without one the session transitions straight to expired.
    pub async fn refresh_if_needed(&self) -> Result<()> {
        if !self.refresh_due()? {
            return Ok(());
        }
        let _gate = self.refresh_gate.lock().await;
        if !self.refresh_due()? {
            // Someone else refreshed while we waited on the gate
            return Ok(());
        }
        self.refresh_locked().await
    }

    /// Refresh path for a request the gateway saw rejected with 401.
    ///
    /// Unlike [`Self::refresh_if_needed`] this ignores the expiry window
    /// (the server already voted), but still collapses with any concurrent
    /// refresh via the epoch check.
    pub async fn refresh_after_reject(&self) -> Result<()> {
        let seen = self.refresh_epoch.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;
        if self.refresh_epoch.load(Ordering::Acquire) != seen {
            return Ok(());
        }
        self.refresh_locked().await
    }

    /// Re-fetch user and permissions from the profile endpoint and persist
    /// them alongside the current tokens.
    pub async fn reload_profile(&self) -> Result<SessionUser> {
        let Some(mut session) = self.store.load()? else {
            return Err(AuthError::NotAuthenticated);
        };

        let response = self.api.profile(&session.tokens.access).await?;
        ensure_portal_consistency(response.user.role, &self.portal)?;

        session.user = response.user.clone();
        session.permissions = response.permissions;
        self.store.save(&session)?;
        Ok(response.user)
    }

    fn refresh_due(&self) -> Result<bool> {
        let Some(session) = self.store.load()? else {
            return Ok(false);
        };
        let claims = decode_unverified(&session.tokens.access)?;
        Ok(claims.expires_within(self.clock.now_epoch(), self.refresh_threshold))
    }

    async fn refresh_locked(&self) -> Result<()> {
        let Some(session) = self.store.load()? else {
            return Ok(());
        };
        let claims = decode_unverified(&session.tokens.access)?;

        let Some(refresh_token) = session.tokens.refresh.clone() else {
            if claims.is_expired(self.clock.now_epoch()) {
                tracing::debug!("Access token expired with no refresh token, session over");
                self.set_state(SessionState::Expired);
                self.store.clear();
                self.set_state(SessionState::Anonymous);
                self.rearm.notify_one();
            }
            return Err(AuthError::NoRefreshToken);
        };

        self.set_state(SessionState::Refreshing);
        tracing::debug!(exp = claims.exp, "Refreshing access token");

        match self.api.refresh(&refresh_token).await {
            Ok(response) => {
                let new_claims = match decode_unverified(&response.access_token) {
                    Ok(claims) => claims,
                    Err(e) => {
                        tracing::warn!("Refresh response carried an undecodable access token");
                        self.set_state(SessionState::Failed);
                        self.store.clear();
                        self.set_state(SessionState::Anonymous);
                        self.rearm.notify_one();
                        return Err(e);
                    }
                };

                let mut session = session;
                session.tokens.access = response.access_token;
                if let Some(rotated) = response.refresh_token {
                    session.tokens.refresh = Some(rotated);
                }
                self.store.save(&session)?;

                self.set_state(SessionState::Authenticated);
                self.refresh_epoch.fetch_add(1, Ordering::AcqRel);
                self.rearm.notify_one();
                tracing::info!(exp = new_claims.exp, "Access token refreshed");
                Ok(())
            }
            Err(e) if e.is_transient() => {
                // Keep the session; the scheduled task retries shortly
                self.set_state(SessionState::Authenticated);
                tracing::warn!(error = %e, "Token refresh failed transiently");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Refresh token rejected, session expired");
                self.set_state(SessionState::Expired);
                self.store.clear();
                self.set_state(SessionState::Anonymous);
                self.rearm.notify_one();
                Err(e)
            }
        }
    }

    /// How long until the refresh window opens, or `None` when there is
    /// nothing schedulable (no session, no refresh token, unreadable token).
    fn next_refresh_wait(&self) -> Option<Duration> {
        let session = self.store.load().ok().flatten()?;
        session.tokens.refresh.as_ref()?;
        let claims = decode_unverified(&session.tokens.access).ok()?;
        Some(Duration::from_secs(claims.secs_until_refresh(
            self.clock.now_epoch(),
            self.refresh_threshold,
        )))
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    #[cfg(test)]
    pub(crate) fn set_state_for_test(&self, state: SessionState) {
        self.set_state(state);
    }
}

/// A platform role is only valid in the platform portal and tenant roles
/// only under a tenant subdomain; a violation is a hard failure.
fn ensure_portal_consistency(role: Role, portal: &PortalContext) -> Result<()> {
    let platform_portal = matches!(portal, PortalContext::Platform);
    if role.is_platform() == platform_portal {
        Ok(())
    } else {
        Err(AuthError::PortalMismatch {
            role,
            portal: portal.kind(),
        })
    }
}

/// Background silent-refresh task.
///
/// Sleeps until the stored token's expiry minus the refresh threshold (keyed
/// to the known instant, not a polling interval), re-arms whenever the
/// session changes, and stops when the shutdown token is cancelled. Owned by
/// the composition root alongside the manager.
pub struct SessionRefreshTask {
    session: Arc<SessionManager>,
    retry_interval: Duration,
}

impl std::fmt::Debug for SessionRefreshTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRefreshTask")
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

impl SessionRefreshTask {
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.session.next_refresh_wait() {
                    Some(wait) => {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = self.session.rearm.notified() => {}
                            () = tokio::time::sleep(wait) => {
                                match self.session.refresh_if_needed().await {
                                    Ok(()) => {}
                                    Err(e) if e.is_transient() => {
                                        tracing::warn!(
                                            error = %e,
                                            "Scheduled refresh failed, will retry"
                                        );
                                        tokio::select! {
                                            () = shutdown.cancelled() => break,
                                            () = self.session.rearm.notified() => {}
                                            () = tokio::time::sleep(self.retry_interval) => {}
                                        }
                                    }
                                    Err(e) => {
                                        // Session was cleared; the next arm parks
                                        tracing::warn!(error = %e, "Scheduled refresh failed");
                                    }
                                }
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = self.session.rearm.notified() => {}
                        }
                    }
                }
            }
            tracing::debug!("Session refresh task shutting down");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::api::{LoginResponse, ProfileResponse, RefreshResponse};
    use crate::claims::test_support::mint_token;
    use crate::clock::test_support::FakeClock;
    use crate::store::InMemoryStore;
    use crate::types::TenantRef;

    const NOW: i64 = 1_700_000_000;
    const HOUR: i64 = 3600;

    #[derive(Debug, Clone, Copy)]
    enum RefreshMode {
        /// New token expiring at the given epoch; optionally rotate.
        Renew { exp: i64, rotate: bool },
        /// Refresh token rejected by the server.
        Reject,
        /// Transient outage.
        Unavailable,
    }

    #[derive(Debug)]
    struct FakeApi {
        login_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        logout_calls: AtomicUsize,
        login_exp: Mutex<i64>,
        login_with_refresh: Mutex<bool>,
        login_role: Mutex<&'static str>,
        login_fails: Mutex<bool>,
        refresh_mode: Mutex<RefreshMode>,
        refresh_delay: Mutex<Duration>,
        logout_fails: Mutex<bool>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                login_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                logout_calls: AtomicUsize::new(0),
                login_exp: Mutex::new(NOW + HOUR),
                login_with_refresh: Mutex::new(true),
                login_role: Mutex::new("teacher"),
                login_fails: Mutex::new(false),
                refresh_mode: Mutex::new(RefreshMode::Renew {
                    exp: NOW + 2 * HOUR,
                    rotate: false,
                }),
                refresh_delay: Mutex::new(Duration::ZERO),
                logout_fails: Mutex::new(false),
            }
        }

        fn user(&self, role: &str) -> SessionUser {
            let tenant = (role != "platform-admin").then(|| TenantRef {
                id: "t-1".to_string(),
                name: "Greenwood High".to_string(),
                slug: "greenwood".to_string(),
            });
            SessionUser {
                id: "u-1".to_string(),
                email: "teacher@greenwood.edu".to_string(),
                display_name: "Teacher".to_string(),
                role: serde_json::from_value(serde_json::json!(role)).unwrap(),
                tenant,
            }
        }
    }

    #[async_trait]
    impl crate::api::AuthApi for FakeApi {
        async fn login(
            &self,
            _portal: &PortalContext,
            _credentials: &Credentials,
        ) -> Result<LoginResponse> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            if *self.login_fails.lock() {
                return Err(AuthError::InvalidCredentials);
            }
            let role = *self.login_role.lock();
            Ok(LoginResponse {
                access_token: mint_token("u-1", *self.login_exp.lock(), Some(role), None),
                refresh_token: self
                    .login_with_refresh
                    .lock()
                    .then(|| "refresh-1".to_string()),
                user: self.user(role),
                permissions: ["students.read"].into_iter().collect(),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshResponse> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match *self.refresh_mode.lock() {
                RefreshMode::Renew { exp, rotate } => Ok(RefreshResponse {
                    access_token: mint_token("u-1", exp, Some("teacher"), None),
                    refresh_token: rotate.then(|| "refresh-2".to_string()),
                }),
                RefreshMode::Reject => Err(AuthError::InvalidCredentials),
                RefreshMode::Unavailable => Err(AuthError::Server(503)),
            }
        }

        async fn logout(&self, _refresh_token: &str) -> Result<()> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            if *self.logout_fails.lock() {
                return Err(AuthError::Server(500));
            }
            Ok(())
        }

        async fn profile(&self, _access_token: &str) -> Result<ProfileResponse> {
            let role = *self.login_role.lock();
            Ok(ProfileResponse {
                user: self.user(role),
                permissions: ["students.read", "grades.write"].into_iter().collect(),
            })
        }
    }

    struct Harness {
        session: Arc<SessionManager>,
        api: Arc<FakeApi>,
        store: InMemoryStore,
        clock: Arc<FakeClock>,
    }

    fn tenant_portal() -> PortalContext {
        PortalContext::Tenant {
            slug: "greenwood".to_string(),
        }
    }

    fn harness(portal: PortalContext) -> Harness {
        let api = Arc::new(FakeApi::new());
        let store = InMemoryStore::new();
        let clock = Arc::new(FakeClock::new(NOW));
        let session = Arc::new(
            SessionManager::new(api.clone(), Arc::new(store.clone()), portal)
                .with_clock(clock.clone()),
        );
        Harness {
            session,
            api,
            store,
            clock,
        }
    }

    fn credentials() -> Credentials {
        Credentials::new(
            "teacher@greenwood.edu".to_string(),
            "correct".to_string(),
            true,
        )
    }

    async fn login_ok(h: &Harness) {
        h.session.login(&credentials()).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_login_success_persists_session() {
        let h = harness(tenant_portal());
        let user = h.session.login(&credentials()).await.unwrap();

        assert_eq!(user.id, "u-1");
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert!(h.session.is_authenticated());

        let stored = h.store.load().unwrap().unwrap();
        assert_eq!(stored.tokens.refresh.as_deref(), Some("refresh-1"));
        assert!(stored.permissions.contains("students.read"));
    }

    #[tokio::test]
    async fn test_login_failure_returns_to_anonymous() {
        let h = harness(tenant_portal());
        *h.api.login_fails.lock() = true;

        let err = h.session.login(&credentials()).await.unwrap_err();
        assert!(err.is_invalid_credentials());
        assert_eq!(h.session.state(), SessionState::Anonymous);
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_platform_role_rejected_in_tenant_portal() {
        let h = harness(tenant_portal());
        *h.api.login_role.lock() = "platform-admin";

        let err = h.session.login(&credentials()).await.unwrap_err();
        assert!(err.is_portal_mismatch());
        assert_eq!(h.session.state(), SessionState::Anonymous);
        // Nothing must be persisted for an inconsistent session
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tenant_role_rejected_in_platform_portal() {
        let h = harness(PortalContext::Platform);
        *h.api.login_role.lock() = "teacher";

        let err = h.session.login(&credentials()).await.unwrap_err();
        assert!(err.is_portal_mismatch());
    }

    #[tokio::test]
    async fn test_platform_admin_valid_in_platform_portal() {
        let h = harness(PortalContext::Platform);
        *h.api.login_role.lock() = "platform-admin";
        login_ok(&h).await;
    }

    #[tokio::test]
    async fn test_expired_read_triggers_clear() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        h.clock.advance(2 * HOUR);
        assert!(!h.session.is_authenticated());
        assert_eq!(h.session.state(), SessionState::Anonymous);
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_token_triggers_hard_clear() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        let mut stored = h.store.load().unwrap().unwrap();
        stored.tokens.access = "not.a.jwt".to_string();
        h.store.save(&stored).unwrap();

        assert!(!h.session.is_authenticated());
        assert_eq!(h.session.state(), SessionState::Anonymous);
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_page_reload_restores_session() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        // A second manager over the same store models the reloaded page
        let reloaded = SessionManager::new(
            h.api.clone(),
            Arc::new(h.store.clone()),
            tenant_portal(),
        )
        .with_clock(h.clock.clone());

        assert_eq!(reloaded.state(), SessionState::Anonymous);
        assert!(reloaded.is_authenticated());
        assert_eq!(reloaded.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_logout_in_other_tab_is_observed() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        let other = SessionManager::new(
            h.api.clone(),
            Arc::new(h.store.clone()),
            tenant_portal(),
        )
        .with_clock(h.clock.clone());
        assert!(other.is_authenticated());

        h.session.logout().await;

        assert!(!other.is_authenticated());
        assert_eq!(other.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent_and_never_fails() {
        let h = harness(tenant_portal());
        *h.api.logout_fails.lock() = true;

        // Logout when never logged in: no-op, no server call
        h.session.logout().await;
        assert_eq!(h.api.logout_calls.load(Ordering::SeqCst), 0);

        login_ok(&h).await;
        h.session.logout().await;
        assert_eq!(h.api.logout_calls.load(Ordering::SeqCst), 1);
        assert!(h.store.load().unwrap().is_none());
        assert_eq!(h.session.state(), SessionState::Anonymous);

        // Repeated logout stays a no-op
        h.session.logout().await;
        assert_eq!(h.api.logout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_not_due_is_noop() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        h.session.refresh_if_needed().await.unwrap();
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_inside_window_renews_token() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        // 4 minutes to expiry, inside the 5 minute default window
        h.clock.advance(HOUR - 240);
        h.session.refresh_if_needed().await.unwrap();

        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert!(h.session.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token_when_issued() {
        let h = harness(tenant_portal());
        login_ok(&h).await;
        *h.api.refresh_mode.lock() = RefreshMode::Renew {
            exp: NOW + 3 * HOUR,
            rotate: true,
        };

        h.clock.advance(HOUR - 60);
        h.session.refresh_if_needed().await.unwrap();

        let stored = h.store.load().unwrap().unwrap();
        assert_eq!(stored.tokens.refresh.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_token_when_not_rotated() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        h.clock.advance(HOUR - 60);
        h.session.refresh_if_needed().await.unwrap();

        let stored = h.store.load().unwrap().unwrap();
        assert_eq!(stored.tokens.refresh.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_expired_access_with_refresh_token_still_refreshes() {
        let h = harness(tenant_portal());
        login_ok(&h).await;
        *h.api.refresh_mode.lock() = RefreshMode::Renew {
            exp: NOW + 3 * HOUR,
            rotate: false,
        };

        // Access token fully expired; only its expiry was checked, the
        // refresh token gets its chance
        h.clock.advance(2 * HOUR);
        h.session.refresh_if_needed().await.unwrap();

        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(h.session.is_authenticated());
    }

    #[tokio::test]
    async fn test_expired_access_without_refresh_token_short_circuits() {
        let h = harness(tenant_portal());
        *h.api.login_with_refresh.lock() = false;
        login_ok(&h).await;

        h.clock.advance(2 * HOUR);
        let err = h.session.refresh_if_needed().await.unwrap_err();

        assert!(matches!(err, AuthError::NoRefreshToken));
        // No pointless network round trip
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(h.store.load().unwrap().is_none());
        assert_eq!(h.session.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_expires_session() {
        let h = harness(tenant_portal());
        login_ok(&h).await;
        *h.api.refresh_mode.lock() = RefreshMode::Reject;

        h.clock.advance(HOUR - 60);
        let err = h.session.refresh_if_needed().await.unwrap_err();

        assert!(err.is_invalid_credentials());
        assert!(h.store.load().unwrap().is_none());
        assert_eq!(h.session.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_session() {
        let h = harness(tenant_portal());
        login_ok(&h).await;
        *h.api.refresh_mode.lock() = RefreshMode::Unavailable;

        h.clock.advance(HOUR - 60);
        let err = h.session.refresh_if_needed().await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(h.session.state(), SessionState::Authenticated);
        assert!(h.session.is_authenticated());
        assert!(h.store.load().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_collapse_to_one_call() {
        let h = harness(tenant_portal());
        login_ok(&h).await;
        *h.api.refresh_delay.lock() = Duration::from_millis(50);

        h.clock.advance(HOUR - 60);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = h.session.clone();
            tasks.push(tokio::spawn(async move {
                session.refresh_if_needed().await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_storm_collapses_to_one_refresh() {
        let h = harness(tenant_portal());
        login_ok(&h).await;
        *h.api.refresh_delay.lock() = Duration::from_millis(50);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let session = h.session.clone();
            tasks.push(tokio::spawn(
                async move { session.refresh_after_reject().await },
            ));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permissions_empty_when_unauthenticated() {
        let h = harness(tenant_portal());
        assert!(h.session.permissions().is_empty());

        login_ok(&h).await;
        assert!(h.session.permissions().contains("students.read"));

        h.clock.advance(2 * HOUR);
        assert!(h.session.permissions().is_empty());
    }

    #[tokio::test]
    async fn test_access_token_only_while_valid() {
        let h = harness(tenant_portal());
        assert!(h.session.access_token().is_none());

        login_ok(&h).await;
        assert!(h.session.access_token().is_some());

        h.clock.advance(2 * HOUR);
        assert!(h.session.access_token().is_none());
    }

    #[tokio::test]
    async fn test_reload_profile_updates_permissions() {
        let h = harness(tenant_portal());
        login_ok(&h).await;

        let user = h.session.reload_profile().await.unwrap();
        assert_eq!(user.id, "u-1");
        assert!(h.session.permissions().contains("grades.write"));
    }

    #[tokio::test]
    async fn test_reload_profile_requires_session() {
        let h = harness(tenant_portal());
        let err = h.session.reload_profile().await.unwrap_err();
        assert!(err.is_not_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_fires_at_window() {
        let h = harness(tenant_portal());
        let shutdown = CancellationToken::new();
        let handle = SessionRefreshTask::new(h.session.clone()).spawn(shutdown.clone());

        login_ok(&h).await;
        // The wall clock the manager sees must move with tokio's clock:
        // advance it past the refresh window, then let the timer fire.
        h.clock.advance(HOUR - 60);
        tokio::time::sleep(Duration::from_secs(u64::try_from(HOUR).unwrap())).await;

        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(h.session.is_authenticated());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_refresh_fires_after_logout() {
        let h = harness(tenant_portal());
        let shutdown = CancellationToken::new();
        let handle = SessionRefreshTask::new(h.session.clone()).spawn(shutdown.clone());

        login_ok(&h).await;
        h.session.logout().await;

        // Sleep far past the original refresh deadline
        tokio::time::sleep(Duration::from_secs(u64::try_from(3 * HOUR).unwrap())).await;
        assert_eq!(h.api.refresh_calls.load(Ordering::SeqCst), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_task_stops_on_cancellation() {
        let h = harness(tenant_portal());
        let shutdown = CancellationToken::new();
        let handle = SessionRefreshTask::new(h.session.clone()).spawn(shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
