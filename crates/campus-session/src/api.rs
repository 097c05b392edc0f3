//! Auth endpoint contracts
//!
//! [`AuthApi`] is the network seam the session manager talks through; the
//! REST implementation maps the gateway's structured error responses into
//! the typed taxonomy exactly once, at this boundary. Raw response bodies
//! never cross upward.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::error::{AuthError, Result};
use crate::portal::PortalContext;
use crate::types::{Credentials, PermissionSet, SessionUser};

/// Portal scope header attached to every request.
pub const HEADER_PORTAL_SCOPE: &str = "x-portal-scope";
/// Tenant slug header, attached only under a tenant portal.
pub const HEADER_TENANT_SLUG: &str = "x-tenant-slug";

/// Successful login payload.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: SessionUser,
    #[serde(default)]
    pub permissions: PermissionSet,
}

/// Successful refresh payload. A rotated refresh token is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Profile/permissions re-fetch payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileResponse {
    pub user: SessionUser,
    #[serde(default)]
    pub permissions: PermissionSet,
}

/// Structured error body the gateway returns on auth failures.
#[derive(Debug, Clone, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    retry_after_secs: Option<u64>,
}

/// The auth endpoints the session manager depends on.
#[async_trait]
pub trait AuthApi: Send + Sync + std::fmt::Debug {
    async fn login(&self, portal: &PortalContext, credentials: &Credentials)
    -> Result<LoginResponse>;

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse>;

    /// Server-side invalidation; best-effort by contract.
    async fn logout(&self, refresh_token: &str) -> Result<()>;

    async fn profile(&self, access_token: &str) -> Result<ProfileResponse>;
}

/// REST implementation over the platform's API gateway.
#[derive(Debug, Clone)]
pub struct RestAuthApi {
    client: reqwest::Client,
    base_url: Url,
}

impl RestAuthApi {
    /// Build a client with a bounded request timeout; a timed-out login or
    /// refresh surfaces as [`AuthError::Network`], not a hang.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::Config(format!("bad endpoint {path}: {e}")))
    }

    fn apply_portal(
        request: reqwest::RequestBuilder,
        portal: &PortalContext,
    ) -> reqwest::RequestBuilder {
        let request = request.header(HEADER_PORTAL_SCOPE, portal.kind().to_string());
        match portal.tenant_slug() {
            Some(slug) => request.header(HEADER_TENANT_SLUG, slug),
            None => request,
        }
    }

    async fn decode_failure(response: reqwest::Response) -> AuthError {
        let status = response.status();

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body: ApiErrorBody = response.json().await.unwrap_or_default();
        let retry_after = body
            .retry_after_secs
            .or(retry_after)
            .map(Duration::from_secs);

        match body.code.as_deref() {
            Some("account_locked") => return AuthError::AccountLocked { retry_after },
            Some("account_inactive") => return AuthError::AccountInactive,
            Some("invalid_credentials") => return AuthError::InvalidCredentials,
            _ => {}
        }

        match status.as_u16() {
            400 | 401 | 403 => AuthError::InvalidCredentials,
            423 => AuthError::AccountLocked { retry_after },
            429 => AuthError::RateLimited { retry_after },
            status => AuthError::Server(status),
        }
    }
}

#[async_trait]
impl AuthApi for RestAuthApi {
    async fn login(
        &self,
        portal: &PortalContext,
        credentials: &Credentials,
    ) -> Result<LoginResponse> {
        let path = match portal {
            PortalContext::Platform => "auth/platform/login",
            PortalContext::Tenant { .. } => "auth/login",
        };

        let request = self.client.post(self.endpoint(path)?).json(credentials);
        let response = Self::apply_portal(request, portal).send().await?;

        if !response.status().is_success() {
            return Err(Self::decode_failure(response).await);
        }
        Ok(response.json().await?)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let response = self
            .client
            .post(self.endpoint("auth/refresh")?)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::decode_failure(response).await);
        }
        Ok(response.json().await?)
    }

    async fn logout(&self, refresh_token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("auth/logout")?)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::decode_failure(response).await);
        }
        Ok(())
    }

    async fn profile(&self, access_token: &str) -> Result<ProfileResponse> {
        let response = self
            .client
            .get(self.endpoint("auth/profile")?)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::decode_failure(response).await);
        }
        Ok(response.json().await?)
    }
}
