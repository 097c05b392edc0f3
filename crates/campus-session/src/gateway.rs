//! Authenticated API gateway client
//!
//! Thin wrapper over `reqwest` that stamps every outgoing request with the
//! current bearer token and portal headers. A 401 triggers the session's
//! refresh path and exactly one replay; a second 401 surfaces as a hard
//! authentication failure. No other retry logic lives here.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::api::{HEADER_PORTAL_SCOPE, HEADER_TENANT_SLUG};
use crate::error::{AuthError, Result};
use crate::session::SessionManager;

/// HTTP client scoped to the authenticated API surface.
#[derive(Debug, Clone)]
pub struct ApiGateway {
    session: Arc<SessionManager>,
    client: reqwest::Client,
    base_url: Url,
}

impl ApiGateway {
    /// Build a gateway with a bounded request timeout; timeouts surface as
    /// [`AuthError::Network`].
    pub fn new(session: Arc<SessionManager>, base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            session,
            client,
            base_url,
        })
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        self.send(Method::GET, path, None).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(self.get(path).await?.json().await?)
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        self.send(Method::DELETE, path, None).await
    }

    /// Send an authenticated request with the retry-once-on-401 policy.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;

        let response = self.dispatch(&method, &url, body.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(%url, "Request rejected with 401, refreshing once");
        self.session.refresh_after_reject().await?;

        let replay = self.dispatch(&method, &url, body.as_ref()).await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(%url, "Replay rejected after refresh, giving up");
            return Err(AuthError::NotAuthenticated);
        }
        Ok(replay)
    }

    async fn dispatch(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self
            .session
            .access_token()
            .ok_or(AuthError::NotAuthenticated)?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .bearer_auth(token)
            .header(HEADER_PORTAL_SCOPE, self.session.portal().kind().to_string());
        if let Some(slug) = self.session.portal().tenant_slug() {
            request = request.header(HEADER_TENANT_SLUG, slug);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        Ok(request.send().await?)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::Config(format!("bad endpoint {path}: {e}")))
    }
}
