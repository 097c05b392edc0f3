//! Access token payload decoding
//!
//! The client never verifies signatures; the API gateway does that
//! server-side. This codec only needs the payload (expiry, subject, role) to
//! drive refresh scheduling and the route guard, so signature validation is
//! explicitly disabled. Any malformed input comes back as
//! [`AuthError::Decode`], never a panic.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{AuthError, Result};
use crate::types::Role;

/// Claims embedded in the access token payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Subject: the user id.
    pub sub: String,
    /// Expiry, Unix epoch seconds.
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub tenant_slug: Option<String>,
}

impl TokenClaims {
    #[must_use]
    pub const fn is_expired(&self, now_epoch: i64) -> bool {
        self.exp <= now_epoch
    }

    /// True once the token is inside the refresh window before expiry
    /// (expired tokens count as inside the window).
    #[must_use]
    pub const fn expires_within(&self, now_epoch: i64, threshold: Duration) -> bool {
        self.exp - now_epoch <= threshold.as_secs() as i64
    }

    /// Seconds until the refresh window opens; zero when it already has.
    #[must_use]
    pub const fn secs_until_refresh(&self, now_epoch: i64, threshold: Duration) -> u64 {
        let remaining = self.exp - now_epoch - threshold.as_secs() as i64;
        if remaining > 0 { remaining as u64 } else { 0 }
    }
}

/// Decode a bearer token's payload without verifying its signature.
///
/// Expiry is checked against the injected clock by the caller, not here.
pub fn decode_unverified(token: &str) -> Result<TokenClaims> {
    let data = jsonwebtoken::dangerous::insecure_decode::<TokenClaims>(token)
        .map_err(|_| AuthError::Decode)?;
    Ok(data.claims)
}
