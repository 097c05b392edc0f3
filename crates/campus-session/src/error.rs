//! Authentication error types

use std::time::Duration;

use thiserror::Error;

use crate::portal::PortalKind;
use crate::types::Role;

/// Failures surfaced by the session layer.
///
/// Display strings are fixed and never interpolate server response bodies,
/// so nothing reflected from user input can leak into UI messages. Lockout
/// and rate-limit variants carry a wait hint without revealing whether the
/// account exists.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("too many failed attempts, try again later")]
    AccountLocked { retry_after: Option<Duration> },

    #[error("account is not active")]
    AccountInactive,

    #[error("too many requests, slow down")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server error (status {0})")]
    Server(u16),

    #[error("malformed token")]
    Decode,

    #[error("role {role} is not valid in the {portal} portal")]
    PortalMismatch { role: Role, portal: PortalKind },

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("authentication required")]
    NotAuthenticated,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AuthError {
    #[must_use]
    pub const fn is_invalid_credentials(&self) -> bool {
        matches!(self, Self::InvalidCredentials)
    }

    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    #[must_use]
    pub const fn is_portal_mismatch(&self) -> bool {
        matches!(self, Self::PortalMismatch { .. })
    }

    #[must_use]
    pub const fn is_not_authenticated(&self) -> bool {
        matches!(self, Self::NotAuthenticated)
    }

    /// True for failures worth retrying without user interaction.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Server(_) | Self::RateLimited { .. }
        )
    }

    /// Wait hint for lockout/rate-limit responses, if the server sent one.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AccountLocked { retry_after } | Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
