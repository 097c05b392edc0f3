//! Session and authentication layer for multi-tenant school portals

pub mod api;
pub mod claims;
pub mod clock;
mod error;
pub mod gateway;
pub mod guard;
pub mod portal;
pub mod session;
pub mod store;
pub mod types;

pub use api::{AuthApi, LoginResponse, ProfileResponse, RefreshResponse, RestAuthApi};
pub use claims::TokenClaims;
pub use clock::{Clock, SystemClock};
pub use error::{AuthError, Result};
pub use gateway::ApiGateway;
pub use guard::{AccessDecision, AccessRequirement, DenyReason, RouteGuard};
pub use portal::{PortalConfig, PortalContext, PortalKind};
pub use session::{SessionManager, SessionRefreshTask, SessionState};
pub use store::{FileStore, InMemoryStore, StoredSession, TokenStore};
pub use types::{Credentials, PermissionSet, Role, SessionUser, TenantRef, TokenPair};
