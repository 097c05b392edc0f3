//! Portal context detection
//!
//! Decides per page load whether a session belongs to the platform-operator
//! portal or a tenant school, by inspecting the browser host. Pure and
//! deterministic: no I/O, the result is never cached across navigations.

use serde::{Deserialize, Serialize};

/// Which portal the current host resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortalKind {
    Platform,
    Tenant,
}

impl std::fmt::Display for PortalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Platform => "platform",
            Self::Tenant => "tenant",
        })
    }
}

/// Resolved portal context for the current host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalContext {
    Platform,
    Tenant { slug: String },
}

impl PortalContext {
    #[must_use]
    pub const fn kind(&self) -> PortalKind {
        match self {
            Self::Platform => PortalKind::Platform,
            Self::Tenant { .. } => PortalKind::Tenant,
        }
    }

    #[must_use]
    pub fn tenant_slug(&self) -> Option<&str> {
        match self {
            Self::Platform => None,
            Self::Tenant { slug } => Some(slug),
        }
    }
}

/// Host matching rules for portal detection.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Hosts that resolve to the operator portal, e.g. `campus.school`,
    /// `www.campus.school`, `localhost`.
    pub platform_hosts: Vec<String>,
    /// Context used when the host matches neither a platform host nor a
    /// tenant subdomain of one.
    pub fallback: PortalContext,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            platform_hosts: vec![
                "campus.school".to_string(),
                "www.campus.school".to_string(),
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ],
            fallback: PortalContext::Platform,
        }
    }
}

impl PortalConfig {
    #[must_use]
    pub fn new(platform_hosts: Vec<String>) -> Self {
        Self {
            platform_hosts,
            fallback: PortalContext::Platform,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: PortalContext) -> Self {
        self.fallback = fallback;
        self
    }
}

/// Resolve a browser host to a portal context.
///
/// Matching is case-insensitive and ignores a `:port` suffix. A host equal
/// to a configured platform host is the operator portal; a host of the form
/// `{slug}.{platform_host}` with a well-formed slug is that tenant's portal;
/// anything else gets the configured fallback.
#[must_use]
pub fn detect(hostname: &str, config: &PortalConfig) -> PortalContext {
    let host = hostname
        .split(':')
        .next()
        .unwrap_or(hostname)
        .trim_end_matches('.')
        .to_ascii_lowercase();

    // Exact matches win over subdomain extraction across the whole list, so
    // a platform host that sits under another one (`www.campus.school` under
    // `campus.school`) is never mistaken for a tenant.
    for platform in &config.platform_hosts {
        if host == platform.to_ascii_lowercase() {
            return PortalContext::Platform;
        }
    }

    for platform in &config.platform_hosts {
        let platform = platform.to_ascii_lowercase();
        if let Some(label) = host.strip_suffix(&format!(".{platform}"))
            && is_valid_slug(label)
        {
            return PortalContext::Tenant {
                slug: label.to_string(),
            };
        }
    }

    config.fallback.clone()
}

/// Tenant slug rule: 3-63 chars of lowercase alphanumerics and hyphens, no
/// leading or trailing hyphen.
#[must_use]
pub fn is_valid_slug(label: &str) -> bool {
    let len_ok = (3..=63).contains(&label.len());
    let chars_ok = label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    len_ok && chars_ok && !label.starts_with('-') && !label.ends_with('-')
}
