//! Client configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use grantline_shared::SessionIdentity;

use crate::ws::{IdentityProvider, ReconnectConfig};

pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/api/ws";

/// Connection settings for the sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub url: String,
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim).map(str::to_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl SyncConfig {
    /// Parse sync settings from environment variables.
    ///
    /// Environment variables:
    /// - `GRANTLINE_WS_URL`: WebSocket endpoint (default: "ws://localhost:8080/api/ws")
    /// - `GRANTLINE_AUTO_RECONNECT`: "true" | "false" (default: "true")
    /// - `GRANTLINE_RECONNECT_DELAY_MS`: fixed delay between attempts (default: 1000)
    /// - `GRANTLINE_MAX_RECONNECT_ATTEMPTS`: 0 for unbounded (default: 5)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ReconnectConfig::default();
        let delay_ms = parse_or(
            lookup("GRANTLINE_RECONNECT_DELAY_MS"),
            defaults.delay.as_millis() as u64,
        );
        Self {
            url: lookup("GRANTLINE_WS_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            reconnect: ReconnectConfig {
                auto_reconnect: parse_flag(lookup("GRANTLINE_AUTO_RECONNECT"), defaults.auto_reconnect),
                delay: Duration::from_millis(delay_ms),
                max_attempts: parse_or(lookup("GRANTLINE_MAX_RECONNECT_ATTEMPTS"), defaults.max_attempts),
            },
        }
    }
}

/// Who to sign in as and which channels to follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityConfig {
    pub identity: Option<SessionIdentity>,
    pub channels: Vec<String>,
}

impl IdentityConfig {
    /// Environment variables:
    /// - `GRANTLINE_USER_ID`, `GRANTLINE_TENANT_ID`: both required for an identity
    /// - `GRANTLINE_EMAIL`: optional
    /// - `GRANTLINE_CHANNELS`: comma separated (default: "kpis,relationships,grants,activities")
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let user_id = lookup("GRANTLINE_USER_ID").filter(|v| !v.is_empty());
        let tenant_id = lookup("GRANTLINE_TENANT_ID").filter(|v| !v.is_empty());
        let identity = match (user_id, tenant_id) {
            (Some(user_id), Some(tenant_id)) => Some(
                SessionIdentity::new(user_id, tenant_id)
                    .with_email(lookup("GRANTLINE_EMAIL").unwrap_or_default()),
            ),
            _ => None,
        };

        let channels = lookup("GRANTLINE_CHANNELS")
            .unwrap_or_else(|| "kpis,relationships,grants,activities".to_string())
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        Self { identity, channels }
    }
}

impl IdentityProvider for IdentityConfig {
    fn current_identity(&self) -> Option<SessionIdentity> {
        self.identity.clone()
    }
}
