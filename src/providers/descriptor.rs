//! Provider descriptor types
//!
//! Static description of an integrable OAuth2 music provider: endpoints,
//! scopes, rate limit, platform availability, and coarse health.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::ProviderConfig;

/// Client platform a provider can be enabled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Ios,
    Android,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Web, Platform::Ios, Platform::Android];
}

/// Coarse provider health, updated only by the periodic health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

/// Static description of one OAuth2 provider.
///
/// Immutable after registration except for `health` and `maintenance_mode`,
/// which the health probe owns.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderDescriptor {
    /// Unique identifier for the provider (e.g. `spotify`, `apple_music`)
    pub slug: String,
    /// Human-readable name derived from the slug
    pub display_name: String,
    /// Authorization endpoint the user is redirected to
    pub auth_url: String,
    /// Token endpoint for code exchange and refresh
    pub token_url: String,
    /// Optional token revocation endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,
    /// Base URL for the provider's data API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// OAuth scopes supported by the provider
    pub scopes: Vec<String>,
    /// Requests per minute the provider tolerates
    pub rate_limit_per_minute: u32,
    /// Platforms the provider is enabled for
    pub platforms: Vec<Platform>,
    /// Current coarse health
    pub health: HealthStatus,
    /// Whether the provider is administratively paused
    pub maintenance_mode: bool,
}

impl ProviderDescriptor {
    /// Build a descriptor from configuration. Returns `None` when the
    /// configuration lacks the endpoints needed to drive the OAuth flow.
    pub fn from_config(slug: &str, config: &ProviderConfig) -> Option<Self> {
        let auth_url = config.auth_url.clone().filter(|url| !url.is_empty())?;
        let token_url = config.token_url.clone().filter(|url| !url.is_empty())?;
        Some(Self {
            slug: slug.to_string(),
            display_name: display_name_for(slug),
            auth_url,
            token_url,
            revoke_url: None,
            api_base: config.api_base.clone().filter(|url| !url.is_empty()),
            scopes: config.scopes.clone(),
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            platforms: Platform::ALL.to_vec(),
            health: HealthStatus::Healthy,
            maintenance_mode: false,
        })
    }

    /// Whether new authorization or sync work may be started against this
    /// provider. Existing connections are untouched either way.
    pub fn accepts_new_work(&self) -> bool {
        !self.maintenance_mode && self.health != HealthStatus::Down
    }

    /// Whether the provider is enabled for the given platform.
    pub fn enabled_for(&self, platform: Platform) -> bool {
        self.platforms.contains(&platform)
    }

    /// Whether every requested scope is one the provider supports. An empty
    /// request is valid and means "provider defaults".
    pub fn supports_scopes(&self, requested: &[String]) -> bool {
        requested
            .iter()
            .all(|scope| self.scopes.iter().any(|known| known == scope))
    }
}

const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;

/// `apple_music` becomes `Apple Music`.
fn display_name_for(slug: &str) -> String {
    slug.split('_')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
