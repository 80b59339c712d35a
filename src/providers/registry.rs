//! Provider registry
//!
//! In-memory registry of provider clients and descriptors, seeded from
//! configuration at startup. Read-mostly; the periodic health probe is the
//! only writer after initialization.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::ServiceError;
use crate::providers::descriptor::{HealthStatus, Platform, ProviderDescriptor};
use crate::providers::oauth2::{DEFAULT_REQUEST_TIMEOUT, Oauth2Provider};
use crate::providers::trait_::MusicProvider;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{slug}' not found")]
    ProviderNotFound { slug: String },
}

impl From<RegistryError> for ServiceError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::ProviderNotFound { slug } => {
                ServiceError::InvalidRequest(format!("unknown provider '{}'", slug))
            }
        }
    }
}

struct Inner {
    providers: HashMap<String, Arc<dyn MusicProvider>>,
    descriptors: HashMap<String, ProviderDescriptor>,
}

/// Registry of music providers keyed by slug.
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                providers: HashMap::new(),
                descriptors: HashMap::new(),
            }),
        }
    }

    /// Seed a registry from configuration. Providers without both OAuth
    /// endpoints or a client id are skipped with a warning rather than
    /// failing startup.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let registry = Self::new();
        for (slug, provider_config) in &config.providers {
            let Some(descriptor) = ProviderDescriptor::from_config(slug, provider_config) else {
                warn!(provider = %slug, "provider not registered: missing auth or token endpoint");
                continue;
            };
            let Some(client_id) = provider_config.client_id.clone() else {
                warn!(provider = %slug, "provider not registered: missing client id");
                continue;
            };
            let provider = Oauth2Provider::from_descriptor(
                &descriptor,
                client_id,
                provider_config.client_secret.clone(),
                config.oauth.redirect_url.clone(),
                DEFAULT_REQUEST_TIMEOUT,
            )
            .with_context(|| format!("building OAuth2 client for provider '{}'", slug))?;
            info!(provider = %slug, "registered provider");
            registry.register(Arc::new(provider), descriptor);
        }
        Ok(registry)
    }

    /// Register a provider with its descriptor
    pub fn register(&self, provider: Arc<dyn MusicProvider>, descriptor: ProviderDescriptor) {
        let mut inner = self.inner.write().unwrap();
        let slug = descriptor.slug.clone();
        inner.providers.insert(slug.clone(), provider);
        inner.descriptors.insert(slug, descriptor);
    }

    /// Get a provider client by slug
    pub fn get(&self, slug: &str) -> Result<Arc<dyn MusicProvider>, RegistryError> {
        let inner = self.inner.read().unwrap();
        inner
            .providers
            .get(slug)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                slug: slug.to_string(),
            })
    }

    /// Get the descriptor for a specific provider
    pub fn descriptor(&self, slug: &str) -> Result<ProviderDescriptor, RegistryError> {
        let inner = self.inner.read().unwrap();
        inner
            .descriptors
            .get(slug)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                slug: slug.to_string(),
            })
    }

    /// All descriptors, sorted by slug for stable ordering
    pub fn list_descriptors(&self) -> Vec<ProviderDescriptor> {
        let inner = self.inner.read().unwrap();
        let mut descriptors: Vec<_> = inner.descriptors.values().cloned().collect();
        descriptors.sort_by(|a, b| a.slug.cmp(&b.slug));
        descriptors
    }

    /// Descriptors of providers enabled for the given platform, sorted by slug
    pub fn list_enabled(&self, platform: Platform) -> Vec<ProviderDescriptor> {
        self.list_descriptors()
            .into_iter()
            .filter(|descriptor| descriptor.enabled_for(platform))
            .collect()
    }

    /// Update a provider's health. Only the health probe calls this.
    pub fn set_health(&self, slug: &str, health: HealthStatus) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();
        let descriptor =
            inner
                .descriptors
                .get_mut(slug)
                .ok_or_else(|| RegistryError::ProviderNotFound {
                    slug: slug.to_string(),
                })?;
        if descriptor.health != health {
            info!(provider = %slug, from = ?descriptor.health, to = ?health, "provider health changed");
        }
        descriptor.health = health;
        Ok(())
    }

    /// Administratively pause or unpause a provider.
    pub fn set_maintenance(&self, slug: &str, maintenance: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();
        let descriptor =
            inner
                .descriptors
                .get_mut(slug)
                .ok_or_else(|| RegistryError::ProviderNotFound {
                    slug: slug.to_string(),
                })?;
        descriptor.maintenance_mode = maintenance;
        Ok(())
    }

    /// Resolve a provider that may accept new authorization or sync work.
    ///
    /// Unknown slugs are an invalid request; known-but-down providers refuse
    /// new work while existing connections stay untouched.
    pub fn ensure_available(&self, slug: &str) -> Result<ProviderDescriptor, ServiceError> {
        let descriptor = self.descriptor(slug)?;
        if !descriptor.accepts_new_work() {
            return Err(ServiceError::ProviderUnavailable(slug.to_string()));
        }
        Ok(descriptor)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
