//! Providers module
//!
//! This module provides the music-provider SDK including:
//! - The `MusicProvider` trait defining the interface for all provider implementations
//! - Provider descriptors and a registry for discovery and lookup
//! - A generic OAuth2 client implementation driven by descriptor data
//! - The health monitor that keeps registry availability current

pub mod descriptor;
pub mod health;
pub mod oauth2;
pub mod registry;
pub mod trait_;

pub use descriptor::{HealthStatus, Platform, ProviderDescriptor};
pub use health::HealthMonitor;
pub use oauth2::Oauth2Provider;
pub use registry::{ProviderRegistry, RegistryError};
pub use trait_::{
    Cursor, ExchangeCodeParams, FetchPage, FetchParams, MusicProvider, ProviderError,
    ProviderItem, SyncError, SyncErrorKind, TokenGrant,
};
