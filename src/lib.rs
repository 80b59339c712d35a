//! # TuneSync Library
//!
//! Core functionality for the TuneSync service: OAuth connection
//! lifecycle management and phased synchronization of music libraries
//! from third-party providers.

pub mod audit;
pub mod auth;
pub mod config;
pub mod connection_store;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod oauth_session;
pub mod pkce;
pub mod providers;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod sync;
pub mod telemetry;
pub use migration;
