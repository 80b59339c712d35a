//! # Repositories
//!
//! Database access layer. Each repository wraps SeaORM operations for one
//! table with user-scoped query methods.

pub mod auth_session;
pub mod connection;
pub mod security_event;
pub mod sync_job;

pub use auth_session::AuthSessionRepository;
pub use connection::ConnectionRepository;
pub use security_event::SecurityEventRepository;
pub use sync_job::SyncJobRepository;
