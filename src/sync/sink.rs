//! Seam between the sync pipeline and whatever consumes synced items.
//!
//! The orchestrator never interprets item payloads; it streams them into an
//! [`ItemSink`] during `data_fetch` and asks the sink to process each staged
//! item during `processing`. Downstream persistence lives behind this trait.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::providers::{ProviderItem, SyncError};

#[async_trait]
pub trait ItemSink: Send + Sync {
    /// Receive one raw item as it is fetched from the provider.
    async fn ingest(
        &self,
        connection_id: Uuid,
        collection: &str,
        item: &ProviderItem,
    ) -> Result<(), SyncError>;

    /// Post-process one staged item. Retryable failures are retried by the
    /// orchestrator up to its per-item cap.
    async fn process(&self, connection_id: Uuid, external_id: &str) -> Result<(), SyncError>;
}

/// Sink used when no downstream consumer is wired in: logs and accepts.
pub struct TracingSink;

#[async_trait]
impl ItemSink for TracingSink {
    async fn ingest(
        &self,
        connection_id: Uuid,
        collection: &str,
        item: &ProviderItem,
    ) -> Result<(), SyncError> {
        debug!(%connection_id, collection, external_id = %item.external_id, "item ingested");
        Ok(())
    }

    async fn process(&self, connection_id: Uuid, external_id: &str) -> Result<(), SyncError> {
        debug!(%connection_id, external_id, "item processed");
        Ok(())
    }
}
