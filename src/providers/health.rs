//! Periodic provider health probe.
//!
//! The only component allowed to mutate registry health after startup.
//! Each tick issues a cheap request against every provider's token endpoint
//! and classifies the result: reachable means healthy, slow means degraded,
//! unreachable means down. Probe results gate new authorization and sync
//! work via `ProviderDescriptor::accepts_new_work`.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use reqwest::Client;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::providers::descriptor::HealthStatus;
use crate::providers::registry::ProviderRegistry;

/// Probe request deadline; anything slower than this is down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Responses slower than this mark the provider degraded.
const DEGRADED_THRESHOLD: Duration = Duration::from_secs(3);

/// Seconds between probe sweeps.
const PROBE_INTERVAL_SECONDS: u64 = 60;

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    client: Client,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ProviderRegistry>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self { registry, client })
    }

    /// Run the probe loop until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting provider health monitor");
        let tick_interval = TokioDuration::from_secs(PROBE_INTERVAL_SECONDS);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Provider health monitor shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("Provider health monitor stopped");
    }

    /// Probe every registered provider once and store the results.
    pub async fn sweep(&self) {
        for descriptor in self.registry.list_descriptors() {
            let health = self.probe(&descriptor.token_url).await;
            counter!("provider_health_probes_total").increment(1);
            if health != descriptor.health {
                if health == HealthStatus::Down {
                    warn!(provider = %descriptor.slug, "provider marked down");
                } else {
                    debug!(provider = %descriptor.slug, status = ?health, "provider health changed");
                }
            }
            if let Err(err) = self.registry.set_health(&descriptor.slug, health) {
                debug!(error = ?err, "provider disappeared during sweep");
            }
        }
    }

    /// A probe only cares about reachability, not the HTTP status: token
    /// endpoints answer unauthenticated requests with 4xx, which still
    /// proves the provider is up.
    async fn probe(&self, token_url: &str) -> HealthStatus {
        let started = Instant::now();
        match self.client.head(token_url).send().await {
            Ok(_) if started.elapsed() > DEGRADED_THRESHOLD => HealthStatus::Degraded,
            Ok(_) => HealthStatus::Healthy,
            Err(err) => {
                debug!(error = %err, "health probe failed");
                HealthStatus::Down
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::descriptor::{Platform, ProviderDescriptor};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(slug: &str, token_url: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            slug: slug.to_string(),
            display_name: slug.to_string(),
            auth_url: "https://example.test/authorize".to_string(),
            token_url: token_url.to_string(),
            revoke_url: None,
            api_base: None,
            scopes: vec![],
            rate_limit_per_minute: 60,
            platforms: Platform::ALL.to_vec(),
            health: HealthStatus::Healthy,
            maintenance_mode: false,
        }
    }

    struct NoProvider;

    #[async_trait::async_trait]
    impl crate::providers::MusicProvider for NoProvider {
        async fn exchange_code(
            &self,
            _params: crate::providers::ExchangeCodeParams,
        ) -> Result<crate::providers::TokenGrant, crate::providers::ProviderError> {
            unimplemented!("probe tests never exchange")
        }
        async fn refresh_token(
            &self,
            _refresh_token: &crate::crypto::SecretToken,
        ) -> Result<crate::providers::TokenGrant, crate::providers::ProviderError> {
            unimplemented!("probe tests never refresh")
        }
        async fn revoke_token(
            &self,
            _token: &crate::crypto::SecretToken,
        ) -> Result<(), crate::providers::ProviderError> {
            Ok(())
        }
        async fn fetch_page(
            &self,
            _params: crate::providers::FetchParams,
        ) -> Result<crate::providers::FetchPage, crate::providers::ProviderError> {
            unimplemented!("probe tests never fetch")
        }
    }

    #[tokio::test]
    async fn reachable_endpoint_is_healthy_even_when_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(
            Arc::new(NoProvider),
            descriptor("spotify", &format!("{}/token", server.uri())),
        );
        let monitor = HealthMonitor::new(registry.clone()).unwrap();

        monitor.sweep().await;
        assert_eq!(
            registry.descriptor("spotify").unwrap().health,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_marked_down() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(
            Arc::new(NoProvider),
            descriptor("tidal", "http://127.0.0.1:1/token"),
        );
        let monitor = HealthMonitor::new(registry.clone()).unwrap();

        monitor.sweep().await;
        assert_eq!(
            registry.descriptor("tidal").unwrap().health,
            HealthStatus::Down
        );
    }
}
