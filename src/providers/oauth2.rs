//! Generic OAuth2 provider client
//!
//! One reqwest-backed implementation of [`MusicProvider`] driven entirely by
//! descriptor endpoint data, so any OAuth2-with-PKCE provider is supported by
//! configuration alone. Token operations use the standard form-encoded
//! `grant_type` requests; item fetches use a simple cursor-paged JSON shape
//! (`{ "items": [...], "next_cursor": ..., "total": ... }`) served under the
//! provider's API base.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::crypto::SecretToken;
use crate::providers::descriptor::ProviderDescriptor;
use crate::providers::trait_::{
    Cursor, ExchangeCodeParams, FetchPage, FetchParams, MusicProvider, ProviderError, ProviderItem,
    TokenGrant,
};

/// Default deadline for any single round-trip to a provider.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Oauth2Provider {
    slug: String,
    client: reqwest::Client,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    token_url: String,
    revoke_url: Option<String>,
    api_base: Option<String>,
}

/// Wire shape of a token endpoint response. Providers that report profile
/// fields inline (common for music services) populate the optional tail.
#[derive(Debug, Deserialize)]
struct WireTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

/// Wire shape of an OAuth2 error payload (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct WireOauthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireItemPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    next_cursor: Option<serde_json::Value>,
    #[serde(default)]
    total: Option<u64>,
}

impl Oauth2Provider {
    pub fn from_descriptor(
        descriptor: &ProviderDescriptor,
        client_id: String,
        client_secret: Option<String>,
        redirect_uri: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::from)?;
        Ok(Self {
            slug: descriptor.slug.clone(),
            client,
            client_id,
            client_secret,
            redirect_uri,
            token_url: descriptor.token_url.clone(),
            revoke_url: descriptor.revoke_url.clone(),
            api_base: descriptor.api_base.clone(),
        })
    }

    /// POST a form to the token endpoint and parse the grant.
    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ProviderError> {
        let mut request = self.client.post(&self.token_url).form(form);
        if let Some(secret) = &self.client_secret {
            request = request.basic_auth(&self.client_id, Some(secret));
        }
        let response = request.send().await.map_err(ProviderError::from)?;

        match response.status() {
            status if status.is_success() => {
                let wire: WireTokenResponse = response.json().await.map_err(|err| {
                    ProviderError::MalformedResponse {
                        details: err.to_string(),
                    }
                })?;
                Ok(TokenGrant {
                    access_token: SecretToken::from(wire.access_token),
                    refresh_token: wire.refresh_token.map(SecretToken::from),
                    expires_in_secs: wire.expires_in,
                    granted_scopes: wire
                        .scope
                        .map(|scope| {
                            scope
                                .split_whitespace()
                                .map(|s| s.to_string())
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default(),
                    external_id: wire.user_id,
                    display_name: wire.display_name,
                })
            }
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited {
                retry_after_secs: retry_after_seconds(&response),
            }),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                match serde_json::from_str::<WireOauthError>(&body) {
                    Ok(oauth_error) => Err(ProviderError::GrantRejected {
                        details: oauth_error
                            .error_description
                            .unwrap_or_else(|| oauth_error.error.clone()),
                        error_code: Some(oauth_error.error),
                    }),
                    Err(_) => Err(ProviderError::Http { status, body }),
                }
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Http {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[async_trait]
impl MusicProvider for Oauth2Provider {
    async fn exchange_code(&self, params: ExchangeCodeParams) -> Result<TokenGrant, ProviderError> {
        debug!(provider = %self.slug, "exchanging authorization code");
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", &params.code),
            ("code_verifier", &params.code_verifier),
            ("redirect_uri", &params.redirect_uri),
            ("client_id", &self.client_id),
        ])
        .await
    }

    async fn refresh_token(
        &self,
        refresh_token: &SecretToken,
    ) -> Result<TokenGrant, ProviderError> {
        debug!(provider = %self.slug, "refreshing access token");
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
            ("client_id", &self.client_id),
        ])
        .await
    }

    async fn revoke_token(&self, token: &SecretToken) -> Result<(), ProviderError> {
        let Some(revoke_url) = &self.revoke_url else {
            debug!(provider = %self.slug, "provider has no revocation endpoint, skipping");
            return Ok(());
        };
        let mut request = self.client.post(revoke_url).form(&[
            ("token", token.expose()),
            ("client_id", self.client_id.as_str()),
        ]);
        if let Some(secret) = &self.client_secret {
            request = request.basic_auth(&self.client_id, Some(secret));
        }
        let response = request.send().await.map_err(ProviderError::from)?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::Http { status, body })
        }
    }

    async fn fetch_page(&self, params: FetchParams) -> Result<FetchPage, ProviderError> {
        let api_base = self
            .api_base
            .as_deref()
            .ok_or_else(|| ProviderError::Http {
                status: 404,
                body: format!("provider '{}' has no API base configured", self.slug),
            })?;
        let url = format!(
            "{}/{}",
            api_base.trim_end_matches('/'),
            params.collection.trim_start_matches('/')
        );

        let limit = params.limit.to_string();
        let mut query: Vec<(&str, String)> = vec![("limit", limit)];
        if let Some(cursor) = &params.cursor {
            let raw = match cursor.as_str() {
                Some(s) => s.to_string(),
                None => cursor.as_json().to_string(),
            };
            query.push(("cursor", raw));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .bearer_auth(params.access_token.expose())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(ProviderError::from)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::GrantRejected {
                details: "access token rejected by provider".to_string(),
                error_code: None,
            });
        }
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after_seconds(&response),
            });
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let page: WireItemPage =
            response
                .json()
                .await
                .map_err(|err| ProviderError::MalformedResponse {
                    details: err.to_string(),
                })?;

        let items = page
            .items
            .into_iter()
            .map(|payload| {
                let external_id = payload
                    .get("id")
                    .map(|id| match id {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .ok_or_else(|| ProviderError::MalformedResponse {
                        details: "item without an 'id' field".to_string(),
                    })?;
                Ok(ProviderItem {
                    external_id,
                    payload,
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        let next_cursor = page.next_cursor.filter(|v| !v.is_null()).map(Cursor::from);
        Ok(FetchPage {
            has_more: next_cursor.is_some(),
            items,
            next_cursor,
            estimated_total: page.total,
        })
    }
}

fn retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::descriptor::{HealthStatus, Platform};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor_for(server_uri: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            slug: "spotify".to_string(),
            display_name: "Spotify".to_string(),
            auth_url: format!("{server_uri}/authorize"),
            token_url: format!("{server_uri}/api/token"),
            revoke_url: Some(format!("{server_uri}/api/revoke")),
            api_base: Some(format!("{server_uri}/v1")),
            scopes: vec!["library-read".to_string()],
            rate_limit_per_minute: 60,
            platforms: Platform::ALL.to_vec(),
            health: HealthStatus::Healthy,
            maintenance_mode: false,
        }
    }

    fn provider_for(server_uri: &str, timeout: Duration) -> Oauth2Provider {
        Oauth2Provider::from_descriptor(
            &descriptor_for(server_uri),
            "client-id".to_string(),
            Some("client-secret".to_string()),
            "https://app.example.com/callback".to_string(),
            timeout,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn code_exchange_parses_grant_and_sends_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier=the-verifier"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-123",
                "refresh_token": "rt-456",
                "expires_in": 3600,
                "scope": "library-read playlists-read",
                "user_id": "user-789",
                "display_name": "Listener",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri(), DEFAULT_REQUEST_TIMEOUT);
        let grant = provider
            .exchange_code(ExchangeCodeParams {
                code: "the-code".to_string(),
                code_verifier: "the-verifier".to_string(),
                redirect_uri: "https://app.example.com/callback".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(grant.access_token.expose(), "at-123");
        assert_eq!(grant.refresh_token.unwrap().expose(), "rt-456");
        assert_eq!(grant.expires_in_secs, Some(3600));
        assert_eq!(grant.granted_scopes, vec!["library-read", "playlists-read"]);
        assert_eq!(grant.external_id.as_deref(), Some("user-789"));
    }

    #[tokio::test]
    async fn invalid_grant_maps_to_grant_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Refresh token revoked",
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri(), DEFAULT_REQUEST_TIMEOUT);
        let result = provider
            .refresh_token(&SecretToken::from("stale".to_string()))
            .await;

        match result {
            Err(ProviderError::GrantRejected {
                details,
                error_code,
            }) => {
                assert_eq!(details, "Refresh token revoked");
                assert_eq!(error_code.as_deref(), Some("invalid_grant"));
            }
            other => panic!("expected GrantRejected, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "17"))
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri(), DEFAULT_REQUEST_TIMEOUT);
        let result = provider
            .refresh_token(&SecretToken::from("rt".to_string()))
            .await;

        match result {
            Err(ProviderError::RateLimited { retry_after_secs }) => {
                assert_eq!(retry_after_secs, Some(17));
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn deadline_expiry_surfaces_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(serde_json::json!({ "access_token": "late" })),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri(), Duration::from_millis(50));
        let result = provider
            .refresh_token(&SecretToken::from("rt".to_string()))
            .await;

        match result {
            Err(ProviderError::Network { timed_out, .. }) => assert!(timed_out),
            other => panic!("expected Network timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn fetch_page_parses_items_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/library"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    { "id": "track-1", "title": "First" },
                    { "id": "track-2", "title": "Second" },
                ],
                "next_cursor": "page-2",
                "total": 120,
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri(), DEFAULT_REQUEST_TIMEOUT);
        let page = provider
            .fetch_page(FetchParams {
                access_token: SecretToken::from("at".to_string()),
                collection: "library".to_string(),
                cursor: None,
                limit: 50,
            })
            .await
            .unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].external_id, "track-1");
        assert_eq!(page.next_cursor, Some(Cursor::from_string("page-2")));
        assert!(page.has_more);
        assert_eq!(page.estimated_total, Some(120));
    }

    #[tokio::test]
    async fn fetch_page_unauthorized_maps_to_grant_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/library"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = provider_for(&server.uri(), DEFAULT_REQUEST_TIMEOUT);
        let result = provider
            .fetch_page(FetchParams {
                access_token: SecretToken::from("expired".to_string()),
                collection: "library".to_string(),
                cursor: None,
                limit: 50,
            })
            .await;

        assert!(matches!(result, Err(ProviderError::GrantRejected { .. })));
    }

    #[tokio::test]
    async fn revoke_without_endpoint_is_a_no_op() {
        let mut descriptor = descriptor_for("http://localhost:9");
        descriptor.revoke_url = None;
        let provider = Oauth2Provider::from_descriptor(
            &descriptor,
            "client-id".to_string(),
            None,
            "https://app.example.com/callback".to_string(),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .unwrap();

        provider
            .revoke_token(&SecretToken::from("at".to_string()))
            .await
            .unwrap();
    }
}
