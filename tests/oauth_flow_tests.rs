//! End-to-end tests for the authorization flow: initiate, callback and
//! cancel through the HTTP surface, with a mock provider token endpoint.

use std::collections::BTreeMap;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use serde_json::{Value, json};
use tower::ServiceExt;
use tunesync::config::{AppConfig, ProviderConfig};
use tunesync::server::{AppState, create_app};
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OPERATOR_TOKEN: &str = "test-operator-token";

async fn test_app(provider_base: &str) -> (Router, AppState) {
    let mut providers = BTreeMap::new();
    providers.insert(
        "spotify".to_string(),
        ProviderConfig {
            client_id: Some("client-123".to_string()),
            client_secret: None,
            auth_url: Some(format!("{}/authorize", provider_base)),
            token_url: Some(format!("{}/token", provider_base)),
            api_base: Some(format!("{}/api", provider_base)),
            scopes: vec!["user-library-read".to_string(), "playlists".to_string()],
        },
    );
    let config = AppConfig {
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![7u8; 32]),
        providers,
        ..Default::default()
    };

    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();

    let state = AppState::build(config, db).unwrap();
    (create_app(state.clone()), state)
}

async fn call(
    app: &Router,
    user_id: Uuid,
    method_name: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method_name)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", OPERATOR_TOKEN))
        .header("X-User-Id", user_id.to_string());
    let body = match body {
        Some(json) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn token_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": "at-1",
        "refresh_token": "rt-1",
        "expires_in": 3600,
        "scope": "user-library-read",
        "user_id": "acct-1",
        "display_name": "Alex"
    }))
}

#[tokio::test]
async fn initiate_and_callback_establish_a_connection() {
    let server = MockServer::start().await;
    let (app, _state) = test_app(&server.uri()).await;
    let user_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(token_response())
        .expect(1)
        .mount(&server)
        .await;

    let (status, initiated) = call(
        &app,
        user_id,
        "POST",
        "/authorize/spotify",
        Some(json!({ "platform": "web", "scopes": ["user-library-read"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let authorize_url = initiated["authorize_url"].as_str().unwrap();
    let state_token = initiated["state"].as_str().unwrap();
    assert!(authorize_url.starts_with(&format!("{}/authorize", server.uri())));
    assert!(authorize_url.contains("code_challenge_method=S256"));
    assert!(authorize_url.contains(state_token));

    let (status, completed) = call(
        &app,
        user_id,
        "POST",
        "/oauth/callback",
        Some(json!({
            "code": "auth-code",
            "state": state_token,
            "session_id": initiated["session_id"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completed["provider"], "spotify");
    assert_eq!(completed["external_id"], "acct-1");
    assert_eq!(completed["granted_scopes"], json!(["user-library-read"]));

    let (status, listed) = call(&app, user_id, "GET", "/connections", None).await;
    assert_eq!(status, StatusCode::OK);
    let connections = listed["connections"].as_array().unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0]["status"], "connected");
    assert_eq!(connections[0]["health"], "healthy");
    assert_eq!(connections[0]["display_name"], "Alex");
}

#[tokio::test]
async fn unknown_provider_and_unknown_state_are_rejected() {
    let server = MockServer::start().await;
    let (app, _state) = test_app(&server.uri()).await;
    let user_id = Uuid::new_v4();

    let (status, body) = call(
        &app,
        user_id,
        "POST",
        "/authorize/tidal",
        Some(json!({ "platform": "web" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = call(
        &app,
        user_id,
        "POST",
        "/oauth/callback",
        Some(json!({ "code": "auth-code", "state": "never-issued" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn rejected_code_exchange_surfaces_as_authorization_failure() {
    let server = MockServer::start().await;
    let (app, _state) = test_app(&server.uri()).await;
    let user_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "code expired"
        })))
        .mount(&server)
        .await;

    let (_, initiated) = call(
        &app,
        user_id,
        "POST",
        "/authorize/spotify",
        Some(json!({ "platform": "web" })),
    )
    .await;
    let state_token = initiated["state"].as_str().unwrap();

    let (status, body) = call(
        &app,
        user_id,
        "POST",
        "/oauth/callback",
        Some(json!({ "code": "bad-code", "state": state_token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTHORIZATION_FAILED");
}

#[tokio::test]
async fn cancelled_session_rejects_the_callback() {
    let server = MockServer::start().await;
    let (app, _state) = test_app(&server.uri()).await;
    let user_id = Uuid::new_v4();

    let (_, initiated) = call(
        &app,
        user_id,
        "POST",
        "/authorize/spotify",
        Some(json!({ "platform": "web" })),
    )
    .await;
    let session_id = initiated["session_id"].as_str().unwrap();
    let state_token = initiated["state"].as_str().unwrap();

    let (status, cancelled) = call(
        &app,
        user_id,
        "POST",
        &format!("/authorize/sessions/{}/cancel", session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["cancelled"], true);

    let (status, _) = call(
        &app,
        user_id,
        "POST",
        "/oauth/callback",
        Some(json!({ "code": "auth-code", "state": state_token })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn requests_without_operator_token_are_unauthorized() {
    let server = MockServer::start().await;
    let (app, _state) = test_app(&server.uri()).await;

    let request = Request::builder()
        .method("GET")
        .uri("/connections")
        .header("X-User-Id", Uuid::new_v4().to_string())
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
