//! # Server Configuration
//!
//! Application state assembly, the Axum router, and the server entry point
//! that spawns the background services alongside the HTTP listener.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::audit::SecurityAuditLogger;
use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::connection_store::ConnectionStore;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::oauth_session::OauthSessionManager;
use crate::providers::{HealthMonitor, ProviderRegistry};
use crate::repositories::{AuthSessionRepository, ConnectionRepository, SyncJobRepository};
use crate::scheduler::SyncScheduler;
use crate::sync::{SyncOrchestrator, TracingSink};
use crate::telemetry::{TraceContext, generate_trace_id, with_trace_context};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub registry: Arc<ProviderRegistry>,
    pub store: Arc<ConnectionStore>,
    pub sessions: Arc<OauthSessionManager>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub audit: Arc<SecurityAuditLogger>,
}

impl AppState {
    /// Wire up the full service graph from configuration and a database
    /// pool. Fails when the crypto key is missing or malformed, or when a
    /// configured provider cannot be constructed.
    pub fn build(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let db = Arc::new(db);

        let key_bytes = config
            .crypto_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TUNESYNC_CRYPTO_KEY is required"))?;
        let crypto_key = CryptoKey::new(key_bytes)?;

        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        let audit = Arc::new(SecurityAuditLogger::new(Arc::clone(&db), &config.audit));

        let connections = ConnectionRepository::new(Arc::clone(&db), crypto_key);
        let store = Arc::new(ConnectionStore::new(
            Arc::clone(&config),
            connections,
            Arc::clone(&registry),
            Arc::clone(&audit),
        ));
        let sessions = Arc::new(OauthSessionManager::new(
            Arc::clone(&config),
            AuthSessionRepository::new(Arc::clone(&db)),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&audit),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&config),
            SyncJobRepository::new(Arc::clone(&db)),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(TracingSink),
            Arc::clone(&audit),
        ));

        Ok(Self {
            config,
            db,
            registry,
            store,
            sessions,
            orchestrator,
            audit,
        })
    }
}

/// Attach a fresh trace context to the request and keep it available for
/// the duration of the request task.
async fn trace_middleware(mut request: Request, next: Next) -> Response {
    let context = TraceContext {
        trace_id: generate_trace_id(),
    };
    request.extensions_mut().insert(context.clone());
    with_trace_context(context, next.run(request)).await
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/authorize/{provider}",
            post(handlers::authorize::initiate_authorization),
        )
        .route("/oauth/callback", post(handlers::authorize::oauth_callback))
        .route(
            "/authorize/sessions/{session_id}/cancel",
            post(handlers::authorize::cancel_session),
        )
        .route(
            "/connections",
            get(handlers::connections::list_connections),
        )
        .route(
            "/connections/{connection_id}",
            delete(handlers::connections::disconnect_connection),
        )
        .route(
            "/connections/{connection_id}/sync",
            post(handlers::sync::start_sync),
        )
        .route("/sync/jobs/{job_id}", get(handlers::sync::sync_job_status))
        .route(
            "/sync/jobs/{job_id}/control",
            post(handlers::sync::control_sync_job),
        )
        .route("/providers", get(handlers::providers::list_providers))
        .route("/audit/alerts", get(handlers::audit::list_alerts))
        .route(
            "/audit/alerts/{alert_id}/acknowledge",
            post(handlers::audit::acknowledge_alert),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .merge(protected)
        .layer(middleware::from_fn(trace_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the HTTP listener and the background services, shutting down
/// both on SIGINT.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = config.profile.clone();

    let state = AppState::build(config, db)?;
    let shutdown = CancellationToken::new();
    let background = spawn_background_services(&state, &shutdown)?;

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %profile, "server listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }

    Ok(())
}

/// Spawn the refresh, sweeper, scheduler, health and audit loops. Each
/// owns a clone of the shutdown token and exits when it fires.
fn spawn_background_services(
    state: &AppState,
    shutdown: &CancellationToken,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let mut handles = Vec::new();

    {
        let store = Arc::clone(&state.store);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { store.run_refresh(token).await }));
    }
    {
        let sessions = Arc::clone(&state.sessions);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { sessions.run_sweeper(token).await }));
    }
    {
        let scheduler = SyncScheduler::new(
            Arc::clone(&state.config),
            Arc::clone(&state.store),
            Arc::clone(&state.registry),
            Arc::clone(&state.orchestrator),
        );
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { scheduler.run(token).await }));
    }
    {
        let monitor = HealthMonitor::new(Arc::clone(&state.registry))?;
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { monitor.run(token).await }));
    }
    {
        let audit = Arc::clone(&state.audit);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { audit.run_purge(token).await }));
    }

    Ok(handles)
}

/// Adds the bearer token security scheme referenced by the handlers.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .description(Some("Operator bearer token"))
                    .build(),
            ),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::authorize::initiate_authorization,
        crate::handlers::authorize::oauth_callback,
        crate::handlers::authorize::cancel_session,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::disconnect_connection,
        crate::handlers::sync::start_sync,
        crate::handlers::sync::sync_job_status,
        crate::handlers::sync::control_sync_job,
        crate::handlers::providers::list_providers,
        crate::handlers::audit::list_alerts,
        crate::handlers::audit::acknowledge_alert,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::providers::Platform,
            crate::providers::HealthStatus,
            crate::providers::ProviderDescriptor,
            crate::models::connection::ConnectionStatus,
            crate::models::sync_job::SyncType,
            crate::models::sync_job::JobStatus,
            crate::sync::ControlAction,
            crate::handlers::authorize::InitiateAuthorizationRequest,
            crate::handlers::authorize::InitiateAuthorizationResponse,
            crate::handlers::authorize::OauthCallbackRequest,
            crate::handlers::authorize::OauthCallbackResponse,
            crate::handlers::authorize::CancelSessionResponse,
            crate::handlers::connections::ConnectionInfo,
            crate::handlers::connections::ConnectionsResponse,
            crate::handlers::connections::DisconnectRequest,
            crate::handlers::connections::DisconnectResponse,
            crate::handlers::sync::StartSyncRequest,
            crate::handlers::sync::StartSyncResponse,
            crate::handlers::sync::PhaseProgress,
            crate::handlers::sync::SyncJobResponse,
            crate::handlers::sync::ControlSyncRequest,
            crate::handlers::sync::ControlSyncResponse,
            crate::handlers::providers::ListProvidersQuery,
            crate::handlers::providers::ProvidersResponse,
            crate::handlers::audit::ListAlertsQuery,
            crate::handlers::audit::AlertInfo,
            crate::handlers::audit::AlertsResponse,
            crate::handlers::audit::AcknowledgeResponse,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "TuneSync API",
        description = "Provider connection lifecycle and phased music library synchronization",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
