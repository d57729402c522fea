//! # Server Configuration
//!
//! Application state wiring, the Axum router and the serve loop with its background
//! schedulers.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::cache::{CacheStore, IdempotencyStore, WidgetCache, build_cache};
use crate::config::AppConfig;
use crate::connection_service::ConnectionService;
use crate::connectors::{Registry, build_registry};
use crate::crypto::TokenCipher;
use crate::events::EventBus;
use crate::handlers;
use crate::oauth_flow::OAuthFlowService;
use crate::repositories::{ConnectionRepository, OAuthStateRepository};
use crate::scheduler::SyncScheduler;
use crate::telemetry::trace_context_middleware;
use crate::token_refresh::TokenRefreshService;
use crate::webhooks::{MAX_WEBHOOK_BODY_BYTES, WebhookGate};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub registry: Arc<Registry>,
    pub events: EventBus,
    pub connections: ConnectionService,
    pub oauth: OAuthFlowService,
    pub webhooks: WebhookGate,
    pub scheduler: SyncScheduler,
    pub token_refresh: TokenRefreshService,
}

impl AppState {
    /// Wires every service over one database, registry, cipher and cache.
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        registry: Registry,
        cipher: TokenCipher,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let db = Arc::new(db);
        let registry = Arc::new(registry);
        let events = EventBus::default();
        let connection_repo = ConnectionRepository::new(Arc::clone(&db), Arc::new(cipher));
        let state_repo = OAuthStateRepository::new(Arc::clone(&db));
        let widget_cache = WidgetCache::new(Arc::clone(&cache));
        let idempotency = IdempotencyStore::new(cache, config.idempotency_ttl());

        let connections = ConnectionService::new(
            Arc::clone(&registry),
            connection_repo.clone(),
            widget_cache.clone(),
            events.clone(),
        );
        let oauth = OAuthFlowService::new(
            Arc::clone(&registry),
            connection_repo.clone(),
            state_repo.clone(),
            widget_cache.clone(),
            events.clone(),
            Arc::clone(&config),
        );
        let webhooks = WebhookGate::new(
            Arc::clone(&registry),
            connection_repo.clone(),
            idempotency,
            widget_cache,
            events.clone(),
        );
        let scheduler = SyncScheduler::new(Arc::clone(&config), connections.clone(), events.clone());
        let token_refresh = TokenRefreshService::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            connection_repo,
            state_repo,
            events.clone(),
        );

        Self {
            config,
            db,
            registry,
            events,
            connections,
            oauth,
            webhooks,
            scheduler,
            token_refresh,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/providers", get(handlers::providers::list_providers))
        .route("/providers/{provider}", get(handlers::providers::get_provider))
        .route("/connections", get(handlers::connections::list_connections))
        .route(
            "/connections/{provider}",
            get(handlers::connections::get_connection),
        )
        .route(
            "/connections/{provider}/connect",
            post(handlers::connections::connect),
        )
        .route(
            "/connections/{provider}/reconnect",
            post(handlers::connections::reconnect),
        )
        .route(
            "/connections/{provider}/disconnect",
            post(handlers::connections::disconnect),
        )
        .route(
            "/connections/{provider}/test",
            post(handlers::connections::test_connection),
        )
        .route(
            "/connections/{provider}/sync",
            post(handlers::connections::sync_connection),
        )
        .route(
            "/connections/{provider}/widgets",
            put(handlers::connections::update_widgets),
        )
        .route(
            "/connections/{provider}/widgets/{widget_id}",
            get(handlers::connections::get_widget_data),
        )
        .route(
            "/connections/{provider}/config",
            put(handlers::connections::update_config),
        )
        .route(
            "/connections/{provider}/webhook",
            put(handlers::connections::bind_webhook),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/oauth/callback/{provider}",
            get(handlers::oauth::oauth_callback),
        )
        .route(
            "/webhooks/{provider}",
            post(handlers::webhooks::ingest_webhook).layer(
                axum::extract::DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES),
            ),
        );

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Builds the state from configuration and serves until Ctrl-C, running the token
/// refresh and sync schedulers alongside.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let cipher = TokenCipher::new(config.encryption_key_bytes()?)
        .context("Failed to initialise token cipher")?;
    let registry = build_registry(&config).context("Failed to build connector registry")?;
    let cache = build_cache(&config).context("Failed to initialise cache")?;
    tracing::info!(
        providers = ?registry.slugs(),
        cache_backend = cache.backend(),
        "Connector registry ready"
    );

    let state = AppState::new(Arc::clone(&config), db, registry, cipher, cache);
    let shutdown = CancellationToken::new();

    let token_refresh = state.token_refresh.clone();
    let refresh_shutdown = shutdown.clone();
    let refresh_task = tokio::spawn(async move { token_refresh.run(refresh_shutdown).await });

    let scheduler = state.scheduler.clone();
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    let addr = config.bind_addr().context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    let app = create_app(state);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = tokio::join!(refresh_task, scheduler_task);
    tracing::info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::providers::list_providers,
        crate::handlers::providers::get_provider,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::connect,
        crate::handlers::connections::reconnect,
        crate::handlers::connections::disconnect,
        crate::handlers::connections::test_connection,
        crate::handlers::connections::sync_connection,
        crate::handlers::connections::get_widget_data,
        crate::handlers::connections::update_widgets,
        crate::handlers::connections::update_config,
        crate::handlers::connections::bind_webhook,
        crate::handlers::oauth::oauth_callback,
        crate::handlers::webhooks::ingest_webhook,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::ConnectionResponse,
            crate::models::ConnectionStatus,
            crate::models::SyncStatus,
            crate::connectors::ProviderMetadata,
            crate::connectors::Capability,
            crate::connectors::WidgetDefinition,
            crate::connectors::SignatureScheme,
            crate::connectors::SignatureEncoding,
            crate::connection_service::WidgetPayload,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::providers::ProvidersResponse,
            crate::handlers::connections::ConnectionsResponse,
            crate::handlers::connections::ConnectRequest,
            crate::handlers::connections::AuthorizationResponse,
            crate::handlers::connections::TestConnectionResponse,
            crate::handlers::connections::UpdateWidgetsRequest,
            crate::handlers::connections::BindWebhookRequest,
            crate::handlers::webhooks::WebhookAcceptResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service endpoints"),
        (name = "providers", description = "Registered provider connectors"),
        (name = "connections", description = "Workspace connection management"),
        (name = "oauth", description = "OAuth redirect handling"),
        (name = "webhooks", description = "Provider webhook intake"),
    ),
    info(
        title = "Integration Hub API",
        description = "OAuth connection lifecycle, widget data and webhook intake for third-party providers",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
