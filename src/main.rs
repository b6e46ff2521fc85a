mod api;
mod auth;
mod config;
mod deps;
mod error;
mod fsutil;
mod metrics;
mod project;
mod proxy;
mod scaffold;
mod supervisor;
mod tagger;
mod template;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::middleware;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::deps::DependencyHelper;
use crate::metrics::StartedAt;
use crate::project::ProjectManager;
use crate::supervisor::InstanceSupervisor;
use crate::tagger::SourceMapManager;
use crate::template::TemplateManager;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub deps: DependencyHelper,
    pub template: Arc<TemplateManager>,
    pub supervisor: Arc<InstanceSupervisor>,
    pub project: Arc<ProjectManager>,
    pub source_map: SourceMapManager,
    pub proxy_client: HyperClient<HttpConnector, Body>,
    pub hmr_broker: proxy::HmrBroker,
    pub started_at: StartedAt,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "preview_orchestrator=info,tower_http=info".into()),
        )
        .init();

    info!("Starting preview orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(AppConfig::from_env()?);
    info!(port = config.port, data_dir = %config.data_dir.display(), "configuration loaded");
    if !config.has_credentials() {
        warn!("FLY_API_KEY/FLY_API_SECRET not set — control plane running in unauthenticated development mode");
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let deps = DependencyHelper::new(config.bun_binary.clone());
    let template = Arc::new(TemplateManager::new(config.clone(), deps.clone()));
    let supervisor = Arc::new(InstanceSupervisor::new(config.clone(), deps.clone()));
    let project = Arc::new(ProjectManager::new(
        config.clone(),
        deps.clone(),
        template.clone(),
        supervisor.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        deps,
        template: template.clone(),
        supervisor: supervisor.clone(),
        project,
        source_map: SourceMapManager::new(),
        proxy_client: HyperClient::builder(TokioExecutor::new()).build_http::<Body>(),
        hmr_broker: proxy::HmrBroker::new(),
        started_at: StartedAt::now(),
    });

    supervisor.spawn_idle_sweeper();

    // Pre-warm the template in the background; the first `create` falls back
    // to the slow path itself if this hasn't finished yet.
    tokio::spawn(async move {
        if let Err(e) = template.initialize().await {
            warn!(error = %e, "template pre-warm failed — falls back to the slow path per project");
        }
    });

    let app = build_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let control_plane = api::projects::routes().layer(middleware::from_fn_with_state(
        state.clone(),
        auth::hmac_auth_middleware,
    ));

    // The `/__jsx-*` query endpoints are the only surface the spec calls
    // out as CORS-open (an external editor UI reads them from any origin).
    // Scoped to its own router so the permissive layer never reaches the
    // signed control plane or the proxy.
    let jsx_query_routes = Router::new()
        .route("/__jsx-source-map", get(tagger::map::source_map_handler))
        .route("/__jsx-locate", get(tagger::map::locate_handler))
        .route("/__jsx-by-file", get(tagger::map::by_file_handler))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/", get(welcome_handler))
        .route("/health", get(metrics::health_handler))
        .route("/health/ready", get(metrics::ready_handler))
        .route("/health/live", get(metrics::live_handler))
        .route("/health/metrics", get(metrics::metrics_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/health/debug/instances", get(metrics::debug_instances_handler))
        .merge(jsx_query_routes)
        .route_service("/static/visual-edit-script.js", ServeFile::new("static/visual-edit-script.js"))
        .route("/p/{project_id}", get(proxy::redirect_trailing_slash))
        .route("/p/{project_id}/{*rest}", any(proxy::proxy_handler_tail))
        .route("/hmr", any(proxy::hmr_handler))
        .route("/hmr/{*tail}", any(proxy::hmr_handler))
        .nest("/projects", control_plane)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}

async fn welcome_handler(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> Response {
    let running = state.supervisor.get_running_count().await;
    let total = state.config.max_instances;
    Html(format!(
        "<!doctype html><html><head><title>preview orchestrator</title></head>\
         <body><h1>preview orchestrator</h1>\
         <p>{running} of {total} instance slots in use.</p>\
         <p>See <code>/health/metrics</code> for the full snapshot.</p>\
         </body></html>"
    ))
    .into_response()
}

/// Waits for a terminate signal (`ctrl_c` or, on unix, `SIGTERM`), then drains
/// every running instance before the listener stops accepting connections.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, closing HMR splicer");
    state.hmr_broker.shutdown().await;

    info!("draining instances");
    state.supervisor.destroy().await;
}
