use std::{net::SocketAddr, sync::Arc};

use axum::{extract::DefaultBodyLimit, middleware as axum_middleware, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use services::storage::{ImageConstraints, ImageStore, LocalImageStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chantier_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::from_env();

    // Initialize database
    let db = db::Database::connect(&config.database_url).await?;
    db.run_migrations().await?;

    // Photo storage
    let images = LocalImageStore::new(&config.media_path, &config.media_url);
    images.init().await?;

    let state = AppState {
        db,
        config: config.clone(),
        images: Arc::new(images),
    };

    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn app(state: AppState) -> Router {
    // Build protected routes (require authentication)
    let protected_routes = Router::new()
        .route("/me", get(routes::auth::me))
        .nest("/projects", routes::projects::router())
        .nest("/phases", routes::phases::router())
        .nest("/tasks", routes::tasks::router())
        .nest("/hours", routes::hours::router())
        .nest("/photos", routes::photos::router())
        .nest("/anomalies", routes::anomalies::router())
        .nest("/teams", routes::teams::router())
        .nest("/members", routes::members::router())
        .nest("/subcontractors", routes::subcontractors::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    let api_router = Router::new()
        .nest("/auth", routes::auth::router())
        .merge(protected_routes);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_router)
        .nest_service(
            &state.config.media_url,
            ServeDir::new(&state.config.media_path),
        )
        .layer(DefaultBodyLimit::max(state.config.max_request_bytes))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Clone)]
pub struct AppState {
    pub db: db::Database,
    pub config: config::Config,
    pub images: Arc<dyn ImageStore>,
}

impl AppState {
    pub fn image_constraints(&self) -> ImageConstraints {
        ImageConstraints::new(self.config.max_image_bytes)
    }
}
