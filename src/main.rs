mod api;
mod config;
mod db;
mod error;
mod events;
mod notify;
mod policy;
mod realtime;
mod reconcile;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use config::Config;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devsync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    // Initialize database
    let db = db::init_database(&config.database_path)
        .await
        .expect("Failed to initialize database");
    tracing::info!("Database initialized at {:?}", config.database_path);

    // Application state: db handle, auth, room registry, event bus with the
    // realtime broadcaster and notification pipeline subscribed.
    let state = Arc::new(AppState::new(db));

    let cors = match &config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(
                origin
                    .parse::<HeaderValue>()
                    .expect("Invalid DEVSYNC_CORS_ORIGIN"),
            )
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
            ])
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let app = Router::new()
        .merge(api::api_router())
        .route("/ws", get(realtime::ws_handler))
        .route("/health", get(api::health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!("DevSync server starting on http://{}", addr);
    tracing::info!("Realtime endpoint: ws://{}/ws?token=<token>", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
