use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use roomhub_server::config::CorsConfig;
use roomhub_server::{configure_routes, AppError, AppState, AuthService, Hub, PgStore, Settings, WebSocketServer};
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:8080")
            .allowed_origin("http://127.0.0.1:8080")
            .allowed_methods(vec!["GET"])
    };

    cors.max_age(config.max_age as usize)
}

#[actix_web::main]
async fn main() -> roomhub_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new()?;
    info!("Configuration loaded successfully");

    let store = PgStore::new_with_options(
        &config.database.url,
        config.database.max_connections,
        Duration::from_secs(5),
    )
    .await?;
    // Not fatal: the schema may already exist.
    if let Err(e) = store.run_migrations().await {
        warn!(error = %e, "Migration failed, continuing with existing schema");
    }
    let store = Arc::new(store);

    let hub = Hub::spawn();
    let ws_server = Arc::new(WebSocketServer::new(
        hub.clone(),
        store.clone(),
        store.clone(),
        Arc::new(AuthService::new(config.auth.jwt_secret.clone())),
        config.websocket.clone(),
    ));

    let ws_listener = TcpListener::bind((config.websocket.host.as_str(), config.websocket.port)).await?;
    tokio::spawn(ws_server.serve(ws_listener));

    let listener = StdTcpListener::bind((config.server.host.as_str(), config.server.port))?;
    info!("Diagnostics available at http://{}:{}/health", config.server.host, config.server.port);

    let workers = config.server.workers as usize;
    let cors_config = config.cors.clone();
    let state = web::Data::new(AppState::new(config, hub));

    HttpServer::new(move || {
        App::new()
            .wrap(cors(&cors_config))
            .app_data(state.clone())
            .configure(configure_routes)
    })
    .listen(listener)?
    .workers(workers)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(())
}
