use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use sensorhub::bridge::Bridge;
use sensorhub::bus::EventBus;
use sensorhub::config::HubConfig;
use sensorhub::store::Db;
use sensorhub::{AppState, handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("sensorhub=debug,tower_http=debug")
        }))
        .init();

    let config_path = std::env::var("HUB_CONFIG").unwrap_or_else(|_| "./hub.toml".to_string());
    let mut config = HubConfig::load(&config_path)?;
    if let Ok(path) = std::env::var("HUB_STORAGE_PATH") {
        config.storage.path = path;
    }

    let db = Arc::new(Db::open(&config.storage)?);
    tracing::info!(
        "database #{} opened at {}",
        config.storage.database_num,
        config.storage.path
    );

    let bus = EventBus::new();
    let _bridge = Bridge::new(db.clone(), bus.clone());
    if !config.storage.read_only {
        Db::spawn_auto_commit(db.clone(), config.storage.auto_commit_period_secs);
    }

    let state = AppState { db, bus };

    let api = Router::new()
        // Systems
        .route(
            "/systems",
            get(handlers::systems::list_systems).post(handlers::systems::create_systems),
        )
        .route("/systems/count", get(handlers::systems::count_systems))
        .route(
            "/systems/{id}",
            get(handlers::systems::get_system)
                .put(handlers::systems::update_system)
                .delete(handlers::systems::delete_system),
        )
        .route(
            "/systems/{id}/datastreams",
            get(handlers::systems::list_system_datastreams)
                .post(handlers::systems::create_system_datastream),
        )
        .route(
            "/systems/{id}/observations",
            get(handlers::systems::list_system_observations),
        )
        // Features of interest
        .route(
            "/fois",
            get(handlers::fois::list_fois).post(handlers::fois::create_fois),
        )
        .route("/fois/count", get(handlers::fois::count_fois))
        .route(
            "/fois/{id}",
            get(handlers::fois::get_foi)
                .put(handlers::fois::update_foi)
                .delete(handlers::fois::delete_foi),
        )
        // Data streams
        .route("/datastreams", get(handlers::datastreams::list_datastreams))
        .route(
            "/datastreams/count",
            get(handlers::datastreams::count_datastreams),
        )
        .route(
            "/datastreams/{id}",
            get(handlers::datastreams::get_datastream)
                .put(handlers::datastreams::update_datastream)
                .delete(handlers::datastreams::delete_datastream),
        )
        // Observations
        .route(
            "/observations",
            get(handlers::observations::list_observations)
                .post(handlers::observations::create_observations),
        )
        .route(
            "/observations/count",
            get(handlers::observations::count_observations),
        )
        .route(
            "/observations/{id}",
            get(handlers::observations::get_observation)
                .put(handlers::observations::update_observation)
                .delete(handlers::observations::delete_observation),
        );

    let app = Router::new()
        .nest(&config.http.path_prefix, api)
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: std::net::SocketAddr = config.http.addr.parse()?;
    tracing::info!("sensorhub listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
