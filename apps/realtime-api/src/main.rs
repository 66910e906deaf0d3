use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use realtime_api::auth::tokens::{CredentialResolver, JwtResolver};
use realtime_api::config::Config;
use realtime_api::db::postgres::PgRepository;
use realtime_api::db::repository::Repository;
use realtime_api::gateway::backplane::{Backplane, MemoryBackplane, RedisBackplane};
use realtime_api::routes::ApiDoc;
use realtime_api::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let pool = realtime_api::db::pool::connect(&config.database_url)?;
    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool));
    let resolver: Arc<dyn CredentialResolver> = Arc::new(JwtResolver::new(&config.jwt_secret));

    let backplane: Arc<dyn Backplane> = match &config.redis_url {
        Some(url) => {
            let redis = RedisBackplane::connect(url, config.backplane_max_backoff).await?;
            redis.spawn_listener();
            Arc::new(redis)
        }
        None => {
            tracing::warn!("REDIS_URL not set, events reach this instance's connections only");
            Arc::new(MemoryBackplane::new())
        }
    };

    tracing::info!(
        instance_id = %config.instance_id,
        outbound_queue = config.outbound_queue_size,
        "realtime-api configured"
    );

    let state = AppState::new(config, repo, resolver, backplane);
    state.gateway.spawn_backplane_listener();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(realtime_api::routes::router())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "realtime-api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
