use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware::from_fn, Router};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::info;

use loki_core::config::Settings;
use loki_core::security::SecurityService;
use loki_db::postgres::{PgChainRepo, PgWebhookRepo};
use loki_db::repo::{ChainRepo, WebhookRepo};
use loki_engine::{ChainExecutor, DeliveryVerifier, EventDispatcher};

mod error;
mod middleware;
mod routes;
mod state;

use crate::middleware::request_log::request_log;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env()?;

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await?;

    let webhooks: Arc<dyn WebhookRepo> = Arc::new(PgWebhookRepo::new(db.clone()));
    let chains: Arc<dyn ChainRepo> = Arc::new(PgChainRepo::new(db));

    let security = Arc::new(SecurityService::new(
        settings.signing_key.clone(),
        settings.secret_length,
        settings.token_lifetime_hours,
    ));

    let delivery_timeout = Duration::from_secs(settings.delivery_timeout_seconds);
    let executor = Arc::new(ChainExecutor::new(
        chains.clone(),
        webhooks.clone(),
        security.clone(),
        delivery_timeout,
    )?);
    let dispatcher = Arc::new(EventDispatcher::new(
        webhooks.clone(),
        executor.clone(),
        security.clone(),
        delivery_timeout,
    )?);
    let verifier = Arc::new(DeliveryVerifier::new(
        webhooks.clone(),
        security.clone(),
        settings.timestamp_tolerance_minutes,
    ));

    let state = AppState {
        webhooks,
        chains,
        security,
        dispatcher,
        executor,
        verifier,
        settings: settings.clone(),
    };

    let app = Router::new()
        .merge(routes::health_router())
        .merge(routes::api_router(state))
        .layer(from_fn(request_log))
        .layer(axum::extract::DefaultBodyLimit::max(1_048_576));

    let addr: SocketAddr = settings.api_bind.parse()?;
    info!(%addr, "starting loki-suite api");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
