pub mod chains;
pub mod health;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .merge(webhooks::router(state.clone()))
        .merge(chains::router(state))
}

pub fn health_router() -> Router {
    health::router()
}
