use std::sync::Arc;

use loki_core::config::Settings;
use loki_core::security::SecurityService;
use loki_db::repo::{ChainRepo, WebhookRepo};
use loki_engine::{ChainExecutor, DeliveryVerifier, EventDispatcher};

#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<dyn WebhookRepo>,
    pub chains: Arc<dyn ChainRepo>,
    pub security: Arc<SecurityService>,
    pub dispatcher: Arc<EventDispatcher>,
    pub executor: Arc<ChainExecutor>,
    pub verifier: Arc<DeliveryVerifier>,
    pub settings: Settings,
}
