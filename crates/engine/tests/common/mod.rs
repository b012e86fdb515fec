//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use loki_core::security::SecurityService;
use loki_db::memory::{MemoryChainRepo, MemoryWebhookRepo};
use loki_db::models::{ChainRun, RunStatus, Subscription, SubscriptionKind};
use loki_db::repo::ChainRepo;
use loki_engine::{ChainExecutor, DeliveryVerifier, EventDispatcher};

pub const TENANT_A: &str = "tenant-a";
pub const TENANT_B: &str = "tenant-b";

pub struct TestHarness {
    pub webhooks: Arc<MemoryWebhookRepo>,
    pub chains: Arc<MemoryChainRepo>,
    pub security: Arc<SecurityService>,
    pub executor: Arc<ChainExecutor>,
    pub dispatcher: EventDispatcher,
}

pub fn harness() -> TestHarness {
    let webhooks = MemoryWebhookRepo::new();
    let chains = MemoryChainRepo::new();
    let security = Arc::new(SecurityService::new(
        "engine-test-signing-key-long-enough",
        32,
        24,
    ));

    let executor = Arc::new(
        ChainExecutor::new(
            chains.clone(),
            webhooks.clone(),
            security.clone(),
            Duration::from_secs(5),
        )
        .expect("executor builds"),
    );
    let dispatcher = EventDispatcher::new(
        webhooks.clone(),
        executor.clone(),
        security.clone(),
        Duration::from_secs(5),
    )
    .expect("dispatcher builds");

    TestHarness {
        webhooks,
        chains,
        security,
        executor,
        dispatcher,
    }
}

pub fn verifier(h: &TestHarness) -> DeliveryVerifier {
    DeliveryVerifier::new(h.webhooks.clone(), h.security.clone(), 5)
}

/// A minimal active public subscription; tests override fields as needed.
pub fn subscription(tenant: &str, event: &str, target_url: &str, secret: &str) -> Subscription {
    let now = Utc::now();
    Subscription {
        id: Uuid::new_v4(),
        tenant_id: tenant.to_string(),
        app_name: "test-app".to_string(),
        target_url: target_url.to_string(),
        subscribed_event: event.to_string(),
        kind: SubscriptionKind::Public,
        secret: secret.to_string(),
        bearer_token: None,
        headers: None,
        query_params: None,
        payload_fragment: None,
        max_retries: 3,
        retry_delay_seconds: 0,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

/// Poll until the run leaves Running (or the deadline passes) and return it.
pub async fn wait_for_run_settled(chains: &MemoryChainRepo, run_id: Uuid) -> ChainRun {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(run) = chains.run(run_id).await {
            if run.status != RunStatus::Running {
                return run;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("run {run_id} did not settle in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the chain has a settled run and return it.
pub async fn wait_for_triggered_run(chains: &MemoryChainRepo, chain_id: Uuid) -> ChainRun {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (runs, _) = chains.list_runs(chain_id, 0, 10).await.expect("list runs");
        if let Some(run) = runs.first() {
            if run.status != RunStatus::Running {
                return chains.run(run.id).await.expect("run exists");
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("chain {chain_id} did not produce a settled run in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn as_map(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}
