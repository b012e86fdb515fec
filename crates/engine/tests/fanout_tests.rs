//! Integration tests for the event fan-out engine.
//!
//! Receivers are wiremock endpoints; storage is the in-memory repository.

mod common;

use common::*;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loki_db::models::EventStatus;
use loki_db::repo::WebhookRepo;
use loki_engine::DispatchRequest;

fn dispatch_request(event: &str, payload: Value) -> DispatchRequest {
    DispatchRequest {
        tenant_id: TENANT_A.to_string(),
        event: event.to_string(),
        source: "checkout".to_string(),
        payload,
    }
}

#[tokio::test]
async fn test_public_fanout_happy_path() {
    let h = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let sub = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/hook", server.uri()),
        "secret-a",
    );
    h.webhooks.create_subscription(&sub).await.unwrap();

    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"id": "O1"})))
        .await
        .unwrap();

    assert_eq!(result.total_sent, 1);
    assert_eq!(result.total_failed, 0);
    assert_eq!(result.outcomes.len(), 1);
    assert!(result.outcomes[0].success);
    assert_eq!(result.outcomes[0].response_code, Some(200));
    assert_eq!(result.outcomes[0].attempt_count, 1);

    let event = h.webhooks.event(result.event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Sent);
    assert!(event.sent_at.is_some());

    // Exactly one POST whose body parses to the envelope.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], json!("order.placed"));
    assert_eq!(body["source"], json!("checkout"));
    assert_eq!(body["payload"], json!({"id": "O1"}));
    assert_eq!(body["event_id"], json!(result.event_id.to_string()));
    assert!(body["timestamp"].is_string());

    assert_eq!(
        request.headers.get("content-type").unwrap().to_str().unwrap(),
        "application/json"
    );
    assert_eq!(
        request.headers.get("x-loki-event").unwrap().to_str().unwrap(),
        "order.placed"
    );
    assert!(request.headers.get("x-loki-timestamp").is_some());

    // The receiver can recompute the signature byte-for-byte.
    let signature_header = request
        .headers
        .get("x-loki-signature")
        .unwrap()
        .to_str()
        .unwrap();
    let signature = signature_header.strip_prefix("sha256=").unwrap();
    assert_eq!(signature.len(), 64);
    assert!(h.security.verify_signature(&request.body, signature, "secret-a"));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let h = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let sub = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/hook", server.uri()),
        "secret-b",
    );
    h.webhooks.create_subscription(&sub).await.unwrap();

    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"id": "O1"})))
        .await
        .unwrap();

    assert_eq!(result.total_failed, 1);
    assert_eq!(result.outcomes[0].attempt_count, 1);
    assert_eq!(result.outcomes[0].response_code, Some(400));
    assert!(!result.outcomes[0].success);

    let event = h.webhooks.event(result.event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Failed);
}

#[tokio::test]
async fn test_server_error_retries_then_succeeds() {
    let h = harness();
    let server = MockServer::start().await;
    // First two attempts see 500, the third a 200.
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let sub = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/hook", server.uri()),
        "secret-c",
    );
    h.webhooks.create_subscription(&sub).await.unwrap();

    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"id": "O1"})))
        .await
        .unwrap();

    assert!(result.outcomes[0].success);
    assert_eq!(result.outcomes[0].attempt_count, 3);
    assert_eq!(result.total_sent, 1);

    let event = h.webhooks.event(result.event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Sent);
}

#[tokio::test]
async fn test_server_error_exhausts_retry_budget() {
    let h = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4) // initial attempt + maxRetries
        .mount(&server)
        .await;

    let mut sub = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/hook", server.uri()),
        "secret-d",
    );
    sub.max_retries = 3;
    h.webhooks.create_subscription(&sub).await.unwrap();

    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"id": "O1"})))
        .await
        .unwrap();

    assert!(!result.outcomes[0].success);
    assert_eq!(result.outcomes[0].attempt_count, 4);
    assert_eq!(result.outcomes[0].response_code, Some(503));

    let event = h.webhooks.event(result.event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(
        event.last_error.as_deref(),
        Some("all 1 webhook deliveries failed")
    );
}

#[tokio::test]
async fn test_mixed_outcomes_account_in_totals() {
    let h = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let ok = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/ok", server.uri()),
        "secret-1",
    );
    let mut broken = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/broken", server.uri()),
        "secret-2",
    );
    broken.max_retries = 0;
    h.webhooks.create_subscription(&ok).await.unwrap();
    h.webhooks.create_subscription(&broken).await.unwrap();

    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"id": "O1"})))
        .await
        .unwrap();

    assert_eq!(result.total_sent + result.total_failed, result.outcomes.len());
    assert_eq!(result.total_sent, 1);
    assert_eq!(result.total_failed, 1);

    // A partial failure settles the event as failed, but not "all failed".
    let event = h.webhooks.event(result.event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert!(event.last_error.is_none());
}

#[tokio::test]
async fn test_inactive_and_unrelated_subscriptions_not_delivered() {
    let h = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut inactive = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/hook", server.uri()),
        "s",
    );
    inactive.is_active = false;
    let other_event = subscription(
        TENANT_A,
        "order.shipped",
        &format!("{}/hook", server.uri()),
        "s",
    );
    let other_tenant = subscription(
        TENANT_B,
        "order.placed",
        &format!("{}/hook", server.uri()),
        "s",
    );
    for sub in [&inactive, &other_event, &other_tenant] {
        h.webhooks.create_subscription(sub).await.unwrap();
    }

    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"id": "O1"})))
        .await
        .unwrap();

    assert!(result.outcomes.is_empty());
    assert_eq!(result.total_sent, 0);
    assert_eq!(result.total_failed, 0);

    // No deliveries at all leaves the event pending.
    let event = h.webhooks.event(result.event_id).await.unwrap();
    assert_eq!(event.status, EventStatus::Pending);
}

#[tokio::test]
async fn test_private_delivery_with_statics_and_fragment() {
    let h = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut sub = subscription(
        TENANT_A,
        "order.placed",
        &format!("{}/hook", server.uri()),
        "secret-p",
    );
    sub.kind = loki_db::models::SubscriptionKind::Private;
    sub.bearer_token = Some("capability-token".to_string());
    sub.headers = Some(json!({"X-Static-Header": "static-value"}));
    sub.query_params = Some(json!({"src": "loki"}));
    sub.payload_fragment = Some(json!({
        "region": "eu",
        "payload": {"channel": "web", "id": "fragment-loses"},
        "event": "fragment-loses",
    }));
    h.webhooks.create_subscription(&sub).await.unwrap();

    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"id": "O1"})))
        .await
        .unwrap();
    assert_eq!(result.total_sent, 1);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];

    assert_eq!(
        request.headers.get("authorization").unwrap().to_str().unwrap(),
        "Bearer capability-token"
    );
    assert_eq!(
        request
            .headers
            .get("x-static-header")
            .unwrap()
            .to_str()
            .unwrap(),
        "static-value"
    );
    assert!(request
        .url
        .query_pairs()
        .any(|(k, v)| k == "src" && v == "loki"));

    // Fragment merged under the envelope, envelope keys winning.
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["region"], json!("eu"));
    assert_eq!(body["event"], json!("order.placed"));
    assert_eq!(body["payload"], json!({"channel": "web", "id": "O1"}));

    // The merged body is still what was signed.
    let signature = request
        .headers
        .get("x-loki-signature")
        .unwrap()
        .to_str()
        .unwrap()
        .strip_prefix("sha256=")
        .unwrap()
        .to_string();
    assert!(h.security.verify_signature(&request.body, &signature, "secret-p"));
}

#[tokio::test]
async fn test_dispatch_triggers_matching_chain() {
    let h = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/step"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let step_target = subscription(
        TENANT_A,
        "step.target",
        &format!("{}/step", server.uri()),
        "step-secret",
    );
    h.webhooks.create_subscription(&step_target).await.unwrap();

    let chain = h
        .executor
        .create_chain(loki_engine::NewChain {
            tenant_id: TENANT_A.to_string(),
            name: "on-order".to_string(),
            description: String::new(),
            trigger_event: "order.placed".to_string(),
            steps: vec![loki_engine::NewChainStep {
                webhook_id: step_target.id,
                name: "ack".to_string(),
                description: String::new(),
                request_params: None,
                on_success: loki_db::models::OnSuccess::Continue,
                on_failure: loki_db::models::OnFailure::Stop,
                max_retries: 0,
                delay_seconds: 0,
            }],
        })
        .await
        .unwrap();

    // No fan-out subscriptions exist for the event; the chain still fires.
    let result = h
        .dispatcher
        .dispatch_event(dispatch_request("order.placed", json!({"order": "O1"})))
        .await
        .unwrap();
    assert!(result.outcomes.is_empty());

    let run = wait_for_triggered_run(&h.chains, chain.chain.id).await;
    assert_eq!(run.status, loki_db::models::RunStatus::Completed);
    assert_eq!(run.trigger_event, "order.placed");
    assert_eq!(run.trigger_data, Some(json!({"order": "O1"})));
}
