//! Event fan-out engine.
//!
//! Delivers one incoming event to all active, matching subscriptions with
//! one concurrent task per subscription and per-subscription retry, records
//! the aggregate outcome on the event row, then triggers any chains bound
//! to the event. Per-event state is confined to the call; the engine holds
//! no shared mutable state across events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use loki_core::security::SecurityService;
use loki_db::models::{Event, EventStatus, Subscription, SubscriptionKind};
use loki_db::repo::{EventChanges, WebhookRepo};

use crate::chain::ChainExecutor;
use crate::error::EngineError;

/// User-Agent sent on fan-out deliveries.
pub const FANOUT_USER_AGENT: &str = "loki-suite/2.0";

/// Cap on response body text kept in delivery errors.
const ERROR_BODY_CAP: usize = 4096;

/// An event to dispatch to a tenant's subscribers.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub tenant_id: String,
    pub event: String,
    pub source: String,
    pub payload: Value,
}

/// Aggregate result of one fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct EventResult {
    pub event_id: Uuid,
    pub total_sent: usize,
    pub total_failed: usize,
    pub outcomes: Vec<DeliveryOutcome>,
}

/// Outcome of delivering one event to one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub webhook_id: Uuid,
    pub target_url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt_count: u32,
}

/// Canonical outbound envelope. Serialized once per event; the resulting
/// bytes (after any per-subscription fragment merge) are what gets signed.
#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    event: &'a str,
    source: &'a str,
    timestamp: String,
    payload: &'a Value,
    event_id: Uuid,
}

pub struct EventDispatcher {
    webhooks: Arc<dyn WebhookRepo>,
    chains: Arc<ChainExecutor>,
    security: Arc<SecurityService>,
    client: reqwest::Client,
}

impl EventDispatcher {
    pub fn new(
        webhooks: Arc<dyn WebhookRepo>,
        chains: Arc<ChainExecutor>,
        security: Arc<SecurityService>,
        delivery_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(delivery_timeout)
            .user_agent(FANOUT_USER_AGENT)
            .build()?;

        Ok(Self {
            webhooks,
            chains,
            security,
            client,
        })
    }

    /// Deliver one event to every matching active subscription, settle the
    /// event row, then trigger chains bound to the event.
    ///
    /// Delivery failures never fail the call; they are accounted for in the
    /// returned [`EventResult`]. Chain-triggering failures are logged only.
    pub async fn dispatch_event(&self, request: DispatchRequest) -> Result<EventResult, EngineError> {
        let subscriptions = self
            .webhooks
            .get_active_subscriptions(&request.tenant_id, &request.event)
            .await?;

        let event_id = Uuid::new_v4();
        let envelope = serde_json::to_value(OutboundEnvelope {
            event: &request.event,
            source: &request.source,
            timestamp: Utc::now().to_rfc3339(),
            payload: &request.payload,
            event_id,
        })?;

        let now = Utc::now();
        let event = Event {
            id: event_id,
            tenant_id: request.tenant_id.clone(),
            event_name: request.event.clone(),
            source: request.source.clone(),
            payload: serde_json::to_string(&envelope)?,
            status: EventStatus::Pending,
            response_code: None,
            attempts: 0,
            last_error: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        self.webhooks.create_event(&event).await?;

        // One task per subscription; no ordering across subscribers.
        let mut handles = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let client = self.client.clone();
            let security = Arc::clone(&self.security);
            let envelope = envelope.clone();
            let event_name = request.event.clone();
            let webhook_id = subscription.id;
            let target_url = subscription.target_url.clone();

            let handle = tokio::spawn(async move {
                deliver_to_subscription(client, security, subscription, envelope, event_name).await
            });
            handles.push((webhook_id, target_url, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (webhook_id, target_url, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(DeliveryOutcome {
                    webhook_id,
                    target_url,
                    success: false,
                    response_code: None,
                    error: Some(format!("delivery task failed: {e}")),
                    attempt_count: 0,
                }),
            }
        }

        let total_sent = outcomes.iter().filter(|o| o.success).count();
        let total_failed = outcomes.len() - total_sent;

        let mut changes = EventChanges {
            attempts: Some(1),
            response_code: outcomes
                .first()
                .and_then(|o| o.response_code)
                .map(i32::from),
            ..Default::default()
        };
        if total_sent > 0 && total_failed == 0 {
            changes.status = Some(EventStatus::Sent);
            changes.sent_at = Some(Utc::now());
        } else if total_failed > 0 {
            changes.status = Some(EventStatus::Failed);
            if total_sent == 0 {
                changes.last_error = Some(format!("all {total_failed} webhook deliveries failed"));
            }
        }
        self.webhooks.update_event(event_id, changes).await?;

        tracing::info!(
            event_id = %event_id,
            tenant_id = %request.tenant_id,
            event = %request.event,
            total_sent,
            total_failed,
            "webhook event processed"
        );

        // Hand the event to the chain engine. A chain failure must never
        // fail the dispatch.
        let trigger_data = match &request.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if let Err(e) = self
            .chains
            .trigger_chains_by_event(&request.tenant_id, &request.event, trigger_data)
            .await
        {
            tracing::error!(
                event = %request.event,
                tenant_id = %request.tenant_id,
                error = %e,
                "failed to trigger chains for event"
            );
        }

        Ok(EventResult {
            event_id,
            total_sent,
            total_failed,
            outcomes,
        })
    }
}

/// Deliver the envelope to a single subscription with per-subscription
/// retry: 2xx stops, 4xx is terminal, 5xx and transport errors retry with
/// a fixed delay up to the subscription's budget.
async fn deliver_to_subscription(
    client: reqwest::Client,
    security: Arc<SecurityService>,
    subscription: Subscription,
    envelope: Value,
    event_name: String,
) -> DeliveryOutcome {
    let mut outcome = DeliveryOutcome {
        webhook_id: subscription.id,
        target_url: subscription.target_url.clone(),
        success: false,
        response_code: None,
        error: None,
        attempt_count: 0,
    };

    // Envelope fields win over the static fragment on key conflict.
    let effective = match &subscription.payload_fragment {
        Some(fragment) => deep_merge(fragment, &envelope),
        None => envelope,
    };
    let body = match serde_json::to_vec(&effective) {
        Ok(bytes) => bytes,
        Err(e) => {
            outcome.error = Some(format!("failed to serialize payload: {e}"));
            return outcome;
        }
    };

    let signature = security.sign(&body, &subscription.secret);
    let retry_delay = Duration::from_secs(subscription.retry_delay_seconds.max(0) as u64);
    let max_retries = subscription.max_retries.max(0);

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(retry_delay).await;
        }
        outcome.attempt_count = attempt as u32 + 1;

        let mut req = client
            .post(&subscription.target_url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Loki-Signature", format!("sha256={signature}"))
            .header("X-Loki-Timestamp", Utc::now().to_rfc3339())
            .header("X-Loki-Event", &event_name);

        if let Some(Value::Object(params)) = &subscription.query_params {
            let pairs: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.clone(), query_value(v)))
                .collect();
            req = req.query(&pairs);
        }
        if let Some(Value::Object(static_headers)) = &subscription.headers {
            for (name, value) in static_headers {
                if let Some(value) = value.as_str() {
                    req = req.header(name, value);
                }
            }
        }
        if subscription.kind == SubscriptionKind::Private {
            if let Some(token) = &subscription.bearer_token {
                req = req.header(AUTHORIZATION, format!("Bearer {token}"));
            }
        }

        match req.body(body.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                outcome.response_code = Some(status.as_u16());

                if status.is_success() {
                    outcome.success = true;
                    outcome.error = None;
                    tracing::debug!(
                        webhook_id = %subscription.id,
                        target_url = %subscription.target_url,
                        status_code = status.as_u16(),
                        "webhook delivered"
                    );
                    return outcome;
                }

                let body_text: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(ERROR_BODY_CAP)
                    .collect();
                outcome.error = Some(format!(
                    "webhook returned status {}: {}",
                    status.as_u16(),
                    body_text
                ));

                // Client errors are not retried.
                if status.is_client_error() {
                    break;
                }
            }
            Err(e) => {
                outcome.response_code = None;
                outcome.error = Some(format!("failed to send request: {e}"));
            }
        }

        tracing::warn!(
            webhook_id = %subscription.id,
            target_url = %subscription.target_url,
            attempt = attempt + 1,
            error = outcome.error.as_deref().unwrap_or(""),
            "webhook delivery attempt failed"
        );
    }

    outcome
}

/// Recursive merge with `overlay` winning on key conflicts; non-object
/// pairs resolve to the overlay value.
fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let value = match merged.get(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
