use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use loki_db::models::{Subscription, SubscriptionKind};
use loki_db::repo::{SubscriptionChanges, WebhookRepo};
use loki_engine::{DispatchRequest, EventResult};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/webhooks/generate", post(generate_webhook))
        .route("/api/webhooks/subscribe", post(subscribe_webhook))
        .route("/api/webhooks/event", post(send_event))
        .route("/api/webhooks/receive/{id}", post(receive_webhook))
        .route("/api/webhooks", get(list_webhooks))
        .route(
            "/api/webhooks/{id}",
            axum::routing::patch(update_webhook).delete(delete_webhook),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct GenerateWebhookRequest {
    tenant_id: String,
    app_name: String,
    subscribed_event: String,
    #[serde(alias = "type")]
    kind: SubscriptionKind,
}

#[derive(Debug, Deserialize)]
struct SubscribeWebhookRequest {
    tenant_id: String,
    app_name: String,
    target_url: String,
    subscribed_event: String,
    #[serde(alias = "type")]
    kind: SubscriptionKind,
    #[serde(default)]
    headers: Option<Value>,
    #[serde(default)]
    query_params: Option<Value>,
    #[serde(default)]
    payload_fragment: Option<Value>,
    #[serde(default)]
    max_retries: Option<i32>,
    #[serde(default)]
    retry_delay_seconds: Option<i32>,
}

/// Credentials handed back once at registration; the secret is not
/// retrievable afterwards.
#[derive(Debug, Serialize)]
struct WebhookCredentialsResponse {
    webhook_id: Uuid,
    webhook_url: String,
    secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bearer_token: Option<String>,
    kind: SubscriptionKind,
}

#[derive(Debug, Deserialize)]
struct SendEventRequest {
    tenant_id: String,
    event: String,
    source: String,
    payload: Value,
}

#[derive(Debug, Serialize)]
struct ReceiveWebhookResponse {
    message: &'static str,
    webhook_id: Uuid,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct ListWebhooksQuery {
    tenant_id: String,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct WebhookListResponse {
    webhooks: Vec<Subscription>,
    total: i64,
    page: i64,
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct UpdateWebhookRequest {
    target_url: Option<String>,
    is_active: Option<bool>,
    headers: Option<Value>,
    query_params: Option<Value>,
    payload_fragment: Option<Value>,
    max_retries: Option<i32>,
    retry_delay_seconds: Option<i32>,
}

#[derive(Debug, Serialize)]
struct DeleteWebhookResponse {
    webhook_id: Uuid,
    deleted: bool,
}

/// Mint a subscription whose target is our own receive endpoint.
async fn generate_webhook(
    State(state): State<AppState>,
    Json(payload): Json<GenerateWebhookRequest>,
) -> ApiResult<(StatusCode, Json<WebhookCredentialsResponse>)> {
    require_field(&payload.tenant_id, "tenant_id")?;
    require_field(&payload.app_name, "app_name")?;
    require_field(&payload.subscribed_event, "subscribed_event")?;

    let id = Uuid::new_v4();
    let target_url = format!("{}/api/webhooks/receive/{}", state.settings.base_url, id);
    let response = create_subscription(
        &state,
        id,
        payload.tenant_id,
        payload.app_name,
        target_url,
        payload.subscribed_event,
        payload.kind,
        None,
        None,
        None,
        None,
        None,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// Register an external endpoint for webhook delivery.
async fn subscribe_webhook(
    State(state): State<AppState>,
    Json(payload): Json<SubscribeWebhookRequest>,
) -> ApiResult<(StatusCode, Json<WebhookCredentialsResponse>)> {
    require_field(&payload.tenant_id, "tenant_id")?;
    require_field(&payload.app_name, "app_name")?;
    require_field(&payload.subscribed_event, "subscribed_event")?;
    validate_url(&payload.target_url)?;
    validate_string_map(payload.headers.as_ref(), "headers")?;
    validate_string_map(payload.query_params.as_ref(), "query_params")?;

    let id = Uuid::new_v4();
    let response = create_subscription(
        &state,
        id,
        payload.tenant_id,
        payload.app_name,
        payload.target_url,
        payload.subscribed_event,
        payload.kind,
        payload.headers,
        payload.query_params,
        payload.payload_fragment,
        payload.max_retries,
        payload.retry_delay_seconds,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

#[allow(clippy::too_many_arguments)]
async fn create_subscription(
    state: &AppState,
    id: Uuid,
    tenant_id: String,
    app_name: String,
    target_url: String,
    subscribed_event: String,
    kind: SubscriptionKind,
    headers: Option<Value>,
    query_params: Option<Value>,
    payload_fragment: Option<Value>,
    max_retries: Option<i32>,
    retry_delay_seconds: Option<i32>,
) -> ApiResult<WebhookCredentialsResponse> {
    let is_private = kind == SubscriptionKind::Private;
    let secrets = state
        .security
        .mint_subscription_secrets(is_private, &tenant_id, &id.to_string(), &app_name)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let now = Utc::now();
    let subscription = Subscription {
        id,
        tenant_id,
        app_name,
        target_url: target_url.clone(),
        subscribed_event,
        kind,
        secret: secrets.secret.clone(),
        bearer_token: secrets.bearer.clone(),
        headers,
        query_params,
        payload_fragment,
        max_retries: max_retries.unwrap_or(state.settings.default_max_retries),
        retry_delay_seconds: retry_delay_seconds
            .unwrap_or(state.settings.default_retry_delay_seconds),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    state.webhooks.create_subscription(&subscription).await?;

    tracing::info!(
        webhook_id = %id,
        tenant_id = %subscription.tenant_id,
        kind = ?kind,
        "webhook subscription created"
    );

    Ok(WebhookCredentialsResponse {
        webhook_id: id,
        webhook_url: target_url,
        secret: secrets.secret,
        bearer_token: secrets.bearer,
        kind,
    })
}

/// Dispatch an event to all matching subscriptions and trigger chains.
async fn send_event(
    State(state): State<AppState>,
    Json(payload): Json<SendEventRequest>,
) -> ApiResult<Json<EventResult>> {
    require_field(&payload.tenant_id, "tenant_id")?;
    require_field(&payload.event, "event")?;
    require_field(&payload.source, "source")?;

    let result = state
        .dispatcher
        .dispatch_event(DispatchRequest {
            tenant_id: payload.tenant_id,
            event: payload.event,
            source: payload.source,
            payload: payload.payload,
        })
        .await?;

    Ok(Json(result))
}

/// Verify an inbound delivery addressed to one of our generated endpoints.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ReceiveWebhookResponse>> {
    let signature = header_value(&headers, "X-Loki-Signature");
    let timestamp = header_value(&headers, "X-Loki-Timestamp");
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    state
        .verifier
        .verify_delivery(
            id,
            &body,
            signature.unwrap_or(""),
            timestamp.unwrap_or(""),
            authorization,
        )
        .await?;

    Ok(Json(ReceiveWebhookResponse {
        message: "webhook received and verified",
        webhook_id: id,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    require_field(&query.tenant_id, "tenant_id")?;
    let (page, limit) = normalize_pagination(query.page, query.limit);

    let (webhooks, total) = state
        .webhooks
        .list_subscriptions(&query.tenant_id, (page - 1) * limit, limit)
        .await?;

    Ok(Json(WebhookListResponse {
        webhooks,
        total,
        page,
        limit,
    }))
}

async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateWebhookRequest>,
) -> ApiResult<Json<Subscription>> {
    if let Some(url) = payload.target_url.as_deref() {
        validate_url(url)?;
    }
    validate_string_map(payload.headers.as_ref(), "headers")?;
    validate_string_map(payload.query_params.as_ref(), "query_params")?;

    let changes = SubscriptionChanges {
        target_url: payload.target_url,
        is_active: payload.is_active,
        headers: payload.headers,
        query_params: payload.query_params,
        payload_fragment: payload.payload_fragment,
        max_retries: payload.max_retries,
        retry_delay_seconds: payload.retry_delay_seconds,
    };
    if changes.is_empty() {
        return Err(ApiError::BadRequest("no fields to update".to_string()));
    }

    let updated = state.webhooks.update_subscription(id, changes).await?;
    Ok(Json(updated))
}

async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeleteWebhookResponse>> {
    let deleted = state.webhooks.delete_subscription(id).await?;
    if !deleted {
        return Err(ApiError::NotFound("webhook not found".to_string()));
    }

    Ok(Json(DeleteWebhookResponse {
        webhook_id: id,
        deleted: true,
    }))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn require_field(value: &str, name: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{name} is required")));
    }
    Ok(())
}

fn validate_url(url: &str) -> ApiResult<()> {
    let url = url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ApiError::BadRequest(
            "target_url must start with http:// or https://".to_string(),
        ));
    }
    Ok(())
}

/// Static header/query maps must be JSON objects with string values.
fn validate_string_map(value: Option<&Value>, name: &str) -> ApiResult<()> {
    let Some(value) = value else {
        return Ok(());
    };
    match value {
        Value::Object(map) if map.values().all(|v| v.is_string()) => Ok(()),
        _ => Err(ApiError::BadRequest(format!(
            "{name} must be an object of string values"
        ))),
    }
}

fn normalize_pagination(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let page = page.filter(|p| *p >= 1).unwrap_or(1);
    let limit = limit.filter(|l| (1..=100).contains(l)).unwrap_or(10);
    (page, limit)
}
