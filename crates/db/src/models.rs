//! Row models for the six persisted tables.
//!
//! Types are database-backed (sqlx derives) and serde-serializable for the
//! API surface. Secrets never serialize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Delivery authentication mode for a subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "subscription_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    /// HMAC signature only.
    Public,
    /// HMAC signature plus bearer capability token.
    Private,
}

/// Lifecycle of a dispatched event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "event_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Sent,
    Failed,
}

/// Lifecycle of a chain run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    /// Completed and Failed are terminal; Paused is resumable.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Lifecycle of one step execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "step_run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StepRunStatus {
    Pending,
    Sent,
    Failed,
}

/// Flow control after a step succeeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "on_success_action", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OnSuccess {
    Continue,
    Stop,
    Pause,
}

/// Flow control after a step fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "on_failure_action", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    Continue,
    Stop,
    /// Retries happen inside step execution; at the run level this behaves
    /// like Continue.
    Retry,
}

/// A durable registration of an HTTP endpoint for one (tenant, event) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub app_name: String,
    pub target_url: String,
    pub subscribed_event: String,
    pub kind: SubscriptionKind,
    /// Hex-encoded HMAC secret, never exposed through the API.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Bearer capability token, present iff kind is Private.
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    /// Static headers added to every delivery (JSON object of strings).
    pub headers: Option<serde_json::Value>,
    /// Static query parameters appended to the target URL.
    pub query_params: Option<serde_json::Value>,
    /// Static payload fragment merged under the outbound envelope.
    pub payload_fragment: Option<serde_json::Value>,
    pub max_retries: i32,
    pub retry_delay_seconds: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single tenant-originated notification and its fan-out outcome.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_name: String,
    pub source: String,
    /// Serialized envelope as signed and sent.
    pub payload: String,
    pub status: EventStatus,
    /// Response code of the first subscriber, advisory only.
    pub response_code: Option<i32>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An ordered workflow triggered by a specific event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Chain {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub trigger_event: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One node of a chain, targeting a subscription.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChainStep {
    pub id: Uuid,
    pub chain_id: Uuid,
    /// 1-indexed, contiguous within a chain.
    pub step_order: i32,
    pub webhook_id: Uuid,
    pub name: String,
    pub description: String,
    /// Request parameter template, resolved at execution time.
    pub request_params: Option<serde_json::Value>,
    pub on_success: OnSuccess,
    pub on_failure: OnFailure,
    pub max_retries: i32,
    pub delay_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single execution instance of a chain.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChainRun {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub tenant_id: String,
    pub status: RunStatus,
    pub trigger_event: String,
    pub trigger_data: Option<serde_json::Value>,
    /// 0 at creation; advances as steps are entered.
    pub current_step: i32,
    pub total_steps: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Execution record of one step within one run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub step_order: i32,
    pub status: StepRunStatus,
    /// Request payload actually sent to the target.
    pub request_payload: Option<serde_json::Value>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chain with its steps in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct ChainWithSteps {
    #[serde(flatten)]
    pub chain: Chain,
    pub steps: Vec<ChainStep>,
}

/// A run with its step execution records.
#[derive(Debug, Clone, Serialize)]
pub struct RunWithStepRuns {
    #[serde(flatten)]
    pub run: ChainRun,
    pub step_runs: Vec<StepRun>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&SubscriptionKind::Public).unwrap(),
            "\"public\""
        );
        assert_eq!(
            serde_json::to_string(&SubscriptionKind::Private).unwrap(),
            "\"private\""
        );
    }

    #[test]
    fn test_event_status_serialization() {
        assert_eq!(serde_json::to_string(&EventStatus::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&EventStatus::Sent).unwrap(), "\"sent\"");
        assert_eq!(serde_json::to_string(&EventStatus::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn test_run_status_serialization() {
        assert_eq!(serde_json::to_string(&RunStatus::Running).unwrap(), "\"running\"");
        assert_eq!(serde_json::to_string(&RunStatus::Completed).unwrap(), "\"completed\"");
        assert_eq!(serde_json::to_string(&RunStatus::Paused).unwrap(), "\"paused\"");
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn test_action_deserialization() {
        assert_eq!(
            serde_json::from_str::<OnSuccess>("\"continue\"").unwrap(),
            OnSuccess::Continue
        );
        assert_eq!(serde_json::from_str::<OnSuccess>("\"pause\"").unwrap(), OnSuccess::Pause);
        assert_eq!(serde_json::from_str::<OnFailure>("\"stop\"").unwrap(), OnFailure::Stop);
        assert_eq!(serde_json::from_str::<OnFailure>("\"retry\"").unwrap(), OnFailure::Retry);
        // case-sensitive
        assert!(serde_json::from_str::<OnSuccess>("\"Continue\"").is_err());
    }

    #[test]
    fn test_subscription_secret_never_serializes() {
        let sub = Subscription {
            id: Uuid::new_v4(),
            tenant_id: "tenant-1".to_string(),
            app_name: "billing".to_string(),
            target_url: "https://example.com/hook".to_string(),
            subscribed_event: "order.placed".to_string(),
            kind: SubscriptionKind::Private,
            secret: "super-secret".to_string(),
            bearer_token: Some("token".to_string()),
            headers: None,
            query_params: None,
            payload_fragment: None,
            max_retries: 3,
            retry_delay_seconds: 5,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_string(&sub).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("bearer_token"));
        assert!(json.contains("\"kind\":\"private\""));
    }
}
