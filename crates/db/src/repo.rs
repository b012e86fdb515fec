//! Repository interfaces consumed by the engines and the API.
//!
//! Implementations must provide read-your-writes within a single caller's
//! flow and be safe under concurrent callers. All mutating operations are
//! durable before returning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Chain, ChainRun, ChainStep, ChainWithSteps, Event, EventStatus, RunStatus, RunWithStepRuns,
    StepRun, StepRunStatus, Subscription,
};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,
}

/// Partial update over a subscription. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChanges {
    pub target_url: Option<String>,
    pub is_active: Option<bool>,
    pub headers: Option<serde_json::Value>,
    pub query_params: Option<serde_json::Value>,
    pub payload_fragment: Option<serde_json::Value>,
    pub max_retries: Option<i32>,
    pub retry_delay_seconds: Option<i32>,
}

impl SubscriptionChanges {
    pub fn is_empty(&self) -> bool {
        self.target_url.is_none()
            && self.is_active.is_none()
            && self.headers.is_none()
            && self.query_params.is_none()
            && self.payload_fragment.is_none()
            && self.max_retries.is_none()
            && self.retry_delay_seconds.is_none()
    }
}

/// Settlement of an event row after fan-out.
#[derive(Debug, Clone, Default)]
pub struct EventChanges {
    pub status: Option<EventStatus>,
    pub response_code: Option<i32>,
    pub attempts: Option<i32>,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Partial update over a chain's mutable attributes. Step structure is
/// immutable after creation.
#[derive(Debug, Clone, Default)]
pub struct ChainChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

impl ChainChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.is_active.is_none()
    }
}

/// Per-attempt update over a step run.
#[derive(Debug, Clone, Default)]
pub struct StepRunChanges {
    pub status: Option<StepRunStatus>,
    pub request_payload: Option<serde_json::Value>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub attempt_count: Option<i32>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Subscriptions and events, indexed by (tenant, event).
#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), RepoError>;

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, RepoError>;

    /// Active subscriptions for one (tenant, event) pair.
    async fn get_active_subscriptions(
        &self,
        tenant_id: &str,
        event: &str,
    ) -> Result<Vec<Subscription>, RepoError>;

    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Subscription>, i64), RepoError>;

    async fn update_subscription(
        &self,
        id: Uuid,
        changes: SubscriptionChanges,
    ) -> Result<Subscription, RepoError>;

    /// Returns false when no row matched.
    async fn delete_subscription(&self, id: Uuid) -> Result<bool, RepoError>;

    async fn create_event(&self, event: &Event) -> Result<(), RepoError>;

    async fn update_event(&self, id: Uuid, changes: EventChanges) -> Result<(), RepoError>;
}

/// Chains, steps, runs and step runs.
#[async_trait]
pub trait ChainRepo: Send + Sync {
    /// Atomically insert a chain and all of its steps.
    async fn create_chain_with_steps(
        &self,
        chain: &Chain,
        steps: &[ChainStep],
    ) -> Result<(), RepoError>;

    /// Chain with steps ordered by step_order.
    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainWithSteps>, RepoError>;

    async fn list_chains(
        &self,
        tenant_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Chain>, i64), RepoError>;

    /// Active chains in the tenant whose trigger matches the event.
    async fn get_chains_by_trigger(
        &self,
        tenant_id: &str,
        event: &str,
    ) -> Result<Vec<Chain>, RepoError>;

    async fn update_chain(&self, id: Uuid, changes: ChainChanges) -> Result<bool, RepoError>;

    /// Cascades to steps; runs are removed with the chain.
    async fn delete_chain(&self, id: Uuid) -> Result<bool, RepoError>;

    async fn create_run(&self, run: &ChainRun) -> Result<(), RepoError>;

    /// Run with its step runs ordered by step_order.
    async fn get_run(&self, id: Uuid) -> Result<Option<RunWithStepRuns>, RepoError>;

    async fn list_runs(
        &self,
        chain_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ChainRun>, i64), RepoError>;

    /// Sets completed_at for terminal statuses.
    async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), RepoError>;

    async fn update_run_current_step(&self, id: Uuid, current_step: i32) -> Result<(), RepoError>;

    async fn update_run_error(&self, id: Uuid, last_error: &str) -> Result<(), RepoError>;

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), RepoError>;

    async fn update_step_run(&self, id: Uuid, changes: StepRunChanges) -> Result<(), RepoError>;
}
