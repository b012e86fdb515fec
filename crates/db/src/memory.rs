//! In-memory repository implementations.
//!
//! Back the engines in tests and local development; semantics mirror the
//! Postgres implementations (read-your-writes, cascade delete on chains).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    Chain, ChainRun, ChainStep, ChainWithSteps, Event, RunStatus, RunWithStepRuns, StepRun,
    Subscription,
};
use crate::repo::{
    ChainChanges, ChainRepo, EventChanges, RepoError, StepRunChanges, SubscriptionChanges,
    WebhookRepo,
};

/// Subscriptions and events held in process memory.
#[derive(Default)]
pub struct MemoryWebhookRepo {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    events: RwLock<HashMap<Uuid, Event>>,
}

impl MemoryWebhookRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of one event row, for assertions.
    pub async fn event(&self, id: Uuid) -> Option<Event> {
        self.events.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl WebhookRepo for MemoryWebhookRepo {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), RepoError> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, RepoError> {
        Ok(self.subscriptions.read().await.get(&id).cloned())
    }

    async fn get_active_subscriptions(
        &self,
        tenant_id: &str,
        event: &str,
    ) -> Result<Vec<Subscription>, RepoError> {
        let subs = self.subscriptions.read().await;
        let mut matching: Vec<Subscription> = subs
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.subscribed_event == event && s.is_active)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }

    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Subscription>, i64), RepoError> {
        let subs = self.subscriptions.read().await;
        let mut rows: Vec<Subscription> = subs
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = rows.len() as i64;
        let rows = rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((rows, total))
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        changes: SubscriptionChanges,
    ) -> Result<Subscription, RepoError> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs.get_mut(&id).ok_or(RepoError::NotFound)?;

        if let Some(value) = changes.target_url {
            sub.target_url = value;
        }
        if let Some(value) = changes.is_active {
            sub.is_active = value;
        }
        if let Some(value) = changes.headers {
            sub.headers = Some(value);
        }
        if let Some(value) = changes.query_params {
            sub.query_params = Some(value);
        }
        if let Some(value) = changes.payload_fragment {
            sub.payload_fragment = Some(value);
        }
        if let Some(value) = changes.max_retries {
            sub.max_retries = value;
        }
        if let Some(value) = changes.retry_delay_seconds {
            sub.retry_delay_seconds = value;
        }
        sub.updated_at = Utc::now();

        Ok(sub.clone())
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, RepoError> {
        Ok(self.subscriptions.write().await.remove(&id).is_some())
    }

    async fn create_event(&self, event: &Event) -> Result<(), RepoError> {
        self.events.write().await.insert(event.id, event.clone());
        Ok(())
    }

    async fn update_event(&self, id: Uuid, changes: EventChanges) -> Result<(), RepoError> {
        let mut events = self.events.write().await;
        let event = events.get_mut(&id).ok_or(RepoError::NotFound)?;

        if let Some(value) = changes.status {
            event.status = value;
        }
        if let Some(value) = changes.response_code {
            event.response_code = Some(value);
        }
        if let Some(value) = changes.attempts {
            event.attempts = value;
        }
        if let Some(value) = changes.last_error {
            event.last_error = Some(value);
        }
        if let Some(value) = changes.sent_at {
            event.sent_at = Some(value);
        }
        event.updated_at = Utc::now();
        Ok(())
    }
}

/// Chains, steps, runs and step runs held in process memory.
#[derive(Default)]
pub struct MemoryChainRepo {
    chains: RwLock<HashMap<Uuid, Chain>>,
    steps: RwLock<HashMap<Uuid, ChainStep>>,
    runs: RwLock<HashMap<Uuid, ChainRun>>,
    step_runs: RwLock<HashMap<Uuid, StepRun>>,
}

impl MemoryChainRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of one run row, for assertions.
    pub async fn run(&self, id: Uuid) -> Option<ChainRun> {
        self.runs.read().await.get(&id).cloned()
    }

    /// Step runs for a run ordered by step_order, for assertions.
    pub async fn step_runs_for(&self, run_id: Uuid) -> Vec<StepRun> {
        let step_runs = self.step_runs.read().await;
        let mut rows: Vec<StepRun> = step_runs
            .values()
            .filter(|sr| sr.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|sr| sr.step_order);
        rows
    }
}

#[async_trait]
impl ChainRepo for MemoryChainRepo {
    async fn create_chain_with_steps(
        &self,
        chain: &Chain,
        steps: &[ChainStep],
    ) -> Result<(), RepoError> {
        let mut chains = self.chains.write().await;
        let mut all_steps = self.steps.write().await;
        chains.insert(chain.id, chain.clone());
        for step in steps {
            all_steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainWithSteps>, RepoError> {
        let chains = self.chains.read().await;
        let Some(chain) = chains.get(&id).cloned() else {
            return Ok(None);
        };

        let steps = self.steps.read().await;
        let mut chain_steps: Vec<ChainStep> = steps
            .values()
            .filter(|s| s.chain_id == id)
            .cloned()
            .collect();
        chain_steps.sort_by_key(|s| s.step_order);

        Ok(Some(ChainWithSteps {
            chain,
            steps: chain_steps,
        }))
    }

    async fn list_chains(
        &self,
        tenant_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Chain>, i64), RepoError> {
        let chains = self.chains.read().await;
        let mut rows: Vec<Chain> = chains
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = rows.len() as i64;
        let rows = rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((rows, total))
    }

    async fn get_chains_by_trigger(
        &self,
        tenant_id: &str,
        event: &str,
    ) -> Result<Vec<Chain>, RepoError> {
        let chains = self.chains.read().await;
        let mut rows: Vec<Chain> = chains
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.trigger_event == event && c.is_active)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn update_chain(&self, id: Uuid, changes: ChainChanges) -> Result<bool, RepoError> {
        let mut chains = self.chains.write().await;
        let Some(chain) = chains.get_mut(&id) else {
            return Ok(false);
        };

        if let Some(value) = changes.name {
            chain.name = value;
        }
        if let Some(value) = changes.description {
            chain.description = value;
        }
        if let Some(value) = changes.is_active {
            chain.is_active = value;
        }
        chain.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_chain(&self, id: Uuid) -> Result<bool, RepoError> {
        let mut chains = self.chains.write().await;
        let mut steps = self.steps.write().await;
        let mut runs = self.runs.write().await;
        let mut step_runs = self.step_runs.write().await;

        let removed = chains.remove(&id).is_some();
        if removed {
            steps.retain(|_, s| s.chain_id != id);
            let run_ids: Vec<Uuid> = runs
                .values()
                .filter(|r| r.chain_id == id)
                .map(|r| r.id)
                .collect();
            runs.retain(|_, r| r.chain_id != id);
            step_runs.retain(|_, sr| !run_ids.contains(&sr.run_id));
        }
        Ok(removed)
    }

    async fn create_run(&self, run: &ChainRun) -> Result<(), RepoError> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunWithStepRuns>, RepoError> {
        let runs = self.runs.read().await;
        let Some(run) = runs.get(&id).cloned() else {
            return Ok(None);
        };
        drop(runs);

        Ok(Some(RunWithStepRuns {
            run,
            step_runs: self.step_runs_for(id).await,
        }))
    }

    async fn list_runs(
        &self,
        chain_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ChainRun>, i64), RepoError> {
        let runs = self.runs.read().await;
        let mut rows: Vec<ChainRun> = runs
            .values()
            .filter(|r| r.chain_id == chain_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = rows.len() as i64;
        let rows = rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((rows, total))
    }

    async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), RepoError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(RepoError::NotFound)?;
        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn update_run_current_step(&self, id: Uuid, current_step: i32) -> Result<(), RepoError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(RepoError::NotFound)?;
        run.current_step = current_step;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn update_run_error(&self, id: Uuid, last_error: &str) -> Result<(), RepoError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(RepoError::NotFound)?;
        run.last_error = Some(last_error.to_string());
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), RepoError> {
        self.step_runs
            .write()
            .await
            .insert(step_run.id, step_run.clone());
        Ok(())
    }

    async fn update_step_run(&self, id: Uuid, changes: StepRunChanges) -> Result<(), RepoError> {
        let mut step_runs = self.step_runs.write().await;
        let step_run = step_runs.get_mut(&id).ok_or(RepoError::NotFound)?;

        if let Some(value) = changes.status {
            step_run.status = value;
        }
        if let Some(value) = changes.request_payload {
            step_run.request_payload = Some(value);
        }
        if let Some(value) = changes.response_code {
            step_run.response_code = Some(value);
        }
        if let Some(value) = changes.response_body {
            step_run.response_body = Some(value);
        }
        if let Some(value) = changes.attempt_count {
            step_run.attempt_count = value;
        }
        if let Some(value) = changes.last_error {
            step_run.last_error = Some(value);
        }
        if let Some(value) = changes.completed_at {
            step_run.completed_at = Some(value);
        }
        step_run.updated_at = Utc::now();
        Ok(())
    }
}
