//! Chain execution engine.
//!
//! Drives a chain's steps strictly sequentially for one trigger. Each run
//! is a detached task: `execute_chain` persists the run record and returns
//! immediately. Within a step, retries use quadratic backoff (1s, 4s, 9s…);
//! 4xx responses, missing targets and cross-tenant targets fail the step
//! without retry. Run-level flow control is decided by the step's
//! onSuccess/onFailure actions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use loki_core::security::SecurityService;
use loki_core::template::{self, TemplateContext};
use loki_db::models::{
    Chain, ChainRun, ChainStep, ChainWithSteps, OnFailure, OnSuccess, RunStatus, StepRun,
    StepRunStatus, SubscriptionKind,
};
use loki_db::repo::{ChainRepo, StepRunChanges, WebhookRepo};

use crate::error::EngineError;

/// User-Agent sent on chain step deliveries.
pub const STEP_USER_AGENT: &str = "loki-suite-chain/2.0";

/// Cap on persisted response body text.
const RESPONSE_BODY_CAP: usize = 4096;

/// Request to create a chain with its steps.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChain {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger_event: String,
    pub steps: Vec<NewChainStep>,
}

/// One step in a chain-creation request. Actions and retry budget default
/// to continue/stop/3 when omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChainStep {
    pub webhook_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub request_params: Option<Value>,
    #[serde(default = "default_on_success")]
    pub on_success: OnSuccess,
    #[serde(default = "default_on_failure")]
    pub on_failure: OnFailure,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default)]
    pub delay_seconds: i32,
}

fn default_on_success() -> OnSuccess {
    OnSuccess::Continue
}

fn default_on_failure() -> OnFailure {
    OnFailure::Stop
}

fn default_max_retries() -> i32 {
    3
}

/// Receipt returned while the run proceeds in the background.
#[derive(Debug, Clone, Serialize)]
pub struct RunReceipt {
    pub run_id: Uuid,
    pub chain_id: Uuid,
    pub status: RunStatus,
    pub total_steps: i32,
    pub started_at: DateTime<Utc>,
}

struct StepOutcome {
    success: bool,
    error: Option<String>,
}

impl StepOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone)]
pub struct ChainExecutor {
    chains: Arc<dyn ChainRepo>,
    webhooks: Arc<dyn WebhookRepo>,
    security: Arc<SecurityService>,
    client: reqwest::Client,
}

impl ChainExecutor {
    pub fn new(
        chains: Arc<dyn ChainRepo>,
        webhooks: Arc<dyn WebhookRepo>,
        security: Arc<SecurityService>,
        delivery_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(delivery_timeout)
            .user_agent(STEP_USER_AGENT)
            .build()?;

        Ok(Self {
            chains,
            webhooks,
            security,
            client,
        })
    }

    /// Validate and atomically create a chain with its steps.
    ///
    /// Every referenced subscription must exist and belong to the chain's
    /// tenant; steps are numbered contiguously from 1 in request order.
    pub async fn create_chain(&self, request: NewChain) -> Result<ChainWithSteps, EngineError> {
        if request.steps.is_empty() {
            return Err(EngineError::Validation(
                "chain requires at least one step".to_string(),
            ));
        }

        for (i, step) in request.steps.iter().enumerate() {
            if step.max_retries < 0 {
                return Err(EngineError::Validation(format!(
                    "step {}: max_retries must be non-negative",
                    i + 1
                )));
            }
            if step.delay_seconds < 0 {
                return Err(EngineError::Validation(format!(
                    "step {}: delay_seconds must be non-negative",
                    i + 1
                )));
            }

            let webhook = self
                .webhooks
                .get_subscription(step.webhook_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Validation(format!("step {}: webhook not found", i + 1))
                })?;
            if webhook.tenant_id != request.tenant_id {
                return Err(EngineError::Validation(format!(
                    "step {}: webhook belongs to a different tenant",
                    i + 1
                )));
            }
        }

        let now = Utc::now();
        let chain = Chain {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            name: request.name,
            description: request.description,
            trigger_event: request.trigger_event,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let steps: Vec<ChainStep> = request
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| ChainStep {
                id: Uuid::new_v4(),
                chain_id: chain.id,
                step_order: i as i32 + 1,
                webhook_id: step.webhook_id,
                name: step.name,
                description: step.description,
                request_params: step.request_params,
                on_success: step.on_success,
                on_failure: step.on_failure,
                max_retries: step.max_retries,
                delay_seconds: step.delay_seconds,
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.chains.create_chain_with_steps(&chain, &steps).await?;

        tracing::info!(
            chain_id = %chain.id,
            tenant_id = %chain.tenant_id,
            trigger_event = %chain.trigger_event,
            steps_count = steps.len(),
            "execution chain created"
        );

        Ok(ChainWithSteps { chain, steps })
    }

    /// Start one run of a chain. The run record is created synchronously;
    /// step execution proceeds in a detached task.
    pub async fn execute_chain(
        &self,
        chain_id: Uuid,
        trigger_data: Option<Value>,
    ) -> Result<RunReceipt, EngineError> {
        let chain = self
            .chains
            .get_chain(chain_id)
            .await?
            .ok_or(EngineError::ChainNotFound)?;
        if !chain.chain.is_active {
            return Err(EngineError::ChainInactive);
        }

        let now = Utc::now();
        let run = ChainRun {
            id: Uuid::new_v4(),
            chain_id,
            tenant_id: chain.chain.tenant_id.clone(),
            status: RunStatus::Running,
            trigger_event: chain.chain.trigger_event.clone(),
            trigger_data: trigger_data.clone(),
            current_step: 0,
            total_steps: chain.steps.len() as i32,
            started_at: Some(now),
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.chains.create_run(&run).await?;

        let executor = self.clone();
        let run_id = run.id;
        let trigger_data = trigger_data.unwrap_or_else(|| Value::Object(Map::new()));
        tokio::spawn(async move {
            executor.run_steps(run_id, chain, trigger_data).await;
        });

        Ok(RunReceipt {
            run_id,
            chain_id,
            status: RunStatus::Running,
            total_steps: run.total_steps,
            started_at: now,
        })
    }

    /// Start one run per active chain in the tenant whose trigger matches
    /// the event. One chain failing to start does not stop the others.
    pub async fn trigger_chains_by_event(
        &self,
        tenant_id: &str,
        event: &str,
        trigger_data: Map<String, Value>,
    ) -> Result<(), EngineError> {
        let chains = self.chains.get_chains_by_trigger(tenant_id, event).await?;
        if chains.is_empty() {
            return Ok(());
        }

        tracing::info!(
            tenant_id = %tenant_id,
            event = %event,
            chains_count = chains.len(),
            "starting chains for event"
        );

        for chain in chains {
            if let Err(e) = self
                .execute_chain(chain.id, Some(Value::Object(trigger_data.clone())))
                .await
            {
                tracing::error!(
                    chain_id = %chain.id,
                    error = %e,
                    "failed to start chain run"
                );
            }
        }
        Ok(())
    }

    /// Drive one run to a terminal state (or Paused).
    async fn run_steps(&self, run_id: Uuid, chain: ChainWithSteps, trigger_data: Value) {
        tracing::info!(
            run_id = %run_id,
            chain_id = %chain.chain.id,
            total_steps = chain.steps.len(),
            "starting chain run"
        );

        let mut ctx = TemplateContext::new(trigger_data.clone());

        for step in &chain.steps {
            if let Err(e) = self
                .chains
                .update_run_current_step(run_id, step.step_order)
                .await
            {
                tracing::error!(run_id = %run_id, error = %e, "failed to update current step");
            }

            if step.delay_seconds > 0 {
                tokio::time::sleep(Duration::from_secs(step.delay_seconds as u64)).await;
            }

            let outcome = self
                .execute_step(run_id, &chain.chain, step, &trigger_data, &mut ctx)
                .await;

            if outcome.success {
                match step.on_success {
                    OnSuccess::Continue => {}
                    OnSuccess::Stop => {
                        self.finish_run(run_id, RunStatus::Completed).await;
                        return;
                    }
                    OnSuccess::Pause => {
                        tracing::info!(run_id = %run_id, step_order = step.step_order, "pausing chain run");
                        self.finish_run(run_id, RunStatus::Paused).await;
                        return;
                    }
                }
            } else {
                match step.on_failure {
                    // Step-level retries already ran inside execute_step.
                    OnFailure::Continue | OnFailure::Retry => {}
                    OnFailure::Stop => {
                        if let Some(error) = &outcome.error {
                            if let Err(e) = self.chains.update_run_error(run_id, error).await {
                                tracing::error!(run_id = %run_id, error = %e, "failed to record run error");
                            }
                        }
                        self.finish_run(run_id, RunStatus::Failed).await;
                        return;
                    }
                }
            }
        }

        self.finish_run(run_id, RunStatus::Completed).await;
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) {
        if let Err(e) = self.chains.update_run_status(run_id, status).await {
            tracing::error!(run_id = %run_id, error = %e, "failed to update run status");
        } else {
            tracing::info!(run_id = %run_id, status = ?status, "chain run finished");
        }
    }

    /// Execute one step with its retry budget, persisting a StepRun as it
    /// progresses, and record its request/response in the template context
    /// on success.
    async fn execute_step(
        &self,
        run_id: Uuid,
        chain: &Chain,
        step: &ChainStep,
        trigger_data: &Value,
        ctx: &mut TemplateContext,
    ) -> StepOutcome {
        let now = Utc::now();
        let step_run = StepRun {
            id: Uuid::new_v4(),
            run_id,
            step_id: step.id,
            step_order: step.step_order,
            status: StepRunStatus::Pending,
            request_payload: None,
            response_code: None,
            response_body: None,
            attempt_count: 0,
            last_error: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.chains.create_step_run(&step_run).await {
            tracing::error!(run_id = %run_id, error = %e, "failed to create step run");
            return StepOutcome::failed(format!("failed to record step run: {e}"));
        }
        let step_run_id = step_run.id;

        let mut last_error = String::from("step failed");

        for attempt in 0..=step.max_retries.max(0) {
            if attempt > 0 {
                let backoff = Duration::from_secs((attempt as u64).pow(2));
                tracing::info!(
                    run_id = %run_id,
                    step_order = step.step_order,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    "retrying step"
                );
                tokio::time::sleep(backoff).await;
            }

            // Resolve the target on every attempt so a deletion mid-run is
            // observed.
            let subscription = match self.webhooks.get_subscription(step.webhook_id).await {
                Ok(Some(subscription)) => subscription,
                Ok(None) => {
                    let msg = format!("target subscription {} is missing", step.webhook_id);
                    self.abort_step_run(step_run_id, attempt, &msg).await;
                    return StepOutcome::failed(msg);
                }
                Err(e) => {
                    let msg = format!("failed to load target subscription: {e}");
                    self.abort_step_run(step_run_id, attempt, &msg).await;
                    return StepOutcome::failed(msg);
                }
            };

            // Validated at chain creation; re-checked here so a re-pointed
            // or re-tenanted target can never be called across tenants.
            if subscription.tenant_id != chain.tenant_id {
                let msg = format!(
                    "target subscription {} belongs to a different tenant",
                    subscription.id
                );
                self.abort_step_run(step_run_id, attempt, &msg).await;
                return StepOutcome::failed(msg);
            }

            let resolved_params = step
                .request_params
                .as_ref()
                .map(|params| template::resolve(params, ctx));

            let body_value = match build_step_body(step, trigger_data, resolved_params.clone()) {
                Ok(value) => value,
                Err(e) => {
                    let msg = format!("failed to serialize step payload: {e}");
                    self.abort_step_run(step_run_id, attempt, &msg).await;
                    return StepOutcome::failed(msg);
                }
            };
            let body = match serde_json::to_vec(&body_value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let msg = format!("failed to serialize step payload: {e}");
                    self.abort_step_run(step_run_id, attempt, &msg).await;
                    return StepOutcome::failed(msg);
                }
            };

            let signature = self.security.sign(&body, &subscription.secret);
            let mut req = self
                .client
                .post(&subscription.target_url)
                .header(CONTENT_TYPE, "application/json")
                .header("X-Loki-Signature", format!("sha256={signature}"))
                .header("X-Loki-Timestamp", Utc::now().to_rfc3339())
                .header("X-Loki-Event", &chain.trigger_event);
            if subscription.kind == SubscriptionKind::Private {
                if let Some(token) = &subscription.bearer_token {
                    req = req.header(AUTHORIZATION, format!("Bearer {token}"));
                }
            }

            match req.body(body).send().await {
                Ok(response) => {
                    let code = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    let truncated: String = text.chars().take(RESPONSE_BODY_CAP).collect();
                    let success = (200..300).contains(&code);
                    let client_error = (400..500).contains(&code);
                    let exhausted = attempt == step.max_retries || client_error;

                    let mut changes = StepRunChanges {
                        attempt_count: Some(attempt + 1),
                        request_payload: Some(body_value.clone()),
                        response_code: Some(i32::from(code)),
                        response_body: Some(truncated.clone()),
                        ..Default::default()
                    };

                    if success {
                        changes.status = Some(StepRunStatus::Sent);
                        changes.completed_at = Some(Utc::now());
                        self.apply_step_run_changes(step_run_id, changes).await;

                        let response_value = serde_json::from_str::<Value>(&text)
                            .unwrap_or(Value::String(truncated));
                        ctx.record_step(
                            step.step_order,
                            resolved_params.unwrap_or_else(|| Value::Object(Map::new())),
                            response_value,
                        );
                        return StepOutcome::ok();
                    }

                    last_error = format!("webhook returned status {code}");
                    changes.last_error = Some(last_error.clone());
                    if exhausted {
                        changes.status = Some(StepRunStatus::Failed);
                        changes.completed_at = Some(Utc::now());
                    }
                    self.apply_step_run_changes(step_run_id, changes).await;

                    if client_error {
                        return StepOutcome::failed(last_error);
                    }
                }
                Err(e) => {
                    last_error = format!("failed to send request: {e}");
                    let exhausted = attempt == step.max_retries;

                    let mut changes = StepRunChanges {
                        attempt_count: Some(attempt + 1),
                        request_payload: Some(body_value.clone()),
                        last_error: Some(last_error.clone()),
                        ..Default::default()
                    };
                    if exhausted {
                        changes.status = Some(StepRunStatus::Failed);
                        changes.completed_at = Some(Utc::now());
                    }
                    self.apply_step_run_changes(step_run_id, changes).await;
                }
            }

            tracing::warn!(
                run_id = %run_id,
                step_order = step.step_order,
                attempt = attempt + 1,
                error = %last_error,
                "step attempt failed"
            );
        }

        StepOutcome::failed(last_error)
    }

    /// Terminal failure before any (further) network attempt: target
    /// missing, cross-tenant target, or payload serialization failure.
    async fn abort_step_run(&self, step_run_id: Uuid, attempts_so_far: i32, error: &str) {
        let changes = StepRunChanges {
            status: Some(StepRunStatus::Failed),
            attempt_count: Some(attempts_so_far),
            last_error: Some(error.to_string()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        self.apply_step_run_changes(step_run_id, changes).await;
    }

    async fn apply_step_run_changes(&self, step_run_id: Uuid, changes: StepRunChanges) {
        if let Err(e) = self.chains.update_step_run(step_run_id, changes).await {
            tracing::error!(step_run_id = %step_run_id, error = %e, "failed to update step run");
        }
    }
}

/// Body sent to a step's target. Field order is the wire order.
#[derive(Debug, Serialize)]
struct StepRequestBody<'a> {
    step_name: &'a str,
    step_order: i32,
    trigger_data: &'a Value,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_params: Option<Value>,
}

fn build_step_body(
    step: &ChainStep,
    trigger_data: &Value,
    request_params: Option<Value>,
) -> Result<Value, serde_json::Error> {
    serde_json::to_value(StepRequestBody {
        step_name: &step.name,
        step_order: step.step_order,
        trigger_data,
        timestamp: Utc::now().to_rfc3339(),
        request_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_chain_step_defaults() {
        let step: NewChainStep = serde_json::from_value(json!({
            "webhook_id": Uuid::new_v4(),
            "name": "notify",
        }))
        .unwrap();
        assert_eq!(step.on_success, OnSuccess::Continue);
        assert_eq!(step.on_failure, OnFailure::Stop);
        assert_eq!(step.max_retries, 3);
        assert_eq!(step.delay_seconds, 0);
        assert!(step.request_params.is_none());
    }

    #[test]
    fn test_step_body_shape() {
        let step = ChainStep {
            id: Uuid::new_v4(),
            chain_id: Uuid::new_v4(),
            step_order: 2,
            webhook_id: Uuid::new_v4(),
            name: "charge".to_string(),
            description: String::new(),
            request_params: None,
            on_success: OnSuccess::Continue,
            on_failure: OnFailure::Stop,
            max_retries: 0,
            delay_seconds: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let body = build_step_body(&step, &json!({"order": "O1"}), Some(json!({"pid": "P"})))
            .unwrap();
        assert_eq!(body["step_name"], json!("charge"));
        assert_eq!(body["step_order"], json!(2));
        assert_eq!(body["trigger_data"], json!({"order": "O1"}));
        assert_eq!(body["request_params"], json!({"pid": "P"}));
        assert!(body["timestamp"].is_string());

        let without_params = build_step_body(&step, &json!({}), None).unwrap();
        assert!(without_params.get("request_params").is_none());
    }
}
