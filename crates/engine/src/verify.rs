//! Inbound delivery verification.
//!
//! Authenticates a request arriving at one of our own receive endpoints:
//! the HMAC signature over the raw body, the sender timestamp window, and
//! (for private subscriptions) the bearer capability token bound to the
//! subscription.

use std::sync::Arc;

use uuid::Uuid;

use loki_core::security::{
    parse_bearer_header, parse_signature_header, SecurityError, SecurityService,
};
use loki_db::models::SubscriptionKind;
use loki_db::repo::{RepoError, WebhookRepo};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("webhook subscription not found")]
    SubscriptionNotFound,

    #[error("webhook subscription is inactive")]
    SubscriptionInactive,

    #[error("authorization header is required for private webhooks")]
    MissingAuthorization,

    #[error("bearer token claims do not match webhook")]
    ClaimsMismatch,

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("storage failure: {0}")]
    Storage(#[from] RepoError),
}

pub struct DeliveryVerifier {
    webhooks: Arc<dyn WebhookRepo>,
    security: Arc<SecurityService>,
    tolerance_minutes: i64,
}

impl DeliveryVerifier {
    pub fn new(
        webhooks: Arc<dyn WebhookRepo>,
        security: Arc<SecurityService>,
        tolerance_minutes: i64,
    ) -> Self {
        Self {
            webhooks,
            security,
            tolerance_minutes,
        }
    }

    /// Verify a delivery addressed to subscription `webhook_id`.
    pub async fn verify_delivery(
        &self,
        webhook_id: Uuid,
        body: &[u8],
        signature_header: &str,
        timestamp_header: &str,
        auth_header: Option<&str>,
    ) -> Result<(), VerifyError> {
        let subscription = self
            .webhooks
            .get_subscription(webhook_id)
            .await?
            .ok_or(VerifyError::SubscriptionNotFound)?;
        if !subscription.is_active {
            return Err(VerifyError::SubscriptionInactive);
        }

        let signature = parse_signature_header(signature_header)?;
        if !self
            .security
            .verify_signature(body, signature, &subscription.secret)
        {
            return Err(SecurityError::SignatureMismatch.into());
        }

        if !self
            .security
            .verify_timestamp(timestamp_header, self.tolerance_minutes)
        {
            return Err(SecurityError::TimestampOutOfWindow.into());
        }

        if subscription.kind == SubscriptionKind::Private {
            let auth_header = auth_header.ok_or(VerifyError::MissingAuthorization)?;
            let token = parse_bearer_header(auth_header)?;
            let claims = self.security.verify_bearer(token)?;

            if claims.webhook_id != webhook_id.to_string()
                || claims.tenant_id != subscription.tenant_id
            {
                return Err(VerifyError::ClaimsMismatch);
            }
        }

        tracing::debug!(
            webhook_id = %webhook_id,
            tenant_id = %subscription.tenant_id,
            "webhook delivery verified"
        );
        Ok(())
    }
}
