use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::models::{Event, Subscription};
use crate::repo::{EventChanges, RepoError, SubscriptionChanges, WebhookRepo};

const SUBSCRIPTION_COLUMNS: &str = r#"id, tenant_id, app_name, target_url, subscribed_event,
       kind, secret, bearer_token, headers, query_params, payload_fragment,
       max_retries, retry_delay_seconds, is_active, created_at, updated_at"#;

/// Subscriptions and events stored in Postgres.
#[derive(Clone)]
pub struct PgWebhookRepo {
    pool: PgPool,
}

impl PgWebhookRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRepo for PgWebhookRepo {
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions
                (id, tenant_id, app_name, target_url, subscribed_event, kind,
                 secret, bearer_token, headers, query_params, payload_fragment,
                 max_retries, retry_delay_seconds, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.tenant_id)
        .bind(&subscription.app_name)
        .bind(&subscription.target_url)
        .bind(&subscription.subscribed_event)
        .bind(subscription.kind)
        .bind(&subscription.secret)
        .bind(&subscription.bearer_token)
        .bind(&subscription.headers)
        .bind(&subscription.query_params)
        .bind(&subscription.payload_fragment)
        .bind(subscription.max_retries)
        .bind(subscription.retry_delay_seconds)
        .bind(subscription.is_active)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, RepoError> {
        let row = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_active_subscriptions(
        &self,
        tenant_id: &str,
        event: &str,
    ) -> Result<Vec<Subscription>, RepoError> {
        let rows = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM webhook_subscriptions
            WHERE tenant_id = $1 AND subscribed_event = $2 AND is_active = true
            ORDER BY created_at
            "#
        ))
        .bind(tenant_id)
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Subscription>, i64), RepoError> {
        let rows = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM webhook_subscriptions
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(tenant_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhook_subscriptions WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;

        Ok((rows, total))
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        changes: SubscriptionChanges,
    ) -> Result<Subscription, RepoError> {
        if changes.is_empty() {
            return self.get_subscription(id).await?.ok_or(RepoError::NotFound);
        }

        let mut qb = QueryBuilder::new("UPDATE webhook_subscriptions SET ");
        let mut set = qb.separated(", ");

        if let Some(value) = changes.target_url {
            set.push("target_url = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.is_active {
            set.push("is_active = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.headers {
            set.push("headers = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.query_params {
            set.push("query_params = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.payload_fragment {
            set.push("payload_fragment = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.max_retries {
            set.push("max_retries = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.retry_delay_seconds {
            set.push("retry_delay_seconds = ").push_bind_unseparated(value);
        }
        set.push("updated_at = now()");

        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {SUBSCRIPTION_COLUMNS}"));

        let row = qb
            .build_query_as::<Subscription>()
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(RepoError::NotFound)
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_event(&self, event: &Event) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events
                (id, tenant_id, event_name, source, payload, status,
                 response_code, attempts, last_error, sent_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(event.id)
        .bind(&event.tenant_id)
        .bind(&event.event_name)
        .bind(&event.source)
        .bind(&event.payload)
        .bind(event.status)
        .bind(event.response_code)
        .bind(event.attempts)
        .bind(&event.last_error)
        .bind(event.sent_at)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_event(&self, id: Uuid, changes: EventChanges) -> Result<(), RepoError> {
        let mut qb = QueryBuilder::new("UPDATE webhook_events SET ");
        let mut set = qb.separated(", ");

        if let Some(value) = changes.status {
            set.push("status = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.response_code {
            set.push("response_code = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.attempts {
            set.push("attempts = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.last_error {
            set.push("last_error = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.sent_at {
            set.push("sent_at = ").push_bind_unseparated(value);
        }
        set.push("updated_at = now()");

        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}
