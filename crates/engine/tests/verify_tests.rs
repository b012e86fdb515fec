//! Integration tests for inbound delivery verification.

mod common;

use chrono::{Duration, Utc};
use common::*;
use uuid::Uuid;

use loki_core::security::SecurityError;
use loki_db::models::SubscriptionKind;
use loki_db::repo::WebhookRepo;
use loki_engine::VerifyError;

struct PrivateFixture {
    webhook_id: Uuid,
    secret: String,
    bearer: String,
}

async fn private_subscription(h: &TestHarness) -> PrivateFixture {
    let mut sub = subscription(TENANT_A, "order.placed", "https://example.com/hook", "");
    let secrets = h
        .security
        .mint_subscription_secrets(true, TENANT_A, &sub.id.to_string(), &sub.app_name)
        .unwrap();
    sub.kind = SubscriptionKind::Private;
    sub.secret = secrets.secret.clone();
    sub.bearer_token = secrets.bearer.clone();
    h.webhooks.create_subscription(&sub).await.unwrap();

    PrivateFixture {
        webhook_id: sub.id,
        secret: secrets.secret,
        bearer: secrets.bearer.unwrap(),
    }
}

#[tokio::test]
async fn test_private_verification_round_trip() {
    let h = harness();
    let v = verifier(&h);
    let fixture = private_subscription(&h).await;

    let body = br#"{"event":"order.placed","payload":{"id":"O1"}}"#;
    let signature = h.security.sign(body, &fixture.secret);

    v.verify_delivery(
        fixture.webhook_id,
        body,
        &format!("sha256={signature}"),
        &Utc::now().to_rfc3339(),
        Some(&format!("Bearer {}", fixture.bearer)),
    )
    .await
    .expect("valid delivery verifies");
}

#[tokio::test]
async fn test_stale_timestamp_rejected() {
    let h = harness();
    let v = verifier(&h);
    let fixture = private_subscription(&h).await;

    let body = b"payload";
    let signature = h.security.sign(body, &fixture.secret);
    let stale = (Utc::now() - Duration::minutes(10)).to_rfc3339();

    let err = v
        .verify_delivery(
            fixture.webhook_id,
            body,
            &format!("sha256={signature}"),
            &stale,
            Some(&format!("Bearer {}", fixture.bearer)),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Security(SecurityError::TimestampOutOfWindow)
    ));
}

#[tokio::test]
async fn test_tampered_body_rejected() {
    let h = harness();
    let v = verifier(&h);
    let fixture = private_subscription(&h).await;

    let signature = h.security.sign(b"original body", &fixture.secret);

    let err = v
        .verify_delivery(
            fixture.webhook_id,
            b"tampered body",
            &format!("sha256={signature}"),
            &Utc::now().to_rfc3339(),
            Some(&format!("Bearer {}", fixture.bearer)),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Security(SecurityError::SignatureMismatch)
    ));
}

#[tokio::test]
async fn test_bearer_for_other_webhook_rejected() {
    let h = harness();
    let v = verifier(&h);
    let fixture = private_subscription(&h).await;

    // Token minted for a different subscription id.
    let foreign_bearer = h
        .security
        .mint_bearer(TENANT_A, &Uuid::new_v4().to_string(), "test-app")
        .unwrap();

    let body = b"payload";
    let signature = h.security.sign(body, &fixture.secret);

    let err = v
        .verify_delivery(
            fixture.webhook_id,
            body,
            &format!("sha256={signature}"),
            &Utc::now().to_rfc3339(),
            Some(&format!("Bearer {foreign_bearer}")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::ClaimsMismatch));
}

#[tokio::test]
async fn test_private_without_authorization_rejected() {
    let h = harness();
    let v = verifier(&h);
    let fixture = private_subscription(&h).await;

    let body = b"payload";
    let signature = h.security.sign(body, &fixture.secret);

    let err = v
        .verify_delivery(
            fixture.webhook_id,
            body,
            &format!("sha256={signature}"),
            &Utc::now().to_rfc3339(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::MissingAuthorization));
}

#[tokio::test]
async fn test_public_subscription_needs_no_bearer() {
    let h = harness();
    let v = verifier(&h);

    let sub = subscription(TENANT_A, "order.placed", "https://example.com/hook", "pub-secret");
    h.webhooks.create_subscription(&sub).await.unwrap();

    let body = b"payload";
    let signature = h.security.sign(body, "pub-secret");

    v.verify_delivery(
        sub.id,
        body,
        &format!("sha256={signature}"),
        &Utc::now().to_rfc3339(),
        None,
    )
    .await
    .expect("public delivery verifies without a bearer");
}

#[tokio::test]
async fn test_unknown_subscription_rejected() {
    let h = harness();
    let v = verifier(&h);

    let err = v
        .verify_delivery(
            Uuid::new_v4(),
            b"payload",
            "sha256=00",
            &Utc::now().to_rfc3339(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::SubscriptionNotFound));
}

#[tokio::test]
async fn test_inactive_subscription_rejected() {
    let h = harness();
    let v = verifier(&h);

    let mut sub = subscription(TENANT_A, "order.placed", "https://example.com/hook", "sec");
    sub.is_active = false;
    h.webhooks.create_subscription(&sub).await.unwrap();

    let body = b"payload";
    let signature = h.security.sign(body, "sec");

    let err = v
        .verify_delivery(
            sub.id,
            body,
            &format!("sha256={signature}"),
            &Utc::now().to_rfc3339(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::SubscriptionInactive));
}

#[tokio::test]
async fn test_malformed_signature_header_rejected() {
    let h = harness();
    let v = verifier(&h);

    let sub = subscription(TENANT_A, "order.placed", "https://example.com/hook", "sec");
    h.webhooks.create_subscription(&sub).await.unwrap();

    let err = v
        .verify_delivery(
            sub.id,
            b"payload",
            "md5=abc",
            &Utc::now().to_rfc3339(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Security(SecurityError::MalformedHeader(_))
    ));
}
