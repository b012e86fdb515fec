//! Cryptographic material for webhook deliveries.
//!
//! Two mechanisms authenticate every delivery: an HMAC-SHA256 signature over
//! the exact body bytes proves payload integrity, and (for private
//! subscriptions) an HS256 bearer capability token proves issuance for a
//! specific subscription. A timestamp window bounds replay.

use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Issuer claim stamped into every bearer capability token.
pub const TOKEN_ISSUER: &str = "loki-suite";

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unsupported signing algorithm")]
    UnsupportedAlgorithm,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("timestamp outside allowed tolerance")]
    TimestampOutOfWindow,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token")]
    TokenInvalid,

    #[error("failed to sign token")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Claims carried by a bearer capability token.
///
/// The token binds proof-of-issuance to one subscription: receivers check
/// `webhook_id` and `tenant_id` against the subscription being addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerClaims {
    pub sub: String,
    pub tenant_id: String,
    pub webhook_id: String,
    pub app_name: String,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Secrets minted for a new subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSecrets {
    /// Hex-encoded HMAC secret.
    pub secret: String,
    /// Bearer capability token, present for private subscriptions.
    pub bearer: Option<String>,
}

/// Produces and verifies the cryptographic material that authenticates
/// webhook deliveries. The signing key is immutable configuration.
#[derive(Clone)]
pub struct SecurityService {
    signing_key: String,
    secret_length: usize,
    token_lifetime_hours: i64,
}

impl SecurityService {
    pub fn new(
        signing_key: impl Into<String>,
        secret_length: usize,
        token_lifetime_hours: i64,
    ) -> Self {
        Self {
            signing_key: signing_key.into(),
            secret_length,
            token_lifetime_hours,
        }
    }

    /// Generate a fresh hex-encoded HMAC secret of the configured length.
    pub fn generate_secret(&self) -> String {
        let mut bytes = vec![0u8; self.secret_length];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Mint the secret (and, for private subscriptions, the bearer token)
    /// for a new subscription.
    pub fn mint_subscription_secrets(
        &self,
        is_private: bool,
        tenant_id: &str,
        webhook_id: &str,
        app_name: &str,
    ) -> Result<SubscriptionSecrets, SecurityError> {
        let bearer = if is_private {
            Some(self.mint_bearer(tenant_id, webhook_id, app_name)?)
        } else {
            None
        };

        Ok(SubscriptionSecrets {
            secret: self.generate_secret(),
            bearer,
        })
    }

    /// Mint an HS256 bearer capability token for one subscription.
    pub fn mint_bearer(
        &self,
        tenant_id: &str,
        webhook_id: &str,
        app_name: &str,
    ) -> Result<String, SecurityError> {
        let iat = Utc::now().timestamp();
        let claims = BearerClaims {
            sub: webhook_id.to_string(),
            tenant_id: tenant_id.to_string(),
            webhook_id: webhook_id.to_string(),
            app_name: app_name.to_string(),
            iss: TOKEN_ISSUER.to_string(),
            iat,
            nbf: iat,
            exp: iat + self.token_lifetime_hours * 3600,
        };

        encode(
            &Header::default(), // HS256
            &claims,
            &EncodingKey::from_secret(self.signing_key.as_bytes()),
        )
        .map_err(SecurityError::Signing)
    }

    /// Verify a bearer capability token: HS256 only, with signature, `exp`
    /// and `nbf` enforced. Returns the embedded claims.
    pub fn verify_bearer(&self, token: &str) -> Result<BearerClaims, SecurityError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;

        let data = decode::<BearerClaims>(
            token,
            &DecodingKey::from_secret(self.signing_key.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
            jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => {
                SecurityError::UnsupportedAlgorithm
            }
            _ => SecurityError::TokenInvalid,
        })?;

        Ok(data.claims)
    }

    /// HMAC-SHA256 over the exact payload bytes, hex-encoded.
    pub fn sign(&self, payload: &[u8], secret: &str) -> String {
        // HMAC-SHA256 accepts any key length, so this cannot fail
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC-SHA256 accepts any key length");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of a received signature against the one
    /// recomputed from the payload.
    pub fn verify_signature(&self, payload: &[u8], signature_hex: &str, secret: &str) -> bool {
        let expected = self.sign(payload, secret);
        expected.as_bytes().ct_eq(signature_hex.as_bytes()).into()
    }

    /// Accept an RFC3339 timestamp iff `|now - t| <= tolerance`.
    /// Unparsable timestamps are rejected.
    pub fn verify_timestamp(&self, timestamp: &str, tolerance_minutes: i64) -> bool {
        let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(timestamp) else {
            return false;
        };
        let delta = Utc::now().signed_duration_since(parsed.with_timezone(&Utc));
        delta.num_seconds().abs() <= tolerance_minutes * 60
    }
}

/// Extract the hex signature from a `sha256=<hex>` header value.
pub fn parse_signature_header(header: &str) -> Result<&str, SecurityError> {
    if header.is_empty() {
        return Err(SecurityError::MalformedHeader(
            "signature header is empty".to_string(),
        ));
    }
    header.strip_prefix("sha256=").ok_or_else(|| {
        SecurityError::MalformedHeader("signature header must use sha256= prefix".to_string())
    })
}

/// Extract the token from a `Bearer <token>` authorization header value.
pub fn parse_bearer_header(header: &str) -> Result<&str, SecurityError> {
    if header.is_empty() {
        return Err(SecurityError::MalformedHeader(
            "authorization header is empty".to_string(),
        ));
    }
    header.strip_prefix("Bearer ").ok_or_else(|| {
        SecurityError::MalformedHeader("authorization header must use Bearer scheme".to_string())
    })
}
