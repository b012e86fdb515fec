use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub api_bind: String,
    /// Base URL advertised in generated receive endpoints.
    pub base_url: String,
    /// Process-wide key for signing bearer capability tokens.
    pub signing_key: String,
    pub token_lifetime_hours: i64,
    /// Length in bytes of generated HMAC secrets.
    pub secret_length: usize,
    pub timestamp_tolerance_minutes: i64,
    pub delivery_timeout_seconds: u64,
    pub default_max_retries: i32,
    pub default_retry_delay_seconds: i32,
}

impl Settings {
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let database_url =
            std::env::var("DATABASE_URL").or_else(|_| std::env::var("LOKI_DATABASE_URL"))?;
        let api_bind =
            std::env::var("LOKI_API_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let base_url =
            std::env::var("LOKI_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        let signing_key =
            std::env::var("LOKI_SIGNING_KEY").or_else(|_| std::env::var("JWT_SECRET"))?;
        let token_lifetime_hours = env_parse("LOKI_TOKEN_LIFETIME_HOURS", 24);
        let secret_length = env_parse("LOKI_SECRET_LENGTH", 32);
        let timestamp_tolerance_minutes = env_parse("LOKI_TIMESTAMP_TOLERANCE_MINUTES", 5);
        let delivery_timeout_seconds = env_parse("LOKI_DELIVERY_TIMEOUT_SECONDS", 30);
        let default_max_retries = env_parse("LOKI_DEFAULT_MAX_RETRIES", 3);
        let default_retry_delay_seconds = env_parse("LOKI_DEFAULT_RETRY_DELAY_SECONDS", 5);

        Ok(Self {
            database_url,
            api_bind,
            base_url,
            signing_key,
            token_lifetime_hours,
            secret_length,
            timestamp_tolerance_minutes,
            delivery_timeout_seconds,
            default_max_retries,
            default_retry_delay_seconds,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
