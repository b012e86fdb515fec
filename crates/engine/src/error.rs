use loki_db::repo::RepoError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("chain not found")]
    ChainNotFound,

    #[error("chain is not active")]
    ChainInactive,

    #[error("storage failure: {0}")]
    Storage(#[from] RepoError),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}
