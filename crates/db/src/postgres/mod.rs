//! Postgres-backed repository implementations.

mod chains;
mod webhooks;

pub use chains::PgChainRepo;
pub use webhooks::PgWebhookRepo;
