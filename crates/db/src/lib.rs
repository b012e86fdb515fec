pub mod memory;
pub mod models;
pub mod postgres;
pub mod repo;

pub use repo::{ChainRepo, RepoError, WebhookRepo};
