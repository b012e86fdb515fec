//! Event fan-out and chain execution engines.
//!
//! `fanout` delivers one incoming event to every matching subscription in
//! parallel and then hands the event to `chain` for workflow triggering.
//! The dependency is strictly one-way: chain execution never calls back
//! into fan-out. `verify` authenticates deliveries arriving at our own
//! receive endpoints.

pub mod chain;
pub mod error;
pub mod fanout;
pub mod verify;

pub use chain::{ChainExecutor, NewChain, NewChainStep, RunReceipt};
pub use error::EngineError;
pub use fanout::{DeliveryOutcome, DispatchRequest, EventDispatcher, EventResult};
pub use verify::{DeliveryVerifier, VerifyError};
