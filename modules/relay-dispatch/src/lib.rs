//! Command dispatcher: the single serialization and routing point.
//!
//! Commands from the gateway session and the API adapter land here.
//! Per-resource-key FIFO, bounded cross-key parallelism, idempotent
//! execution against whatever [`OutcomeStore`] is plugged in.

pub mod dispatcher;
pub mod retry;
pub mod traits;

pub use dispatcher::{Dispatcher, OutcomeWaiter};
pub use retry::RetryPolicy;
pub use traits::OutcomeStore;
