//! Resumable streaming connection to the platform gateway.
//!
//! The session owns sequencing, heartbeat liveness, and the resume
//! protocol, and turns actionable gateway events into Commands with
//! deterministic idempotency keys so resume replays dedup downstream.

pub mod session;
pub mod transport;
pub mod wire;

pub use session::{GatewaySession, SessionEvent};
pub use transport::{GatewayConnector, GatewayError, GatewayTransport, WsConnector};
pub use wire::{DispatchEvent, GatewayMessage};
