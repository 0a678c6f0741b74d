//! Core pipeline types. Platform-agnostic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;

/// Where a Command entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOrigin {
    Gateway,
    Api,
}

impl CommandOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOrigin::Gateway => "gateway",
            CommandOrigin::Api => "api",
        }
    }
}

/// What a Command asks the handler to do. A closed set: requests carrying
/// any other tag fail deserialization and surface as validation errors
/// rather than being silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Apply a durable state mutation described by the payload.
    Apply,
    /// Tear down state previously applied.
    Retract,
    /// Push an outbound message through the platform (rate limited).
    Deliver,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Apply => "apply",
            CommandKind::Retract => "retract",
            CommandKind::Deliver => "deliver",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "apply" => Some(CommandKind::Apply),
            "retract" => Some(CommandKind::Retract),
            "deliver" => Some(CommandKind::Deliver),
            _ => None,
        }
    }
}

/// The normalized unit of work. Built by the gateway session or the API
/// adapter, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Unique across the whole system; the store's primary key dedups on it.
    pub idempotency_key: String,
    /// Serialization partition. Commands sharing this key run in FIFO order.
    pub resource_key: String,
    pub kind: CommandKind,
    pub payload: serde_json::Value,
    pub origin: CommandOrigin,
    /// API-originated commands carry the caller's deadline. Expiry cancels
    /// the caller's wait, never an already-started handler.
    pub deadline: Option<DateTime<Utc>>,
}

impl Command {
    /// Create a command with a fresh random idempotency key.
    pub fn new(
        kind: CommandKind,
        resource_key: impl Into<String>,
        payload: serde_json::Value,
        origin: CommandOrigin,
    ) -> Self {
        Self {
            idempotency_key: Uuid::new_v4().to_string(),
            resource_key: resource_key.into(),
            kind,
            payload,
            origin,
            deadline: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Terminal state of a Command. Immutable once recorded; repeated
/// submission of the same idempotency key reads this back instead of
/// reapplying the effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub idempotency_key: String,
    pub status: OutcomeStatus,
    pub failure_kind: Option<FailureKind>,
    /// Handler-supplied summary of the side effect, for callers and audits.
    pub effect: Option<serde_json::Value>,
    pub attempts: i32,
    pub recorded_at: DateTime<Utc>,
}

impl Outcome {
    pub fn success(key: impl Into<String>, effect: serde_json::Value, attempts: i32) -> Self {
        Self {
            idempotency_key: key.into(),
            status: OutcomeStatus::Succeeded,
            failure_kind: None,
            effect: Some(effect),
            attempts,
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(key: impl Into<String>, kind: FailureKind, attempts: i32) -> Self {
        Self {
            idempotency_key: key.into(),
            status: OutcomeStatus::Failed,
            failure_kind: Some(kind),
            effect: None,
            attempts,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_commands_get_distinct_keys() {
        let a = Command::new(CommandKind::Apply, "r1", json!({}), CommandOrigin::Api);
        let b = Command::new(CommandKind::Apply, "r1", json!({}), CommandOrigin::Api);
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn builder_overrides_key_and_deadline() {
        let deadline = Utc::now();
        let cmd = Command::new(CommandKind::Deliver, "r1", json!({}), CommandOrigin::Gateway)
            .with_idempotency_key("abc")
            .with_deadline(deadline);
        assert_eq!(cmd.idempotency_key, "abc");
        assert_eq!(cmd.deadline, Some(deadline));
    }

    #[test]
    fn unknown_kind_is_rejected_by_serde() {
        let parsed: Result<CommandKind, _> = serde_json::from_str("\"escalate\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [CommandKind::Apply, CommandKind::Retract, CommandKind::Deliver] {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
    }
}
