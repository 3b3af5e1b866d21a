//! Domain events and their wire formats.
//!
//! [`DomainEvent`] is the typed sum the composite publisher consumes. Each
//! variant knows its event type, aggregate type, and aggregate id — a
//! static registry in place of runtime reflection, populated at compile
//! time by the match arms below. Adding a variant without extending every
//! accessor is a compile error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{CommandState, CommandType, DecisionResult, Direction, SubjectType};

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRegistered {
    pub attempt_id: Uuid,
    pub org_id: Uuid,
    pub device_id: Uuid,
    pub area_id: Uuid,
    pub direction: Direction,
    pub auth_method: Option<String>,
    pub subject_type: SubjectType,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionMade {
    pub decision_id: Uuid,
    pub attempt_id: Uuid,
    pub org_id: Uuid,
    pub result: DecisionResult,
    pub reason_code: String,
    pub detail: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub policy_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEmitted {
    pub command_id: Uuid,
    pub attempt_id: Uuid,
    pub org_id: Uuid,
    pub device_id: Uuid,
    pub command_type: CommandType,
    pub message: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecuted {
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub command_id: Uuid,
    pub attempt_id: Uuid,
    pub device_id: Uuid,
    pub final_state: CommandState,
    pub at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub detail: Option<String>,
    pub external_id: Option<String>,
}

/// What kind of rule write produced a [`PolicyChanged`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyChangeType {
    Created,
    Updated,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChanged {
    pub org_id: Uuid,
    pub area_id: Uuid,
    pub rule_id: Uuid,
    pub change_type: PolicyChangeType,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateAllRequested {
    pub org_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// Every event the core emits, in one typed sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    AttemptRegistered(AttemptRegistered),
    DecisionMade(DecisionMade),
    CommandEmitted(CommandEmitted),
    CommandExecuted(CommandExecuted),
    PolicyChanged(PolicyChanged),
    InvalidateAllRequested(InvalidateAllRequested),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AttemptRegistered(_) => "access.attempt.registered",
            Self::DecisionMade(_) => "access.decision.made",
            Self::CommandEmitted(_) => "access.command.emitted",
            Self::CommandExecuted(_) => "access.command.executed",
            Self::PolicyChanged(_) => "policy.rule.changed",
            Self::InvalidateAllRequested(_) => "policy.invalidate_all.requested",
        }
    }

    pub fn aggregate_type(&self) -> &'static str {
        match self {
            Self::AttemptRegistered(_) => "attempt",
            Self::DecisionMade(_) => "attempt",
            Self::CommandEmitted(_) | Self::CommandExecuted(_) => "command",
            Self::PolicyChanged(_) => "rule",
            Self::InvalidateAllRequested(_) => "organization",
        }
    }

    /// The aggregate the event belongs to; doubles as the message key so
    /// per-aggregate ordering survives transport.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            Self::AttemptRegistered(e) => e.attempt_id,
            Self::DecisionMade(e) => e.attempt_id,
            Self::CommandEmitted(e) => e.command_id,
            Self::CommandExecuted(e) => e.command_id,
            Self::PolicyChanged(e) => e.rule_id,
            Self::InvalidateAllRequested(e) => e.org_id,
        }
    }

    pub fn org_id(&self) -> Uuid {
        match self {
            Self::AttemptRegistered(e) => e.org_id,
            Self::DecisionMade(e) => e.org_id,
            Self::CommandEmitted(e) => e.org_id,
            Self::CommandExecuted(e) => e.org_id,
            Self::PolicyChanged(e) => e.org_id,
            Self::InvalidateAllRequested(e) => e.org_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::AttemptRegistered(e) => e.occurred_at,
            Self::DecisionMade(e) => e.decided_at,
            Self::CommandEmitted(e) => e.sent_at,
            Self::CommandExecuted(e) => e.at,
            Self::PolicyChanged(e) => e.occurred_at,
            Self::InvalidateAllRequested(e) => e.occurred_at,
        }
    }

    /// Serialize only the payload (no tag) for the outbox `payload` column.
    pub fn payload_json(&self) -> Value {
        // Payload structs are plain serde data; serialization cannot fail.
        match self {
            Self::AttemptRegistered(e) => serde_json::to_value(e),
            Self::DecisionMade(e) => serde_json::to_value(e),
            Self::CommandEmitted(e) => serde_json::to_value(e),
            Self::CommandExecuted(e) => serde_json::to_value(e),
            Self::PolicyChanged(e) => serde_json::to_value(e),
            Self::InvalidateAllRequested(e) => serde_json::to_value(e),
        }
        .unwrap_or(Value::Null)
    }

    /// Stable audit dedup key: `org|type|aggregate|occurred_at_micros`.
    pub fn audit_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.org_id(),
            self.event_type(),
            self.aggregate_id(),
            self.occurred_at().timestamp_micros()
        )
    }
}

// ---------------------------------------------------------------------------
// EventEnvelope — dispatched wire format
// ---------------------------------------------------------------------------

/// The message shape the dispatcher hands to transport. `payload` is the
/// serialized JSON of the event payload; `aggregate_id` is the message key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id_event: Uuid,
    pub org_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: String,
}

// ---------------------------------------------------------------------------
// DLQ / parking-lot wire formats
// ---------------------------------------------------------------------------

/// Diagnostic wrapper the DLQ handler produces around a failed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqMessage {
    pub source: String,
    pub original_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_envelope: Option<EventEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_message: Option<String>,
    pub error_type: String,
    pub error_message: String,
    pub failed_at_utc: DateTime<Utc>,
}
